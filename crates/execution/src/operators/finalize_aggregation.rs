//! Aggregation-state finalization operator.

use std::sync::Arc;

use quarry_common::{BlockId, OpIndex, PartitionId, QueryId, RelationId, Result};
use quarry_storage::InsertDestination;

use crate::aggregation::AggregationState;
use crate::container::WorkOrdersContainer;
use crate::context::QueryContext;
use crate::operators::{OperatorEnv, RelationalOperator};
use crate::work_order::WorkOrder;

/// Emits one finalization work order per aggregation-state partition,
/// writing `(key, value)` tuples into the output destination.
///
/// The blocking edge from the accumulating operator guarantees the state is
/// complete (and sealed, when partitioned) before any order is dispatched.
/// The finalization partition count is read from the live state, never from
/// the serialized plan.
pub struct FinalizeAggregationOperator {
    query_id: QueryId,
    op_index: OpIndex,
    agg_state_index: usize,
    output_destination_index: usize,
    started: bool,
}

impl FinalizeAggregationOperator {
    pub(crate) fn new(
        query_id: QueryId,
        op_index: OpIndex,
        agg_state_index: usize,
        output_destination_index: usize,
    ) -> Self {
        Self {
            query_id,
            op_index,
            agg_state_index,
            output_destination_index,
            started: false,
        }
    }
}

impl RelationalOperator for FinalizeAggregationOperator {
    fn name(&self) -> &'static str {
        "FinalizeAggregation"
    }

    fn num_partitions(&self) -> usize {
        1
    }

    fn num_output_partitions(&self) -> usize {
        1
    }

    fn get_all_work_orders(
        &mut self,
        _partition_id: PartitionId,
        container: &mut WorkOrdersContainer,
        context: &QueryContext,
        _env: &OperatorEnv,
    ) -> Result<bool> {
        if !self.started {
            self.started = true;
            let state = context.aggregation_state(self.agg_state_index)?;
            let destination = context.insert_destination(self.output_destination_index)?;
            for state_partition in 0..state.num_finalization_partitions() {
                container.add_normal_work_order(
                    self.op_index,
                    0,
                    Box::new(FinalizeAggregationWorkOrder {
                        query_id: self.query_id,
                        op_index: self.op_index,
                        state_partition,
                        state: Arc::clone(state),
                        destination: Arc::clone(destination),
                    }),
                );
            }
        }
        Ok(true)
    }

    fn done_feeding_input(&mut self, _partition_id: PartitionId) {}

    fn feed_input_block(
        &mut self,
        _block_id: BlockId,
        _relation_id: RelationId,
        _partition_id: PartitionId,
    ) {
    }
}

struct FinalizeAggregationWorkOrder {
    query_id: QueryId,
    op_index: OpIndex,
    state_partition: PartitionId,
    state: Arc<AggregationState>,
    destination: Arc<InsertDestination>,
}

impl WorkOrder for FinalizeAggregationWorkOrder {
    fn query_id(&self) -> QueryId {
        self.query_id
    }

    fn op_index(&self) -> OpIndex {
        self.op_index
    }

    fn partition_id(&self) -> PartitionId {
        0
    }

    fn execute(&mut self) -> Result<()> {
        self.state
            .finalize_partition(self.state_partition, &self.destination)
            .map(|_| ())
    }
}
