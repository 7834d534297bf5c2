//! Aggregation-state accumulation operator.

use std::sync::Arc;

use quarry_common::{BlockId, NumaNodeId, OpIndex, PartitionId, QueryId, RelationId, Result};
use quarry_storage::{BlockManager, Relation};

use crate::aggregation::AggregationState;
use crate::container::WorkOrdersContainer;
use crate::context::QueryContext;
use crate::operators::{with_pinned, BlockFeed, OperatorEnv, RelationalOperator};
use crate::work_order::WorkOrder;

/// Accumulates input blocks into the shared aggregation state.
///
/// One normal work order per input block. A partitioned state declares a
/// rebuild phase: after every normal order completes, one rebuild order per
/// state partition seals it so finalization may read it.
pub struct AggregationOperator {
    query_id: QueryId,
    op_index: OpIndex,
    input_relation: Arc<Relation>,
    feed: BlockFeed,
    agg_state_index: usize,
    num_partitions: usize,
    num_output_partitions: usize,
    partitioned_state: bool,
    rebuild_started: Vec<bool>,
}

impl AggregationOperator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        query_id: QueryId,
        op_index: OpIndex,
        input_relation: Arc<Relation>,
        input_is_stored: bool,
        agg_state_index: usize,
        num_partitions: usize,
        num_output_partitions: usize,
        partitioned_state: bool,
    ) -> Self {
        Self {
            query_id,
            op_index,
            input_relation,
            feed: BlockFeed::new(num_partitions, input_is_stored),
            agg_state_index,
            num_partitions,
            num_output_partitions,
            partitioned_state,
            rebuild_started: vec![false; num_output_partitions],
        }
    }
}

impl RelationalOperator for AggregationOperator {
    fn name(&self) -> &'static str {
        "Aggregation"
    }

    fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    fn num_output_partitions(&self) -> usize {
        self.num_output_partitions
    }

    fn needs_rebuild(&self) -> bool {
        self.partitioned_state
    }

    fn get_all_work_orders(
        &mut self,
        partition_id: PartitionId,
        container: &mut WorkOrdersContainer,
        context: &QueryContext,
        env: &OperatorEnv,
    ) -> Result<bool> {
        let new_blocks = self
            .feed
            .poll(partition_id, self.input_relation.id, &env.storage);
        if !new_blocks.is_empty() {
            let state = Arc::clone(context.aggregation_state(self.agg_state_index)?);
            for block_id in new_blocks {
                container.add_normal_work_order(
                    self.op_index,
                    partition_id,
                    Box::new(AggregationWorkOrder {
                        query_id: self.query_id,
                        op_index: self.op_index,
                        partition_id,
                        block_id,
                        numa_node: env.storage.block_numa_node(block_id),
                        storage: Arc::clone(&env.storage),
                        state: Arc::clone(&state),
                    }),
                );
            }
        }
        Ok(self.feed.generation_done(partition_id))
    }

    fn get_all_rebuild_work_orders(
        &mut self,
        partition_id: PartitionId,
        container: &mut WorkOrdersContainer,
        context: &QueryContext,
        _env: &OperatorEnv,
    ) -> Result<bool> {
        if !self.rebuild_started[partition_id] {
            self.rebuild_started[partition_id] = true;
            let state = context.aggregation_state(self.agg_state_index)?;
            container.add_rebuild_work_order(
                self.op_index,
                partition_id,
                Box::new(SealAggregationWorkOrder {
                    query_id: self.query_id,
                    op_index: self.op_index,
                    state_partition: partition_id,
                    state: Arc::clone(state),
                }),
            );
        }
        Ok(true)
    }

    fn done_feeding_input(&mut self, partition_id: PartitionId) {
        self.feed.set_done_feeding(partition_id);
    }

    fn feed_input_block(
        &mut self,
        block_id: BlockId,
        relation_id: RelationId,
        partition_id: PartitionId,
    ) {
        if relation_id == self.input_relation.id {
            self.feed.feed(partition_id, block_id);
        }
    }
}

struct AggregationWorkOrder {
    query_id: QueryId,
    op_index: OpIndex,
    partition_id: PartitionId,
    block_id: BlockId,
    numa_node: Option<NumaNodeId>,
    storage: Arc<BlockManager>,
    state: Arc<AggregationState>,
}

impl WorkOrder for AggregationWorkOrder {
    fn query_id(&self) -> QueryId {
        self.query_id
    }

    fn op_index(&self) -> OpIndex {
        self.op_index
    }

    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    fn preferred_numa_node(&self) -> Option<NumaNodeId> {
        self.numa_node
    }

    fn execute(&mut self) -> Result<()> {
        with_pinned(&self.storage, self.block_id, self.numa_node, |block| {
            self.state.accumulate(block.batch())
        })
    }
}

struct SealAggregationWorkOrder {
    query_id: QueryId,
    op_index: OpIndex,
    state_partition: PartitionId,
    state: Arc<AggregationState>,
}

impl WorkOrder for SealAggregationWorkOrder {
    fn query_id(&self) -> QueryId {
        self.query_id
    }

    fn op_index(&self) -> OpIndex {
        self.op_index
    }

    fn partition_id(&self) -> PartitionId {
        self.state_partition
    }

    fn execute(&mut self) -> Result<()> {
        self.state.seal_partition(self.state_partition)
    }
}
