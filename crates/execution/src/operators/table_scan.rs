//! Stored-relation scan operator.

use std::sync::Arc;

use quarry_common::{NumaNodeId, OpIndex, PartitionId, QueryId, Result};
use quarry_storage::{BlockManager, InsertDestination, Relation};

use crate::container::WorkOrdersContainer;
use crate::context::QueryContext;
use crate::operators::{with_pinned, OperatorEnv, RelationalOperator};
use crate::work_order::WorkOrder;

/// Streams every block of a stored relation into the output destination.
///
/// One normal work order per input block; all orders for a partition are
/// generated on the first call, so generation completes immediately.
pub struct TableScanOperator {
    query_id: QueryId,
    op_index: OpIndex,
    relation: Arc<Relation>,
    output_destination_index: usize,
    started: Vec<bool>,
    num_output_partitions: usize,
}

impl TableScanOperator {
    pub(crate) fn new(
        query_id: QueryId,
        op_index: OpIndex,
        relation: Arc<Relation>,
        output_destination_index: usize,
        num_output_partitions: usize,
    ) -> Self {
        let num_partitions = relation.num_partitions;
        Self {
            query_id,
            op_index,
            relation,
            output_destination_index,
            started: vec![false; num_partitions],
            num_output_partitions,
        }
    }
}

impl RelationalOperator for TableScanOperator {
    fn name(&self) -> &'static str {
        "TableScan"
    }

    fn num_partitions(&self) -> usize {
        self.started.len()
    }

    fn num_output_partitions(&self) -> usize {
        self.num_output_partitions
    }

    fn get_all_work_orders(
        &mut self,
        partition_id: PartitionId,
        container: &mut WorkOrdersContainer,
        context: &QueryContext,
        env: &OperatorEnv,
    ) -> Result<bool> {
        if !self.started[partition_id] {
            self.started[partition_id] = true;
            let destination = Arc::clone(context.insert_destination(self.output_destination_index)?);
            for block_id in env
                .storage
                .blocks_for_partition(self.relation.id, partition_id)
            {
                let numa_node = env.storage.block_numa_node(block_id);
                container.add_normal_work_order(
                    self.op_index,
                    partition_id,
                    Box::new(TableScanWorkOrder {
                        query_id: self.query_id,
                        op_index: self.op_index,
                        partition_id,
                        block_id,
                        numa_node,
                        storage: Arc::clone(&env.storage),
                        destination: Arc::clone(&destination),
                    }),
                );
            }
        }
        Ok(true)
    }

    fn done_feeding_input(&mut self, _partition_id: PartitionId) {}

    fn feed_input_block(
        &mut self,
        _block_id: quarry_common::BlockId,
        _relation_id: quarry_common::RelationId,
        _partition_id: PartitionId,
    ) {
    }
}

struct TableScanWorkOrder {
    query_id: QueryId,
    op_index: OpIndex,
    partition_id: PartitionId,
    block_id: quarry_common::BlockId,
    numa_node: Option<NumaNodeId>,
    storage: Arc<BlockManager>,
    destination: Arc<InsertDestination>,
}

impl WorkOrder for TableScanWorkOrder {
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
            self.destination
                .append(self.partition_id, block.batch().clone())
        })
    }
}
