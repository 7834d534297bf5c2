//! Join hash-table build operator.

use std::sync::Arc;

use quarry_common::{
    AttributeId, BlockId, NumaNodeId, OpIndex, PartitionId, QueryId, RelationId, Result,
};
use quarry_storage::{BlockManager, Relation};

use crate::container::WorkOrdersContainer;
use crate::context::QueryContext;
use crate::hash_table::JoinHashTable;
use crate::operators::{with_pinned, BlockFeed, OperatorEnv, RelationalOperator};
use crate::work_order::WorkOrder;

/// Inserts every build-side tuple into the partitioned join hash table.
///
/// One normal work order per input block; concurrent orders for the same
/// partition serialize inside the table.
pub struct BuildHashOperator {
    query_id: QueryId,
    op_index: OpIndex,
    input_relation: Arc<Relation>,
    feed: BlockFeed,
    key_attr: AttributeId,
    hash_table_index: usize,
    num_partitions: usize,
}

impl BuildHashOperator {
    pub(crate) fn new(
        query_id: QueryId,
        op_index: OpIndex,
        input_relation: Arc<Relation>,
        input_is_stored: bool,
        key_attr: AttributeId,
        hash_table_index: usize,
        num_partitions: usize,
    ) -> Self {
        Self {
            query_id,
            op_index,
            input_relation,
            feed: BlockFeed::new(num_partitions, input_is_stored),
            key_attr,
            hash_table_index,
            num_partitions,
        }
    }
}

impl RelationalOperator for BuildHashOperator {
    fn name(&self) -> &'static str {
        "BuildHash"
    }

    fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    fn num_output_partitions(&self) -> usize {
        self.num_partitions
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
            let hash_table = Arc::clone(context.join_hash_table(self.hash_table_index)?);
            for block_id in new_blocks {
                container.add_normal_work_order(
                    self.op_index,
                    partition_id,
                    Box::new(BuildHashWorkOrder {
                        query_id: self.query_id,
                        op_index: self.op_index,
                        partition_id,
                        block_id,
                        numa_node: env.storage.block_numa_node(block_id),
                        key_attr: self.key_attr,
                        storage: Arc::clone(&env.storage),
                        hash_table: Arc::clone(&hash_table),
                    }),
                );
            }
        }
        Ok(self.feed.generation_done(partition_id))
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

struct BuildHashWorkOrder {
    query_id: QueryId,
    op_index: OpIndex,
    partition_id: PartitionId,
    block_id: BlockId,
    numa_node: Option<NumaNodeId>,
    key_attr: AttributeId,
    storage: Arc<BlockManager>,
    hash_table: Arc<JoinHashTable>,
}

impl WorkOrder for BuildHashWorkOrder {
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
            let keys = block.batch().column(self.key_attr).clone();
            self.hash_table
                .put_batch(self.partition_id, self.block_id, &keys)
        })
    }
}
