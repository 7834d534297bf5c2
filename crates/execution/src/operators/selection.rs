//! Predicate filter and scalar projection operator.

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use quarry_common::{
    BlockId, NumaNodeId, OpIndex, PartitionId, QuarryError, QueryId, RelationId, Result,
};
use quarry_plan::{CompiledPredicate, CompiledScalar};
use quarry_storage::{BlockManager, InsertDestination, Relation};

use crate::container::WorkOrdersContainer;
use crate::context::QueryContext;
use crate::operators::{with_pinned, BlockFeed, OperatorEnv, RelationalOperator};
use crate::work_order::WorkOrder;

/// Filters input blocks through an optional predicate and projects scalar
/// expressions over the survivors.
///
/// Accepts stored input (all blocks available up front) or pipelined input
/// (blocks arrive through `feed_input_block`); either way one normal work
/// order is emitted per input block.
pub struct SelectionOperator {
    query_id: QueryId,
    op_index: OpIndex,
    input_relation: Arc<Relation>,
    feed: BlockFeed,
    predicate_index: Option<usize>,
    projection_indexes: Vec<usize>,
    output_destination_index: usize,
    num_partitions: usize,
    num_output_partitions: usize,
}

impl SelectionOperator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        query_id: QueryId,
        op_index: OpIndex,
        input_relation: Arc<Relation>,
        input_is_stored: bool,
        predicate_index: Option<usize>,
        projection_indexes: Vec<usize>,
        output_destination_index: usize,
        num_partitions: usize,
        num_output_partitions: usize,
    ) -> Self {
        Self {
            query_id,
            op_index,
            input_relation,
            feed: BlockFeed::new(num_partitions, input_is_stored),
            predicate_index,
            projection_indexes,
            output_destination_index,
            num_partitions,
            num_output_partitions,
        }
    }
}

impl RelationalOperator for SelectionOperator {
    fn name(&self) -> &'static str {
        "Selection"
    }

    fn num_partitions(&self) -> usize {
        self.num_partitions
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
        let new_blocks = self
            .feed
            .poll(partition_id, self.input_relation.id, &env.storage);
        if !new_blocks.is_empty() {
            let destination =
                Arc::clone(context.insert_destination(self.output_destination_index)?);
            let predicate = match self.predicate_index {
                Some(index) => Some(Arc::clone(context.predicate(index)?)),
                None => None,
            };
            let projections = self
                .projection_indexes
                .iter()
                .map(|index| context.scalar(*index).map(Arc::clone))
                .collect::<Result<Vec<_>>>()?;
            for block_id in new_blocks {
                container.add_normal_work_order(
                    self.op_index,
                    partition_id,
                    Box::new(SelectionWorkOrder {
                        query_id: self.query_id,
                        op_index: self.op_index,
                        partition_id,
                        block_id,
                        numa_node: env.storage.block_numa_node(block_id),
                        storage: Arc::clone(&env.storage),
                        predicate: predicate.clone(),
                        projections: projections.clone(),
                        destination: Arc::clone(&destination),
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

struct SelectionWorkOrder {
    query_id: QueryId,
    op_index: OpIndex,
    partition_id: PartitionId,
    block_id: BlockId,
    numa_node: Option<NumaNodeId>,
    storage: Arc<BlockManager>,
    predicate: Option<CompiledPredicate>,
    projections: Vec<CompiledScalar>,
    destination: Arc<InsertDestination>,
}

impl WorkOrder for SelectionWorkOrder {
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
            let batch = block.batch();
            let filtered = match &self.predicate {
                Some(predicate) => {
                    let mask = predicate.evaluate(batch)?;
                    arrow::compute::filter_record_batch(batch, &mask)
                        .map_err(|e| QuarryError::Execution(format!("filter failed: {e}")))?
                }
                None => batch.clone(),
            };
            if filtered.num_rows() == 0 {
                return Ok(());
            }
            let schema = self.destination.relation().schema_ref();
            let out = if self.projections.is_empty() {
                RecordBatch::try_new(schema, filtered.columns().to_vec())
            } else {
                let columns = self
                    .projections
                    .iter()
                    .map(|scalar| scalar.evaluate(&filtered))
                    .collect::<Result<Vec<_>>>()?;
                RecordBatch::try_new(schema, columns)
            }
            .map_err(|e| QuarryError::Execution(format!("projection batch build failed: {e}")))?;
            self.destination.append(self.partition_id, out)
        })
    }
}
