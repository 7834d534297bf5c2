//! Whole-partition sort operator.

use std::sync::Arc;

use arrow::compute::{concat_batches, lexsort_to_indices, take, SortColumn, SortOptions};
use arrow::record_batch::RecordBatch;
use quarry_common::{BlockId, OpIndex, PartitionId, QuarryError, QueryId, RelationId, Result};
use quarry_plan::SortKeySpec;
use quarry_storage::{BlockManager, InsertDestination, Relation};

use crate::container::WorkOrdersContainer;
use crate::context::QueryContext;
use crate::operators::{OperatorEnv, RelationalOperator};
use crate::work_order::WorkOrder;

/// Sorts each input partition as a whole and writes the ordered tuples out.
///
/// Strictly blocking: the input relation must be fully stored, so a single
/// work order per partition reads every block of it.
pub struct SortOperator {
    query_id: QueryId,
    op_index: OpIndex,
    input_relation: Arc<Relation>,
    sort_keys: Vec<SortKeySpec>,
    output_destination_index: usize,
    started: Vec<bool>,
}

impl SortOperator {
    pub(crate) fn new(
        query_id: QueryId,
        op_index: OpIndex,
        input_relation: Arc<Relation>,
        sort_keys: Vec<SortKeySpec>,
        output_destination_index: usize,
        num_partitions: usize,
    ) -> Self {
        Self {
            query_id,
            op_index,
            input_relation,
            sort_keys,
            output_destination_index,
            started: vec![false; num_partitions],
        }
    }
}

impl RelationalOperator for SortOperator {
    fn name(&self) -> &'static str {
        "Sort"
    }

    fn num_partitions(&self) -> usize {
        self.started.len()
    }

    fn num_output_partitions(&self) -> usize {
        self.started.len()
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
            container.add_normal_work_order(
                self.op_index,
                partition_id,
                Box::new(SortPartitionWorkOrder {
                    query_id: self.query_id,
                    op_index: self.op_index,
                    partition_id,
                    relation: Arc::clone(&self.input_relation),
                    sort_keys: self.sort_keys.clone(),
                    storage: Arc::clone(&env.storage),
                    destination: Arc::clone(
                        context.insert_destination(self.output_destination_index)?,
                    ),
                }),
            );
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

struct SortPartitionWorkOrder {
    query_id: QueryId,
    op_index: OpIndex,
    partition_id: PartitionId,
    relation: Arc<Relation>,
    sort_keys: Vec<SortKeySpec>,
    storage: Arc<BlockManager>,
    destination: Arc<InsertDestination>,
}

impl WorkOrder for SortPartitionWorkOrder {
    fn query_id(&self) -> QueryId {
        self.query_id
    }

    fn op_index(&self) -> OpIndex {
        self.op_index
    }

    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    fn execute(&mut self) -> Result<()> {
        let block_ids = self
            .storage
            .blocks_for_partition(self.relation.id, self.partition_id);
        if block_ids.is_empty() {
            return Ok(());
        }
        for block_id in &block_ids {
            self.storage.pin(*block_id)?;
        }
        let result = self.sort_blocks(&block_ids);
        for block_id in &block_ids {
            self.storage.unpin(*block_id)?;
        }
        result
    }
}

impl SortPartitionWorkOrder {
    fn sort_blocks(&self, block_ids: &[quarry_common::BlockId]) -> Result<()> {
        let mut batches = Vec::with_capacity(block_ids.len());
        for block_id in block_ids {
            batches.push(self.storage.load_block(*block_id, None)?.batch().clone());
        }
        let schema = self.relation.schema_ref();
        let combined = concat_batches(&schema, &batches)
            .map_err(|e| QuarryError::Execution(format!("sort concat failed: {e}")))?;
        if combined.num_rows() == 0 {
            return Ok(());
        }

        let sort_columns = self
            .sort_keys
            .iter()
            .map(|key| SortColumn {
                values: combined.column(key.attr_id).clone(),
                options: Some(SortOptions {
                    descending: key.descending,
                    nulls_first: false,
                }),
            })
            .collect::<Vec<_>>();
        let indices = lexsort_to_indices(&sort_columns, None)
            .map_err(|e| QuarryError::Execution(format!("sort failed: {e}")))?;
        let columns = combined
            .columns()
            .iter()
            .map(|col| {
                take(col.as_ref(), &indices, None)
                    .map_err(|e| QuarryError::Execution(format!("sort reorder failed: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let out = RecordBatch::try_new(self.destination.relation().schema_ref(), columns)
            .map_err(|e| QuarryError::Execution(format!("sorted batch build failed: {e}")))?;
        self.destination.append(self.partition_id, out)
    }
}
