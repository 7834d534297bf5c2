//! Hash-join probe operator.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanBuilder, Float64Builder, Int64Builder, StringBuilder, UInt32Array,
};
use arrow::compute::take;
use arrow::record_batch::RecordBatch;
use arrow_schema::DataType;
use quarry_common::{
    AttributeId, BlockId, NumaNodeId, OpIndex, PartitionId, QuarryError, QueryId, RelationId,
    Result,
};
use quarry_storage::{Block, BlockManager, InsertDestination, Relation};

use crate::container::WorkOrdersContainer;
use crate::context::QueryContext;
use crate::hash_table::{JoinHashTable, TupleRef};
use crate::keys::key_at;
use crate::operators::{BlockFeed, OperatorEnv, RelationalOperator};
use crate::work_order::WorkOrder;

/// Probes a built hash table partition with each probe-side block and emits
/// probe-side ++ build-side tuples for every match.
///
/// The blocking edge from the builder guarantees the table partition is
/// complete before any probe order is dispatched.
pub struct HashJoinOperator {
    query_id: QueryId,
    op_index: OpIndex,
    probe_relation: Arc<Relation>,
    build_relation: Arc<Relation>,
    feed: BlockFeed,
    hash_table_index: usize,
    probe_key_attr: AttributeId,
    output_destination_index: usize,
    num_partitions: usize,
    num_output_partitions: usize,
}

impl HashJoinOperator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        query_id: QueryId,
        op_index: OpIndex,
        probe_relation: Arc<Relation>,
        build_relation: Arc<Relation>,
        probe_is_stored: bool,
        hash_table_index: usize,
        probe_key_attr: AttributeId,
        output_destination_index: usize,
        num_partitions: usize,
        num_output_partitions: usize,
    ) -> Self {
        Self {
            query_id,
            op_index,
            probe_relation,
            build_relation,
            feed: BlockFeed::new(num_partitions, probe_is_stored),
            hash_table_index,
            probe_key_attr,
            output_destination_index,
            num_partitions,
            num_output_partitions,
        }
    }
}

impl RelationalOperator for HashJoinOperator {
    fn name(&self) -> &'static str {
        "HashJoin"
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
            .poll(partition_id, self.probe_relation.id, &env.storage);
        if !new_blocks.is_empty() {
            let hash_table = Arc::clone(context.join_hash_table(self.hash_table_index)?);
            let destination =
                Arc::clone(context.insert_destination(self.output_destination_index)?);
            for block_id in new_blocks {
                container.add_normal_work_order(
                    self.op_index,
                    partition_id,
                    Box::new(HashJoinWorkOrder {
                        query_id: self.query_id,
                        op_index: self.op_index,
                        partition_id,
                        block_id,
                        numa_node: env.storage.block_numa_node(block_id),
                        probe_key_attr: self.probe_key_attr,
                        build_schema_types: self
                            .build_relation
                            .schema
                            .fields()
                            .iter()
                            .map(|f| f.data_type().clone())
                            .collect(),
                        storage: Arc::clone(&env.storage),
                        hash_table: Arc::clone(&hash_table),
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
        if relation_id == self.probe_relation.id {
            self.feed.feed(partition_id, block_id);
        }
    }
}

struct HashJoinWorkOrder {
    query_id: QueryId,
    op_index: OpIndex,
    partition_id: PartitionId,
    block_id: BlockId,
    numa_node: Option<NumaNodeId>,
    probe_key_attr: AttributeId,
    build_schema_types: Vec<DataType>,
    storage: Arc<BlockManager>,
    hash_table: Arc<JoinHashTable>,
    destination: Arc<InsertDestination>,
}

impl WorkOrder for HashJoinWorkOrder {
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
        self.storage.pin(self.block_id)?;
        let result = self.probe_block();
        let unpinned = self.storage.unpin(self.block_id);
        result.and_then(|value| unpinned.map(|_| value))
    }
}

impl HashJoinWorkOrder {
    fn probe_block(&self) -> Result<()> {
        let probe_block = self.storage.load_block(self.block_id, self.numa_node)?;
        let probe_batch = probe_block.batch();
        let keys = probe_batch.column(self.probe_key_attr).clone();

        let mut probe_indices = Vec::new();
        let mut build_refs = Vec::new();
        for row in 0..probe_batch.num_rows() {
            let key = key_at(&keys, row)?;
            for matched in self.hash_table.matches(self.partition_id, &key)? {
                probe_indices.push(row as u32);
                build_refs.push(matched);
            }
        }
        if probe_indices.is_empty() {
            return Ok(());
        }

        // Pin every referenced build block for the duration of the gather.
        let mut build_blocks: HashMap<BlockId, Arc<Block>> = HashMap::new();
        for tuple in &build_refs {
            if !build_blocks.contains_key(&tuple.block_id) {
                self.storage.pin(tuple.block_id)?;
                let block = self.storage.load_block(tuple.block_id, self.numa_node)?;
                build_blocks.insert(tuple.block_id, block);
            }
        }
        let result = self.emit_matches(probe_batch, &probe_indices, &build_refs, &build_blocks);
        for block_id in build_blocks.keys() {
            self.storage.unpin(*block_id)?;
        }
        result
    }

    fn emit_matches(
        &self,
        probe_batch: &RecordBatch,
        probe_indices: &[u32],
        build_refs: &[TupleRef],
        build_blocks: &HashMap<BlockId, Arc<Block>>,
    ) -> Result<()> {
        let indices = UInt32Array::from(probe_indices.to_vec());
        let mut columns: Vec<ArrayRef> = probe_batch
            .columns()
            .iter()
            .map(|col| {
                take(col.as_ref(), &indices, None)
                    .map_err(|e| QuarryError::Execution(format!("probe gather failed: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        for (col, data_type) in self.build_schema_types.iter().enumerate() {
            columns.push(gather_build_column(
                build_blocks,
                build_refs,
                col,
                data_type,
            )?);
        }

        let schema = self.destination.relation().schema_ref();
        let out = RecordBatch::try_new(schema, columns)
            .map_err(|e| QuarryError::Execution(format!("join batch build failed: {e}")))?;
        self.destination.append(self.partition_id, out)
    }
}

fn gather_build_column(
    build_blocks: &HashMap<BlockId, Arc<Block>>,
    build_refs: &[TupleRef],
    col: usize,
    data_type: &DataType,
) -> Result<ArrayRef> {
    fn column<'a>(
        build_blocks: &'a HashMap<BlockId, Arc<Block>>,
        tuple: &TupleRef,
        col: usize,
    ) -> Result<&'a ArrayRef> {
        build_blocks
            .get(&tuple.block_id)
            .map(|block| block.batch().column(col))
            .ok_or_else(|| QuarryError::Execution("unpinned build block in gather".to_string()))
    }

    match data_type {
        DataType::Int64 => {
            let mut b = Int64Builder::with_capacity(build_refs.len());
            for tuple in build_refs {
                let array = column(build_blocks, tuple, col)?;
                let array = array
                    .as_any()
                    .downcast_ref::<arrow::array::Int64Array>()
                    .ok_or_else(|| QuarryError::Execution("expected Int64 column".to_string()))?;
                b.append_value(array.value(tuple.row));
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Float64 => {
            let mut b = Float64Builder::with_capacity(build_refs.len());
            for tuple in build_refs {
                let array = column(build_blocks, tuple, col)?;
                let array = array
                    .as_any()
                    .downcast_ref::<arrow::array::Float64Array>()
                    .ok_or_else(|| QuarryError::Execution("expected Float64 column".to_string()))?;
                b.append_value(array.value(tuple.row));
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Utf8 => {
            let mut b = StringBuilder::new();
            for tuple in build_refs {
                let array = column(build_blocks, tuple, col)?;
                let array = array
                    .as_any()
                    .downcast_ref::<arrow::array::StringArray>()
                    .ok_or_else(|| QuarryError::Execution("expected Utf8 column".to_string()))?;
                b.append_value(array.value(tuple.row));
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Boolean => {
            let mut b = BooleanBuilder::with_capacity(build_refs.len());
            for tuple in build_refs {
                let array = column(build_blocks, tuple, col)?;
                let array = array
                    .as_any()
                    .downcast_ref::<arrow::array::BooleanArray>()
                    .ok_or_else(|| QuarryError::Execution("expected Boolean column".to_string()))?;
                b.append_value(array.value(tuple.row));
            }
            Ok(Arc::new(b.finish()))
        }
        other => Err(QuarryError::Execution(format!(
            "unsupported build column type {other:?}"
        ))),
    }
}
