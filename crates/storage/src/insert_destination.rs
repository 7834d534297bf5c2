//! Append-only tuple destinations feeding relation partitions.
//!
//! Concurrency contract:
//! - many work orders append concurrently; each partition buffer is guarded
//!   by its own mutex and full blocks are handed off atomically under it;
//! - every handed-off block is registered with the block manager first and
//!   then announced, so a consumer reacting to the announcement always finds
//!   the block;
//! - `finalize_partition` flushes the partial tail once an operator partition
//!   stops producing. Tail blocks are returned to the caller instead of being
//!   announced: the scheduler routes them synchronously, so a consumer is
//!   never told "done feeding" before it has seen every block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;
use quarry_common::{BlockId, OpIndex, PartitionId, QuarryError, QueryId, RelationId, Result};
use tracing::debug;

use crate::catalog::Relation;
use crate::manager::BlockManager;

/// Announcement for one block handed off by an insert destination.
#[derive(Debug, Clone)]
pub struct FlushedBlock {
    /// Query the producing operator belongs to.
    pub query_id: QueryId,
    /// Operator that produced the block.
    pub producer_op: OpIndex,
    /// Newly registered block.
    pub block_id: BlockId,
    /// Relation the block belongs to.
    pub relation_id: RelationId,
    /// Partition of the relation.
    pub partition_id: PartitionId,
    /// Tuples in the block.
    pub num_rows: usize,
}

/// Callback invoked for every handed-off block.
///
/// The execution layer bridges this into data-pipelining bus messages; the
/// storage layer stays transport-agnostic.
pub type BlockAnnouncer = Arc<dyn Fn(FlushedBlock) + Send + Sync>;

#[derive(Debug, Default)]
struct PartitionBuffer {
    pending: Vec<RecordBatch>,
    pending_rows: usize,
}

/// Append sink writing tuples into one output relation.
pub struct InsertDestination {
    relation: Arc<Relation>,
    query_id: QueryId,
    producer_op: OpIndex,
    manager: Arc<BlockManager>,
    batch_size_rows: usize,
    announcer: Option<BlockAnnouncer>,
    buffers: Vec<Mutex<PartitionBuffer>>,
    rows_appended: AtomicU64,
}

impl std::fmt::Debug for InsertDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsertDestination")
            .field("relation", &self.relation.name)
            .field("producer_op", &self.producer_op)
            .field("batch_size_rows", &self.batch_size_rows)
            .finish()
    }
}

impl InsertDestination {
    /// Constructs a destination writing into `relation`.
    pub fn new(
        relation: Arc<Relation>,
        query_id: QueryId,
        producer_op: OpIndex,
        manager: Arc<BlockManager>,
        batch_size_rows: usize,
        announcer: Option<BlockAnnouncer>,
    ) -> Self {
        let buffers = (0..relation.num_partitions)
            .map(|_| Mutex::new(PartitionBuffer::default()))
            .collect();
        Self {
            relation,
            query_id,
            producer_op,
            manager,
            batch_size_rows: batch_size_rows.max(1),
            announcer,
            buffers,
            rows_appended: AtomicU64::new(0),
        }
    }

    /// Relation this destination writes to.
    pub fn relation(&self) -> &Arc<Relation> {
        &self.relation
    }

    /// Operator this destination belongs to.
    pub fn producer_op(&self) -> OpIndex {
        self.producer_op
    }

    /// Total tuples appended so far.
    pub fn total_rows_appended(&self) -> u64 {
        self.rows_appended.load(Ordering::Acquire)
    }

    /// Appends tuples to one output partition, handing off full blocks.
    pub fn append(&self, partition_id: PartitionId, batch: RecordBatch) -> Result<()> {
        let buffer = self.buffers.get(partition_id).ok_or_else(|| {
            QuarryError::Execution(format!(
                "partition {partition_id} out of range for destination '{}'",
                self.relation.name
            ))
        })?;
        if batch.schema().fields() != self.relation.schema.fields() {
            return Err(QuarryError::Execution(format!(
                "appended batch schema does not match relation '{}'",
                self.relation.name
            )));
        }
        if batch.num_rows() == 0 {
            return Ok(());
        }
        self.rows_appended
            .fetch_add(batch.num_rows() as u64, Ordering::AcqRel);

        let mut guard = buffer.lock();
        guard.pending_rows += batch.num_rows();
        guard.pending.push(batch);
        while guard.pending_rows >= self.batch_size_rows {
            let combined = self.combine(&guard.pending)?;
            let full = combined.slice(0, self.batch_size_rows);
            let rest_rows = combined.num_rows() - self.batch_size_rows;
            guard.pending = if rest_rows > 0 {
                vec![combined.slice(self.batch_size_rows, rest_rows)]
            } else {
                Vec::new()
            };
            guard.pending_rows = rest_rows;
            let flushed = self.hand_off(partition_id, full)?;
            if let Some(announcer) = &self.announcer {
                announcer(flushed);
            }
        }
        Ok(())
    }

    /// Flushes the partial tail of one partition, returning the handed-off
    /// blocks for synchronous routing by the caller.
    pub fn finalize_partition(&self, partition_id: PartitionId) -> Result<Vec<FlushedBlock>> {
        let buffer = self.buffers.get(partition_id).ok_or_else(|| {
            QuarryError::Execution(format!(
                "partition {partition_id} out of range for destination '{}'",
                self.relation.name
            ))
        })?;
        let mut guard = buffer.lock();
        if guard.pending_rows == 0 {
            return Ok(Vec::new());
        }
        let combined = self.combine(&guard.pending)?;
        guard.pending.clear();
        guard.pending_rows = 0;
        Ok(vec![self.hand_off(partition_id, combined)?])
    }

    /// Flushes the partial tails of every partition.
    pub fn finalize(&self) -> Result<Vec<FlushedBlock>> {
        let mut flushed = Vec::new();
        for partition_id in 0..self.relation.num_partitions {
            flushed.extend(self.finalize_partition(partition_id)?);
        }
        Ok(flushed)
    }

    fn combine(&self, batches: &[RecordBatch]) -> Result<RecordBatch> {
        concat_batches(&self.relation.schema_ref(), batches)
            .map_err(|e| QuarryError::Execution(format!("destination concat failed: {e}")))
    }

    fn hand_off(&self, partition_id: PartitionId, batch: RecordBatch) -> Result<FlushedBlock> {
        let num_rows = batch.num_rows();
        let block = self
            .manager
            .create_block(&self.relation, partition_id, None, batch)?;
        debug!(
            query_id = %self.query_id,
            op_index = self.producer_op,
            block_id = %block.id(),
            partition_id,
            num_rows,
            operator = "InsertDestinationHandOff",
            "block handed off"
        );
        Ok(FlushedBlock {
            query_id: self.query_id,
            producer_op: self.producer_op,
            block_id: block.id(),
            relation_id: self.relation.id,
            partition_id,
            num_rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};
    use parking_lot::Mutex as PlMutex;
    use quarry_common::RelationId;

    fn relation(num_partitions: usize) -> Arc<Relation> {
        Arc::new(Relation {
            id: RelationId(0),
            name: "out".to_string(),
            schema: Schema::new(vec![Field::new("x", DataType::Int64, false)]),
            num_partitions,
            temporary: true,
        })
    }

    fn batch(values: &[i64]) -> RecordBatch {
        RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)])),
            vec![Arc::new(Int64Array::from(values.to_vec()))],
        )
        .unwrap()
    }

    #[test]
    fn hands_off_full_blocks_and_flushes_tail() {
        let relation = relation(1);
        let manager = Arc::new(BlockManager::new(1));
        let announced = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&announced);
        let dest = InsertDestination::new(
            Arc::clone(&relation),
            QueryId(1),
            0,
            Arc::clone(&manager),
            3,
            Some(Arc::new(move |flushed: FlushedBlock| {
                sink.lock().push(flushed.num_rows);
            })),
        );

        dest.append(0, batch(&[1, 2])).unwrap();
        assert!(announced.lock().is_empty());
        dest.append(0, batch(&[3, 4])).unwrap();
        assert_eq!(announced.lock().as_slice(), &[3]);
        // Tail flushes are returned, not announced.
        let tail = dest.finalize_partition(0).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].num_rows, 1);
        assert_eq!(announced.lock().as_slice(), &[3]);
        assert_eq!(dest.total_rows_appended(), 4);
        assert_eq!(manager.blocks_for_partition(relation.id, 0).len(), 2);
    }

    #[test]
    fn splits_oversized_appends_into_multiple_blocks() {
        let relation = relation(1);
        let manager = Arc::new(BlockManager::new(1));
        let dest = InsertDestination::new(
            Arc::clone(&relation),
            QueryId(1),
            0,
            Arc::clone(&manager),
            2,
            None,
        );
        dest.append(0, batch(&[1, 2, 3, 4, 5])).unwrap();
        dest.finalize().unwrap();
        let blocks = manager.blocks_for_partition(relation.id, 0);
        assert_eq!(blocks.len(), 3);
        let rows: usize = blocks
            .iter()
            .map(|id| manager.load_block(*id, None).unwrap().num_rows())
            .sum();
        assert_eq!(rows, 5);
    }

    #[test]
    fn rejects_out_of_range_partition() {
        let relation = relation(1);
        let manager = Arc::new(BlockManager::new(1));
        let dest = InsertDestination::new(relation, QueryId(1), 0, manager, 8, None);
        assert!(dest.append(3, batch(&[1])).is_err());
    }
}
