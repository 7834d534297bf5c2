//! Immutable storage blocks with NUMA residency metadata.

use arrow::record_batch::RecordBatch;
use quarry_common::{BlockId, NumaNodeId, PartitionId, RelationId};

/// One immutable block of tuples belonging to a relation partition.
///
/// Blocks are created full and never mutated; the block manager owns the
/// only registry of live blocks and hands out shared references.
#[derive(Debug, Clone)]
pub struct Block {
    id: BlockId,
    relation_id: RelationId,
    partition_id: PartitionId,
    numa_node: NumaNodeId,
    batch: RecordBatch,
}

impl Block {
    pub(crate) fn new(
        id: BlockId,
        relation_id: RelationId,
        partition_id: PartitionId,
        numa_node: NumaNodeId,
        batch: RecordBatch,
    ) -> Self {
        Self {
            id,
            relation_id,
            partition_id,
            numa_node,
            batch,
        }
    }

    /// Stable block id.
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Relation this block belongs to.
    pub fn relation_id(&self) -> RelationId {
        self.relation_id
    }

    /// Partition of the relation this block belongs to.
    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// NUMA node the block's memory is resident on (advisory).
    pub fn numa_node(&self) -> NumaNodeId {
        self.numa_node
    }

    /// Tuple payload.
    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    /// Number of tuples in the block.
    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }
}
