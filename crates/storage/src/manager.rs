//! In-memory block manager with reference-counted pins.
//!
//! Contract consumed by the execution core:
//! - `create_block` registers a full block under a `(relation, partition)`;
//! - `load_block` resolves a block id (the NUMA hint is advisory and does not
//!   move data; it exists so callers can express placement preferences);
//! - `pin` / `unpin` bracket a work order's use of a block; destroying a
//!   pinned block is a storage error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use parking_lot::RwLock;
use quarry_common::{BlockId, NumaNodeId, PartitionId, QuarryError, RelationId, Result};

use crate::block::Block;
use crate::catalog::Relation;

#[derive(Debug)]
struct BlockEntry {
    block: Arc<Block>,
    pins: AtomicUsize,
}

/// Registry of live blocks and their pin counts.
#[derive(Debug)]
pub struct BlockManager {
    blocks: RwLock<HashMap<BlockId, BlockEntry>>,
    partition_index: RwLock<HashMap<(RelationId, PartitionId), Vec<BlockId>>>,
    next_block_id: AtomicU64,
    next_numa_node: AtomicUsize,
    num_numa_nodes: usize,
}

impl BlockManager {
    /// Constructs a manager spreading unplaced blocks across `num_numa_nodes`.
    pub fn new(num_numa_nodes: usize) -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
            partition_index: RwLock::new(HashMap::new()),
            next_block_id: AtomicU64::new(0),
            next_numa_node: AtomicUsize::new(0),
            num_numa_nodes: num_numa_nodes.max(1),
        }
    }

    /// Number of NUMA nodes blocks are spread across.
    pub fn num_numa_nodes(&self) -> usize {
        self.num_numa_nodes
    }

    /// Creates and registers a block holding `batch`.
    ///
    /// Without a hint the block is placed round-robin across NUMA nodes.
    pub fn create_block(
        &self,
        relation: &Relation,
        partition_id: PartitionId,
        numa_hint: Option<NumaNodeId>,
        batch: RecordBatch,
    ) -> Result<Arc<Block>> {
        if partition_id >= relation.num_partitions {
            return Err(QuarryError::Storage(format!(
                "partition {partition_id} out of range for relation '{}'",
                relation.name
            )));
        }
        if batch.schema().fields() != relation.schema.fields() {
            return Err(QuarryError::Storage(format!(
                "batch schema does not match relation '{}'",
                relation.name
            )));
        }
        let numa_node = match numa_hint {
            Some(node) => node % self.num_numa_nodes,
            None => self.next_numa_node.fetch_add(1, Ordering::Relaxed) % self.num_numa_nodes,
        };
        let id = BlockId(self.next_block_id.fetch_add(1, Ordering::Relaxed));
        let block = Arc::new(Block::new(id, relation.id, partition_id, numa_node, batch));
        self.blocks.write().insert(
            id,
            BlockEntry {
                block: Arc::clone(&block),
                pins: AtomicUsize::new(0),
            },
        );
        self.partition_index
            .write()
            .entry((relation.id, partition_id))
            .or_default()
            .push(id);
        Ok(block)
    }

    /// Resolves a block by id.
    ///
    /// `_numa_hint` is advisory: the in-memory manager never migrates data,
    /// but callers pass their preference so an allocation-aware manager can
    /// honor it.
    pub fn load_block(&self, id: BlockId, _numa_hint: Option<NumaNodeId>) -> Result<Arc<Block>> {
        self.blocks
            .read()
            .get(&id)
            .map(|entry| Arc::clone(&entry.block))
            .ok_or_else(|| QuarryError::Storage(format!("unknown block: {id}")))
    }

    /// NUMA residency of a block, if it is live.
    pub fn block_numa_node(&self, id: BlockId) -> Option<NumaNodeId> {
        self.blocks
            .read()
            .get(&id)
            .map(|entry| entry.block.numa_node())
    }

    /// Increments the pin count of a block.
    pub fn pin(&self, id: BlockId) -> Result<()> {
        let blocks = self.blocks.read();
        let entry = blocks
            .get(&id)
            .ok_or_else(|| QuarryError::Storage(format!("unknown block: {id}")))?;
        entry.pins.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Decrements the pin count of a block.
    pub fn unpin(&self, id: BlockId) -> Result<()> {
        let blocks = self.blocks.read();
        let entry = blocks
            .get(&id)
            .ok_or_else(|| QuarryError::Storage(format!("unknown block: {id}")))?;
        let prev = entry.pins.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            entry.pins.fetch_add(1, Ordering::AcqRel);
            return Err(QuarryError::Storage(format!(
                "unpin without matching pin for block {id}"
            )));
        }
        Ok(())
    }

    /// Current pin count of a block.
    pub fn pin_count(&self, id: BlockId) -> usize {
        self.blocks
            .read()
            .get(&id)
            .map(|entry| entry.pins.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Block ids registered for one relation partition, in creation order.
    pub fn blocks_for_partition(
        &self,
        relation_id: RelationId,
        partition_id: PartitionId,
    ) -> Vec<BlockId> {
        self.partition_index
            .read()
            .get(&(relation_id, partition_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Destroys a block; fails while pins are outstanding.
    pub fn destroy_block(&self, id: BlockId) -> Result<()> {
        let mut blocks = self.blocks.write();
        let entry = blocks
            .get(&id)
            .ok_or_else(|| QuarryError::Storage(format!("unknown block: {id}")))?;
        if entry.pins.load(Ordering::Acquire) > 0 {
            return Err(QuarryError::Storage(format!(
                "cannot destroy pinned block {id}"
            )));
        }
        let block = blocks.remove(&id).expect("entry just observed");
        let mut index = self.partition_index.write();
        if let Some(ids) = index.get_mut(&(block.block.relation_id(), block.block.partition_id())) {
            ids.retain(|candidate| *candidate != id);
        }
        Ok(())
    }

    /// Destroys every block of a relation (temp-relation teardown).
    pub fn drop_relation_blocks(&self, relation_id: RelationId) -> Result<()> {
        let ids = {
            let index = self.partition_index.read();
            index
                .iter()
                .filter(|((rel, _), _)| *rel == relation_id)
                .flat_map(|(_, ids)| ids.iter().copied())
                .collect::<Vec<_>>()
        };
        for id in ids {
            self.destroy_block(id)?;
        }
        self.partition_index
            .write()
            .retain(|(rel, _), _| *rel != relation_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};
    use quarry_common::RelationId;

    fn relation() -> Relation {
        Relation {
            id: RelationId(0),
            name: "r".to_string(),
            schema: Schema::new(vec![Field::new("x", DataType::Int64, false)]),
            num_partitions: 2,
            temporary: false,
        }
    }

    fn batch(values: &[i64]) -> RecordBatch {
        RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)])),
            vec![Arc::new(Int64Array::from(values.to_vec()))],
        )
        .unwrap()
    }

    #[test]
    fn create_load_round_trip() {
        let manager = BlockManager::new(1);
        let relation = relation();
        let block = manager
            .create_block(&relation, 0, None, batch(&[1, 2, 3]))
            .unwrap();
        let loaded = manager.load_block(block.id(), None).unwrap();
        assert_eq!(loaded.num_rows(), 3);
        assert_eq!(
            manager.blocks_for_partition(relation.id, 0),
            vec![block.id()]
        );
    }

    #[test]
    fn round_robin_numa_placement() {
        let manager = BlockManager::new(2);
        let relation = relation();
        let a = manager
            .create_block(&relation, 0, None, batch(&[1]))
            .unwrap();
        let b = manager
            .create_block(&relation, 0, None, batch(&[2]))
            .unwrap();
        assert_ne!(a.numa_node(), b.numa_node());
    }

    #[test]
    fn pinned_blocks_cannot_be_destroyed() {
        let manager = BlockManager::new(1);
        let relation = relation();
        let block = manager
            .create_block(&relation, 0, None, batch(&[1]))
            .unwrap();
        manager.pin(block.id()).unwrap();
        assert!(manager.destroy_block(block.id()).is_err());
        manager.unpin(block.id()).unwrap();
        manager.destroy_block(block.id()).unwrap();
        assert!(manager.load_block(block.id(), None).is_err());
    }

    #[test]
    fn unpin_without_pin_is_an_error() {
        let manager = BlockManager::new(1);
        let relation = relation();
        let block = manager
            .create_block(&relation, 0, None, batch(&[1]))
            .unwrap();
        assert!(manager.unpin(block.id()).is_err());
    }

    #[test]
    fn rejects_schema_mismatch() {
        let manager = BlockManager::new(1);
        let relation = relation();
        let wrong = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("y", DataType::Int64, false)])),
            vec![Arc::new(Int64Array::from(vec![1_i64]))],
        )
        .unwrap();
        assert!(manager.create_block(&relation, 0, None, wrong).is_err());
    }
}
