//! Partitioned join hash table built during the normal phase of a build
//! operator and probed after its blocking edge is satisfied.
//!
//! Entries reference build-side tuples by `(block, row)` instead of copying
//! them; probes fetch the referenced blocks through the block manager.

use std::collections::HashMap;

use arrow::array::{Array, ArrayRef};
use parking_lot::Mutex;
use quarry_common::{BlockId, PartitionId, QuarryError, Result};

use crate::keys::{key_at, GroupKey};

/// Reference to one build-side tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleRef {
    /// Block holding the tuple.
    pub block_id: BlockId,
    /// Row offset within the block.
    pub row: usize,
}

/// Shared join hash table for one context slot.
pub struct JoinHashTable {
    partitions: Vec<Mutex<HashMap<GroupKey, Vec<TupleRef>>>>,
}

impl std::fmt::Debug for JoinHashTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHashTable")
            .field("num_partitions", &self.partitions.len())
            .finish()
    }
}

impl JoinHashTable {
    /// Constructs an empty table with `num_partitions` partitions.
    pub fn new(num_partitions: usize) -> Self {
        Self {
            partitions: (0..num_partitions.max(1))
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    /// Number of table partitions.
    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Inserts every row of a build-side key column into one partition.
    ///
    /// Concurrent build work orders targeting the same partition serialize
    /// on the partition lock.
    pub fn put_batch(
        &self,
        partition: PartitionId,
        block_id: BlockId,
        keys: &ArrayRef,
    ) -> Result<()> {
        let table = self.partition(partition)?;
        let mut table = table.lock();
        for row in 0..keys.len() {
            let key = key_at(keys, row)?;
            table
                .entry(key)
                .or_default()
                .push(TupleRef { block_id, row });
        }
        Ok(())
    }

    /// Build-side tuples matching `key` in one partition.
    pub fn matches(&self, partition: PartitionId, key: &GroupKey) -> Result<Vec<TupleRef>> {
        let table = self.partition(partition)?;
        Ok(table.lock().get(key).cloned().unwrap_or_default())
    }

    /// Number of distinct keys in one partition.
    pub fn num_keys(&self, partition: PartitionId) -> Result<usize> {
        Ok(self.partition(partition)?.lock().len())
    }

    fn partition(&self, partition: PartitionId) -> Result<&Mutex<HashMap<GroupKey, Vec<TupleRef>>>> {
        self.partitions.get(partition).ok_or_else(|| {
            QuarryError::Execution(format!("hash table partition {partition} out of range"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use std::sync::Arc;

    #[test]
    fn inserts_and_probes_by_key() {
        let table = JoinHashTable::new(2);
        let keys: ArrayRef = Arc::new(Int64Array::from(vec![1, 2, 1]));
        table.put_batch(0, BlockId(5), &keys).unwrap();

        let hits = table.matches(0, &GroupKey::Int(1)).unwrap();
        assert_eq!(
            hits,
            vec![
                TupleRef {
                    block_id: BlockId(5),
                    row: 0
                },
                TupleRef {
                    block_id: BlockId(5),
                    row: 2
                }
            ]
        );
        assert!(table.matches(0, &GroupKey::Int(9)).unwrap().is_empty());
        assert!(table.matches(1, &GroupKey::Int(1)).unwrap().is_empty());
        assert_eq!(table.num_keys(0).unwrap(), 2);
    }

    #[test]
    fn out_of_range_partition_is_an_error() {
        let table = JoinHashTable::new(1);
        assert!(table.matches(3, &GroupKey::Int(1)).is_err());
    }
}
