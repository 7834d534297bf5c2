//! Typed identifiers shared across scheduler/storage components.
//!
//! Dense indices that are used to address arrays (`OpIndex`, `PartitionId`,
//! `NumaNodeId`, `AttributeId`) stay plain `usize` aliases; identifiers that
//! travel through the serialized plan or across the bus are newtypes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of an operator within a query's physical DAG.
pub type OpIndex = usize;

/// Index of a partition within an operator's input or output.
pub type PartitionId = usize;

/// Advisory NUMA node identifier used by dispatch.
pub type NumaNodeId = usize;

/// Dense column index of an attribute within a relation schema.
pub type AttributeId = usize;

/// Stable query identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable relation identifier assigned by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable storage block identifier assigned by the block manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable worker identifier within the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(
    /// Raw index into the pool.
    pub usize,
);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
