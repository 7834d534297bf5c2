//! Serialized physical plan representation.
//!
//! A plan is the structured byte blob handed to the execution core: operator
//! specs, dependency edges with kinds, and a context schema whose slots are
//! addressed by dense indices assigned at plan build time. Plan nodes carry
//! slot indices, never object references.

use quarry_common::{AttributeId, OpIndex, QuarryError, QueryId, RelationId, Result};
use serde::{Deserialize, Serialize};

use crate::expr::{PredicateSpec, ScalarSpec};

/// Kind of a dependency edge between two operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Downstream waits for upstream to be fully done.
    Blocking,
    /// Downstream consumes upstream output blocks as they are produced.
    Pipelining,
}

/// One dependency edge in the operator DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSpec {
    /// Producing operator.
    pub src: OpIndex,
    /// Consuming operator.
    pub dst: OpIndex,
    /// Dependency kind.
    pub kind: EdgeKind,
}

/// Aggregate function applied by an aggregation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateFunction {
    /// Sum of the argument.
    Sum,
    /// Row count (argument ignored).
    Count,
    /// Minimum of the argument.
    Min,
    /// Maximum of the argument.
    Max,
    /// Arithmetic mean of the argument.
    Avg,
}

/// Context slot: one group-by aggregation state.
///
/// The finalization partition count is never carried in the plan; it is read
/// from the live state at work-order generation time (`num_partitions` here
/// only fixes how the group hash space is sharded).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationStateSpec {
    /// Relation whose tuples are accumulated.
    pub input_relation: RelationId,
    /// Group-by key attribute.
    pub key_attr: AttributeId,
    /// Aggregate function.
    pub function: AggregateFunction,
    /// Argument scalar over the input relation (`None` only for Count).
    pub argument: Option<ScalarSpec>,
    /// Number of state partitions the group hash space is sharded into.
    ///
    /// A partitioned state (`> 1`) requires a rebuild phase that seals each
    /// partition before finalization may read it.
    pub num_partitions: usize,
}

/// Context slot: one partitioned join hash table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashTableSpec {
    /// Build-side relation.
    pub build_relation: RelationId,
    /// Build-side join key attribute.
    pub key_attr: AttributeId,
    /// Number of hash-table partitions (matches the build relation's
    /// partition count).
    pub num_partitions: usize,
}

/// Context slot: one insert destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertDestinationSpec {
    /// Output relation the destination appends into (registered in the
    /// catalog before the plan is submitted).
    pub relation_id: RelationId,
}

/// Context slot: one predicate, typed against an input relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredicateSlot {
    /// Relation whose schema the predicate is resolved against.
    pub input_relation: RelationId,
    /// Serialized predicate tree.
    pub predicate: PredicateSpec,
}

/// Context slot: one scalar, typed against an input relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarSlot {
    /// Relation whose schema the scalar is resolved against.
    pub input_relation: RelationId,
    /// Serialized scalar tree.
    pub scalar: ScalarSpec,
}

/// Context slot: one generator function handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeneratorFunctionSpec {
    /// Integer series `start, start+step, ..` up to and excluding `stop`.
    Series {
        /// First generated value.
        start: i64,
        /// Exclusive upper bound (lower bound for negative steps).
        stop: i64,
        /// Increment; must be nonzero.
        step: i64,
    },
}

/// Index-addressed registry schema of shared per-query objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSchema {
    /// Aggregation-state slots.
    #[serde(default)]
    pub aggregation_states: Vec<AggregationStateSpec>,
    /// Join hash-table slots.
    #[serde(default)]
    pub join_hash_tables: Vec<HashTableSpec>,
    /// Insert-destination slots.
    #[serde(default)]
    pub insert_destinations: Vec<InsertDestinationSpec>,
    /// Predicate slots.
    #[serde(default)]
    pub predicates: Vec<PredicateSlot>,
    /// Scalar slots.
    #[serde(default)]
    pub scalars: Vec<ScalarSlot>,
    /// Generator-function slots.
    #[serde(default)]
    pub generator_functions: Vec<GeneratorFunctionSpec>,
}

/// Sort key for the sort operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKeySpec {
    /// Attribute to order by.
    pub attr_id: AttributeId,
    /// Descending order when true.
    pub descending: bool,
}

/// One physical operator in the DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperatorSpec {
    /// Scans a stored relation and streams its tuples to a destination.
    TableScan {
        /// Scanned relation.
        relation_id: RelationId,
        /// Destination slot receiving scanned tuples.
        output_destination_index: usize,
    },
    /// Filters and optionally projects its input.
    Selection {
        /// Input relation.
        input_relation: RelationId,
        /// Whether the input is fully stored before this operator runs
        /// (false: blocks arrive through pipelining messages).
        input_is_stored: bool,
        /// Optional predicate slot filtering rows.
        predicate_index: Option<usize>,
        /// Scalar slots projected per surviving row (empty: pass through).
        projection_indexes: Vec<usize>,
        /// Destination slot receiving surviving tuples.
        output_destination_index: usize,
    },
    /// Builds a partitioned join hash table over its input.
    BuildHash {
        /// Build-side input relation.
        input_relation: RelationId,
        /// Whether the input is fully stored before this operator runs.
        input_is_stored: bool,
        /// Hash-table slot being built.
        hash_table_index: usize,
    },
    /// Probes a built hash table and emits joined tuples.
    HashJoin {
        /// Probe-side input relation.
        probe_relation: RelationId,
        /// Whether the probe input is fully stored before this operator runs.
        probe_is_stored: bool,
        /// Hash-table slot to probe (blocking dependency on its builder).
        hash_table_index: usize,
        /// Probe-side join key attribute.
        probe_key_attr: AttributeId,
        /// Destination slot receiving probe-side ++ build-side tuples.
        output_destination_index: usize,
    },
    /// Initializes an aggregation state (one work order per state partition).
    InitializeAggregation {
        /// Aggregation-state slot to initialize.
        agg_state_index: usize,
    },
    /// Accumulates input tuples into an aggregation state.
    Aggregation {
        /// Input relation.
        input_relation: RelationId,
        /// Whether the input is fully stored before this operator runs.
        input_is_stored: bool,
        /// Aggregation-state slot accumulated into.
        agg_state_index: usize,
    },
    /// Finalizes an aggregation state into a destination.
    FinalizeAggregation {
        /// Aggregation-state slot to finalize.
        agg_state_index: usize,
        /// Destination slot receiving `(key, value)` tuples.
        output_destination_index: usize,
    },
    /// Sorts each input partition as a whole.
    Sort {
        /// Input relation.
        input_relation: RelationId,
        /// Sort keys, most significant first.
        sort_keys: Vec<SortKeySpec>,
        /// Destination slot receiving ordered tuples.
        output_destination_index: usize,
    },
    /// Emits tuples produced by a generator function handle.
    TableGenerator {
        /// Generator-function slot.
        generator_index: usize,
        /// Destination slot receiving generated tuples.
        output_destination_index: usize,
    },
}

impl OperatorSpec {
    /// Short operator name for logs and status snapshots.
    pub fn name(&self) -> &'static str {
        match self {
            OperatorSpec::TableScan { .. } => "TableScan",
            OperatorSpec::Selection { .. } => "Selection",
            OperatorSpec::BuildHash { .. } => "BuildHash",
            OperatorSpec::HashJoin { .. } => "HashJoin",
            OperatorSpec::InitializeAggregation { .. } => "InitializeAggregation",
            OperatorSpec::Aggregation { .. } => "Aggregation",
            OperatorSpec::FinalizeAggregation { .. } => "FinalizeAggregation",
            OperatorSpec::Sort { .. } => "Sort",
            OperatorSpec::TableGenerator { .. } => "TableGenerator",
        }
    }
}

/// Serialized physical plan for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    /// Query this plan belongs to.
    pub query_id: QueryId,
    /// Operators, indexed densely by `OpIndex`.
    pub operators: Vec<OperatorSpec>,
    /// Dependency edges.
    pub edges: Vec<EdgeSpec>,
    /// Shared-object registry schema.
    pub context: ContextSchema,
    /// Operator whose completion completes the query.
    pub root_op: OpIndex,
}

impl QueryPlan {
    /// Encodes the plan as its wire representation.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| QuarryError::Plan(format!("plan encode failed: {e}")))
    }

    /// Decodes a plan from its wire representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| QuarryError::Plan(format!("invalid plan payload: {e}")))
    }

    /// Blocking predecessor indices of one operator.
    pub fn blocking_dependencies(&self, op: OpIndex) -> Vec<OpIndex> {
        self.edges
            .iter()
            .filter(|e| e.dst == op && e.kind == EdgeKind::Blocking)
            .map(|e| e.src)
            .collect()
    }

    /// Pipelining predecessor indices of one operator.
    pub fn pipelining_dependencies(&self, op: OpIndex) -> Vec<OpIndex> {
        self.edges
            .iter()
            .filter(|e| e.dst == op && e.kind == EdgeKind::Pipelining)
            .map(|e| e.src)
            .collect()
    }

    /// Successor indices of one operator with the given edge kind.
    pub fn successors(&self, op: OpIndex, kind: EdgeKind) -> Vec<OpIndex> {
        self.edges
            .iter()
            .filter(|e| e.src == op && e.kind == kind)
            .map(|e| e.dst)
            .collect()
    }
}
