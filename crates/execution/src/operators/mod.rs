//! Relational operators and their work orders.
//!
//! Operators are a tagged sum ([`OperatorKernel`]) behind a shared
//! capability trait ([`RelationalOperator`]); the query manager drives them
//! exclusively through [`OperatorNode`]. Each variant lives beside its work
//! orders in one module.
//!
//! Generation contract: `get_all_work_orders` enqueues every currently
//! generatable normal work order for one partition and returns `true` once
//! the operator will never enqueue another normal order for it. Repeated
//! calls on unchanged state enqueue nothing (idempotence); per-partition
//! `started`/pending-feed bookkeeping guarantees this.

pub mod aggregation_operator;
pub mod build_hash;
pub mod finalize_aggregation;
pub mod hash_join;
pub mod initialize_aggregation;
pub mod selection;
pub mod sort;
pub mod table_generator;
pub mod table_scan;

use std::sync::Arc;

use quarry_common::{BlockId, OpIndex, PartitionId, QueryId, RelationId, Result};
use quarry_plan::{output_partitions, work_partitions, OperatorSpec, QueryPlan};
use quarry_storage::{Block, BlockManager, Catalog};

use crate::container::WorkOrdersContainer;
use crate::context::QueryContext;

pub use aggregation_operator::AggregationOperator;
pub use build_hash::BuildHashOperator;
pub use finalize_aggregation::FinalizeAggregationOperator;
pub use hash_join::HashJoinOperator;
pub use initialize_aggregation::InitializeAggregationOperator;
pub use selection::SelectionOperator;
pub use sort::SortOperator;
pub use table_generator::TableGeneratorOperator;
pub use table_scan::TableScanOperator;

/// Shared collaborators handed to operators at generation time.
pub struct OperatorEnv {
    /// Query being executed.
    pub query_id: QueryId,
    /// Block manager resolving stored input blocks.
    pub storage: Arc<BlockManager>,
    /// Read-only catalog.
    pub catalog: Arc<Catalog>,
}

/// Capability contract implemented by every operator variant.
pub trait RelationalOperator {
    /// Operator name for logs and status snapshots.
    fn name(&self) -> &'static str;

    /// Work partitions normal generation runs over.
    fn num_partitions(&self) -> usize;

    /// Output partitions completion is tracked over.
    fn num_output_partitions(&self) -> usize;

    /// Whether a rebuild phase must run between normal completion and
    /// operator completion.
    fn needs_rebuild(&self) -> bool {
        false
    }

    /// Generates all currently generatable normal work orders for one
    /// partition; returns `true` iff normal generation for it is complete.
    fn get_all_work_orders(
        &mut self,
        partition_id: PartitionId,
        container: &mut WorkOrdersContainer,
        context: &QueryContext,
        env: &OperatorEnv,
    ) -> Result<bool>;

    /// Generates the rebuild work orders for one output partition; same
    /// contract as normal generation.
    fn get_all_rebuild_work_orders(
        &mut self,
        _partition_id: PartitionId,
        _container: &mut WorkOrdersContainer,
        _context: &QueryContext,
        _env: &OperatorEnv,
    ) -> Result<bool> {
        Ok(true)
    }

    /// A pipelining predecessor finished producing input for one partition.
    fn done_feeding_input(&mut self, partition_id: PartitionId);

    /// A pipelining predecessor produced one input block.
    fn feed_input_block(
        &mut self,
        block_id: BlockId,
        relation_id: RelationId,
        partition_id: PartitionId,
    );
}

/// Tagged sum of operator variants.
pub enum OperatorKernel {
    /// Stored-relation scan.
    TableScan(TableScanOperator),
    /// Predicate filter and scalar projection.
    Selection(SelectionOperator),
    /// Join hash-table build.
    BuildHash(BuildHashOperator),
    /// Join probe.
    HashJoin(HashJoinOperator),
    /// Aggregation-state initialization.
    InitializeAggregation(InitializeAggregationOperator),
    /// Aggregation-state accumulation.
    Aggregation(AggregationOperator),
    /// Aggregation-state finalization.
    FinalizeAggregation(FinalizeAggregationOperator),
    /// Whole-partition sort.
    Sort(SortOperator),
    /// Generator-function leaf.
    TableGenerator(TableGeneratorOperator),
}

macro_rules! dispatch_kernel {
    ($kernel:expr, $inner:ident => $body:expr) => {
        match $kernel {
            OperatorKernel::TableScan($inner) => $body,
            OperatorKernel::Selection($inner) => $body,
            OperatorKernel::BuildHash($inner) => $body,
            OperatorKernel::HashJoin($inner) => $body,
            OperatorKernel::InitializeAggregation($inner) => $body,
            OperatorKernel::Aggregation($inner) => $body,
            OperatorKernel::FinalizeAggregation($inner) => $body,
            OperatorKernel::Sort($inner) => $body,
            OperatorKernel::TableGenerator($inner) => $body,
        }
    };
}

/// One node of the operator DAG: a kernel plus its declared dependencies.
pub struct OperatorNode {
    kernel: OperatorKernel,
    blocking_deps: Vec<OpIndex>,
    pipelining_deps: Vec<OpIndex>,
}

impl OperatorNode {
    /// Builds the runtime operator for one plan node.
    pub fn from_spec(
        plan: &QueryPlan,
        op_index: OpIndex,
        catalog: &Catalog,
    ) -> Result<Self> {
        let query_id = plan.query_id;
        let spec = &plan.operators[op_index];
        let work_parts = work_partitions(plan, op_index, catalog)?;
        let out_parts = output_partitions(plan, op_index, catalog)?;
        let kernel = match spec {
            OperatorSpec::TableScan {
                relation_id,
                output_destination_index,
            } => OperatorKernel::TableScan(TableScanOperator::new(
                query_id,
                op_index,
                catalog.get_relation(*relation_id)?,
                *output_destination_index,
                out_parts,
            )),
            OperatorSpec::Selection {
                input_relation,
                input_is_stored,
                predicate_index,
                projection_indexes,
                output_destination_index,
            } => OperatorKernel::Selection(SelectionOperator::new(
                query_id,
                op_index,
                catalog.get_relation(*input_relation)?,
                *input_is_stored,
                *predicate_index,
                projection_indexes.clone(),
                *output_destination_index,
                work_parts,
                out_parts,
            )),
            OperatorSpec::BuildHash {
                input_relation,
                input_is_stored,
                hash_table_index,
            } => OperatorKernel::BuildHash(BuildHashOperator::new(
                query_id,
                op_index,
                catalog.get_relation(*input_relation)?,
                *input_is_stored,
                plan.context.join_hash_tables[*hash_table_index].key_attr,
                *hash_table_index,
                work_parts,
            )),
            OperatorSpec::HashJoin {
                probe_relation,
                probe_is_stored,
                hash_table_index,
                probe_key_attr,
                output_destination_index,
            } => {
                let table_spec = &plan.context.join_hash_tables[*hash_table_index];
                OperatorKernel::HashJoin(HashJoinOperator::new(
                    query_id,
                    op_index,
                    catalog.get_relation(*probe_relation)?,
                    catalog.get_relation(table_spec.build_relation)?,
                    *probe_is_stored,
                    *hash_table_index,
                    *probe_key_attr,
                    *output_destination_index,
                    work_parts,
                    out_parts,
                ))
            }
            OperatorSpec::InitializeAggregation { agg_state_index } => {
                OperatorKernel::InitializeAggregation(InitializeAggregationOperator::new(
                    query_id,
                    op_index,
                    *agg_state_index,
                ))
            }
            OperatorSpec::Aggregation {
                input_relation,
                input_is_stored,
                agg_state_index,
            } => OperatorKernel::Aggregation(AggregationOperator::new(
                query_id,
                op_index,
                catalog.get_relation(*input_relation)?,
                *input_is_stored,
                *agg_state_index,
                work_parts,
                out_parts,
                plan.context.aggregation_states[*agg_state_index].num_partitions > 1,
            )),
            OperatorSpec::FinalizeAggregation {
                agg_state_index,
                output_destination_index,
            } => OperatorKernel::FinalizeAggregation(FinalizeAggregationOperator::new(
                query_id,
                op_index,
                *agg_state_index,
                *output_destination_index,
            )),
            OperatorSpec::Sort {
                input_relation,
                sort_keys,
                output_destination_index,
            } => OperatorKernel::Sort(SortOperator::new(
                query_id,
                op_index,
                catalog.get_relation(*input_relation)?,
                sort_keys.clone(),
                *output_destination_index,
                work_parts,
            )),
            OperatorSpec::TableGenerator {
                generator_index,
                output_destination_index,
            } => OperatorKernel::TableGenerator(TableGeneratorOperator::new(
                query_id,
                op_index,
                *generator_index,
                *output_destination_index,
                work_parts,
            )),
        };
        Ok(Self {
            kernel,
            blocking_deps: plan.blocking_dependencies(op_index),
            pipelining_deps: plan.pipelining_dependencies(op_index),
        })
    }

    /// Blocking predecessor indices.
    pub fn blocking_dependencies(&self) -> &[OpIndex] {
        &self.blocking_deps
    }

    /// Pipelining predecessor indices.
    pub fn pipelining_dependencies(&self) -> &[OpIndex] {
        &self.pipelining_deps
    }
}

impl RelationalOperator for OperatorNode {
    fn name(&self) -> &'static str {
        dispatch_kernel!(&self.kernel, inner => inner.name())
    }

    fn num_partitions(&self) -> usize {
        dispatch_kernel!(&self.kernel, inner => inner.num_partitions())
    }

    fn num_output_partitions(&self) -> usize {
        dispatch_kernel!(&self.kernel, inner => inner.num_output_partitions())
    }

    fn needs_rebuild(&self) -> bool {
        dispatch_kernel!(&self.kernel, inner => inner.needs_rebuild())
    }

    fn get_all_work_orders(
        &mut self,
        partition_id: PartitionId,
        container: &mut WorkOrdersContainer,
        context: &QueryContext,
        env: &OperatorEnv,
    ) -> Result<bool> {
        dispatch_kernel!(&mut self.kernel, inner => {
            inner.get_all_work_orders(partition_id, container, context, env)
        })
    }

    fn get_all_rebuild_work_orders(
        &mut self,
        partition_id: PartitionId,
        container: &mut WorkOrdersContainer,
        context: &QueryContext,
        env: &OperatorEnv,
    ) -> Result<bool> {
        dispatch_kernel!(&mut self.kernel, inner => {
            inner.get_all_rebuild_work_orders(partition_id, container, context, env)
        })
    }

    fn done_feeding_input(&mut self, partition_id: PartitionId) {
        dispatch_kernel!(&mut self.kernel, inner => inner.done_feeding_input(partition_id))
    }

    fn feed_input_block(
        &mut self,
        block_id: BlockId,
        relation_id: RelationId,
        partition_id: PartitionId,
    ) {
        dispatch_kernel!(&mut self.kernel, inner => {
            inner.feed_input_block(block_id, relation_id, partition_id)
        })
    }
}

/// Per-partition input-block tracking shared by operators that accept both
/// stored and pipelined input.
pub(crate) struct BlockFeed {
    stored: bool,
    started: Vec<bool>,
    pending: Vec<Vec<BlockId>>,
    done_feeding: Vec<bool>,
}

impl BlockFeed {
    pub(crate) fn new(num_partitions: usize, stored: bool) -> Self {
        Self {
            stored,
            started: vec![false; num_partitions],
            pending: (0..num_partitions).map(|_| Vec::new()).collect(),
            done_feeding: vec![false; num_partitions],
        }
    }

    /// Blocks that became available since the last poll.
    pub(crate) fn poll(
        &mut self,
        partition_id: PartitionId,
        relation_id: RelationId,
        storage: &BlockManager,
    ) -> Vec<BlockId> {
        if self.stored {
            if self.started[partition_id] {
                Vec::new()
            } else {
                self.started[partition_id] = true;
                storage.blocks_for_partition(relation_id, partition_id)
            }
        } else {
            std::mem::take(&mut self.pending[partition_id])
        }
    }

    /// Whether normal generation for the partition can never add more.
    pub(crate) fn generation_done(&self, partition_id: PartitionId) -> bool {
        if self.stored {
            self.started[partition_id]
        } else {
            self.done_feeding[partition_id] && self.pending[partition_id].is_empty()
        }
    }

    pub(crate) fn feed(&mut self, partition_id: PartitionId, block_id: BlockId) {
        if !self.stored {
            self.pending[partition_id].push(block_id);
        }
    }

    pub(crate) fn set_done_feeding(&mut self, partition_id: PartitionId) {
        self.done_feeding[partition_id] = true;
    }
}

/// Runs `f` with the block pinned, releasing the pin on every path.
pub(crate) fn with_pinned<T>(
    storage: &BlockManager,
    block_id: BlockId,
    numa_hint: Option<usize>,
    f: impl FnOnce(&Block) -> Result<T>,
) -> Result<T> {
    storage.pin(block_id)?;
    let result = storage
        .load_block(block_id, numa_hint)
        .and_then(|block| f(&block));
    let unpinned = storage.unpin(block_id);
    result.and_then(|value| unpinned.map(|_| value))
}
