//! Lazily-materialized, operator-shared per-query state.
//!
//! Built once per query from a validated plan: every context slot is
//! resolved against the catalog, expression slots are compiled through the
//! paired factories, and destinations are wired to the data-pipelining
//! announcer. Work orders receive `Arc` clones of slot objects; the context
//! owns them for the query's lifetime and drops them at teardown.

use std::collections::HashMap;
use std::sync::Arc;

use quarry_common::{OpIndex, QuarryError, Result};
use quarry_plan::{
    compile_predicate, compile_scalar, validate_scalar, CompiledPredicate, CompiledScalar,
    GeneratorFunctionSpec, OperatorSpec, QueryPlan,
};
use quarry_storage::{BlockAnnouncer, BlockManager, Catalog, InsertDestination};

use crate::aggregation::AggregationState;
use crate::hash_table::JoinHashTable;

/// Index-addressed registry of shared per-query objects.
pub struct QueryContext {
    aggregation_states: Vec<Arc<AggregationState>>,
    join_hash_tables: Vec<Arc<JoinHashTable>>,
    insert_destinations: Vec<Arc<InsertDestination>>,
    predicates: Vec<CompiledPredicate>,
    scalars: Vec<CompiledScalar>,
    generator_functions: Vec<GeneratorFunctionSpec>,
    producer_to_destination: HashMap<OpIndex, usize>,
}

impl std::fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryContext")
            .field("aggregation_states", &self.aggregation_states.len())
            .field("join_hash_tables", &self.join_hash_tables.len())
            .field("insert_destinations", &self.insert_destinations.len())
            .field("predicates", &self.predicates.len())
            .field("scalars", &self.scalars.len())
            .field("generator_functions", &self.generator_functions.len())
            .finish()
    }
}

impl QueryContext {
    /// Materializes every context slot of a validated plan.
    pub fn from_plan(
        plan: &QueryPlan,
        catalog: &Catalog,
        storage: &Arc<BlockManager>,
        batch_size_rows: usize,
        announcer: Option<BlockAnnouncer>,
    ) -> Result<Self> {
        let mut predicates = Vec::with_capacity(plan.context.predicates.len());
        for slot in &plan.context.predicates {
            let relation = catalog.get_relation(slot.input_relation)?;
            predicates.push(compile_predicate(&slot.predicate, &relation.schema)?);
        }

        let mut scalars = Vec::with_capacity(plan.context.scalars.len());
        for slot in &plan.context.scalars {
            let relation = catalog.get_relation(slot.input_relation)?;
            scalars.push(compile_scalar(&slot.scalar, &relation.schema)?);
        }

        let mut aggregation_states = Vec::with_capacity(plan.context.aggregation_states.len());
        for spec in &plan.context.aggregation_states {
            let relation = catalog.get_relation(spec.input_relation)?;
            let key_type = relation.attribute(spec.key_attr)?.data_type().clone();
            let (argument, arg_type) = match &spec.argument {
                Some(argument) => {
                    let arg_type = validate_scalar(argument, &relation.schema)?;
                    (
                        Some(compile_scalar(argument, &relation.schema)?),
                        Some(arg_type),
                    )
                }
                None => (None, None),
            };
            aggregation_states.push(Arc::new(AggregationState::new(
                spec.function,
                spec.key_attr,
                key_type,
                argument,
                arg_type,
                spec.num_partitions,
            )));
        }

        let join_hash_tables = plan
            .context
            .join_hash_tables
            .iter()
            .map(|spec| Arc::new(JoinHashTable::new(spec.num_partitions)))
            .collect();

        let mut producer_to_destination = HashMap::new();
        for (op_index, op) in plan.operators.iter().enumerate() {
            if let Some(dest_index) = destination_index_of(op) {
                if producer_to_destination.insert(op_index, dest_index).is_some() {
                    return Err(QuarryError::Plan(format!(
                        "operator {op_index} references multiple destinations"
                    )));
                }
            }
        }

        let mut insert_destinations = Vec::with_capacity(plan.context.insert_destinations.len());
        for (dest_index, spec) in plan.context.insert_destinations.iter().enumerate() {
            let producer_op = producer_to_destination
                .iter()
                .find(|(_, dest)| **dest == dest_index)
                .map(|(op, _)| *op)
                .ok_or_else(|| {
                    QuarryError::Plan(format!(
                        "destination slot {dest_index} is not referenced by any operator"
                    ))
                })?;
            let relation = catalog.get_relation(spec.relation_id)?;
            insert_destinations.push(Arc::new(InsertDestination::new(
                relation,
                plan.query_id,
                producer_op,
                Arc::clone(storage),
                batch_size_rows,
                announcer.clone(),
            )));
        }

        Ok(Self {
            aggregation_states,
            join_hash_tables,
            insert_destinations,
            predicates,
            scalars,
            generator_functions: plan.context.generator_functions.clone(),
            producer_to_destination,
        })
    }

    /// Aggregation state slot.
    pub fn aggregation_state(&self, index: usize) -> Result<&Arc<AggregationState>> {
        self.aggregation_states
            .get(index)
            .ok_or_else(|| slot_error("aggregation state", index))
    }

    /// Join hash-table slot.
    pub fn join_hash_table(&self, index: usize) -> Result<&Arc<JoinHashTable>> {
        self.join_hash_tables
            .get(index)
            .ok_or_else(|| slot_error("join hash table", index))
    }

    /// Insert-destination slot.
    pub fn insert_destination(&self, index: usize) -> Result<&Arc<InsertDestination>> {
        self.insert_destinations
            .get(index)
            .ok_or_else(|| slot_error("insert destination", index))
    }

    /// Destination owned by a producing operator, if it has one.
    pub fn destination_for_op(&self, op: OpIndex) -> Option<&Arc<InsertDestination>> {
        self.producer_to_destination
            .get(&op)
            .and_then(|dest| self.insert_destinations.get(*dest))
    }

    /// Predicate slot.
    pub fn predicate(&self, index: usize) -> Result<&CompiledPredicate> {
        self.predicates
            .get(index)
            .ok_or_else(|| slot_error("predicate", index))
    }

    /// Scalar slot.
    pub fn scalar(&self, index: usize) -> Result<&CompiledScalar> {
        self.scalars
            .get(index)
            .ok_or_else(|| slot_error("scalar", index))
    }

    /// Generator-function slot.
    pub fn generator_function(&self, index: usize) -> Result<&GeneratorFunctionSpec> {
        self.generator_functions
            .get(index)
            .ok_or_else(|| slot_error("generator function", index))
    }
}

fn destination_index_of(op: &OperatorSpec) -> Option<usize> {
    match op {
        OperatorSpec::TableScan {
            output_destination_index,
            ..
        }
        | OperatorSpec::Selection {
            output_destination_index,
            ..
        }
        | OperatorSpec::HashJoin {
            output_destination_index,
            ..
        }
        | OperatorSpec::Sort {
            output_destination_index,
            ..
        }
        | OperatorSpec::FinalizeAggregation {
            output_destination_index,
            ..
        }
        | OperatorSpec::TableGenerator {
            output_destination_index,
            ..
        } => Some(*output_destination_index),
        OperatorSpec::BuildHash { .. }
        | OperatorSpec::Aggregation { .. }
        | OperatorSpec::InitializeAggregation { .. } => None,
    }
}

fn slot_error(kind: &str, index: usize) -> QuarryError {
    QuarryError::Execution(format!("{kind} slot {index} out of range"))
}
