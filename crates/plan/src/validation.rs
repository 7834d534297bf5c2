//! Whole-plan validation against a catalog.
//!
//! Contract:
//! - `validate_plan` runs before any execution state is created; a plan that
//!   fails here must leave the system unmutated;
//! - every relation/attribute reference, context-slot index, type, and
//!   partition count is checked; expression slots are checked with the
//!   paired expression validators before any compilation happens.

use arrow_schema::DataType;
use quarry_common::{OpIndex, QuarryError, Result};
use quarry_storage::Catalog;

use crate::expr::{validate_predicate, validate_scalar};
use crate::plan::{
    AggregateFunction, AggregationStateSpec, ContextSchema, GeneratorFunctionSpec, OperatorSpec,
    QueryPlan,
};

/// Validates a serialized plan against the catalog.
pub fn validate_plan(plan: &QueryPlan, catalog: &Catalog) -> Result<()> {
    if plan.operators.is_empty() {
        return Err(QuarryError::Plan("plan has no operators".to_string()));
    }
    if plan.root_op >= plan.operators.len() {
        return Err(QuarryError::Plan(format!(
            "root operator {} out of range",
            plan.root_op
        )));
    }
    validate_edges(plan)?;
    validate_context(&plan.context, catalog)?;
    for (op_index, op) in plan.operators.iter().enumerate() {
        validate_operator(plan, op_index, op, catalog)?;
    }
    Ok(())
}

fn validate_edges(plan: &QueryPlan) -> Result<()> {
    let n = plan.operators.len();
    for edge in &plan.edges {
        if edge.src >= n || edge.dst >= n {
            return Err(QuarryError::Plan(format!(
                "edge {} -> {} references an operator out of range",
                edge.src, edge.dst
            )));
        }
        if edge.src == edge.dst {
            return Err(QuarryError::Plan(format!(
                "operator {} depends on itself",
                edge.src
            )));
        }
    }

    // Kahn topological check: the dependency graph must be acyclic.
    let mut in_degree = vec![0_usize; n];
    for edge in &plan.edges {
        in_degree[edge.dst] += 1;
    }
    let mut ready = (0..n).filter(|i| in_degree[*i] == 0).collect::<Vec<_>>();
    let mut visited = 0;
    while let Some(op) = ready.pop() {
        visited += 1;
        for edge in plan.edges.iter().filter(|e| e.src == op) {
            in_degree[edge.dst] -= 1;
            if in_degree[edge.dst] == 0 {
                ready.push(edge.dst);
            }
        }
    }
    if visited != n {
        return Err(QuarryError::Plan(
            "operator dependency graph contains a cycle".to_string(),
        ));
    }
    Ok(())
}

fn validate_context(context: &ContextSchema, catalog: &Catalog) -> Result<()> {
    for (i, dest) in context.insert_destinations.iter().enumerate() {
        catalog.get_relation(dest.relation_id).map_err(|_| {
            QuarryError::Plan(format!(
                "destination slot {i} references unknown relation {}",
                dest.relation_id
            ))
        })?;
    }
    for (i, slot) in context.predicates.iter().enumerate() {
        let relation = catalog.get_relation(slot.input_relation).map_err(|_| {
            QuarryError::Plan(format!(
                "predicate slot {i} references unknown relation {}",
                slot.input_relation
            ))
        })?;
        validate_predicate(&slot.predicate, &relation.schema)
            .map_err(|e| QuarryError::Plan(format!("predicate slot {i}: {e}")))?;
    }
    for (i, slot) in context.scalars.iter().enumerate() {
        let relation = catalog.get_relation(slot.input_relation).map_err(|_| {
            QuarryError::Plan(format!(
                "scalar slot {i} references unknown relation {}",
                slot.input_relation
            ))
        })?;
        validate_scalar(&slot.scalar, &relation.schema)
            .map_err(|e| QuarryError::Plan(format!("scalar slot {i}: {e}")))?;
    }
    for (i, spec) in context.aggregation_states.iter().enumerate() {
        validate_aggregation_state(i, spec, catalog)?;
    }
    for (i, spec) in context.join_hash_tables.iter().enumerate() {
        let relation = catalog.get_relation(spec.build_relation).map_err(|_| {
            QuarryError::Plan(format!(
                "hash table slot {i} references unknown relation {}",
                spec.build_relation
            ))
        })?;
        let key = relation
            .attribute(spec.key_attr)
            .map_err(|e| QuarryError::Plan(format!("hash table slot {i}: {e}")))?;
        if !is_key_type(key.data_type()) {
            return Err(QuarryError::Plan(format!(
                "hash table slot {i} key type {:?} is not hashable",
                key.data_type()
            )));
        }
        if spec.num_partitions != relation.num_partitions {
            return Err(QuarryError::Plan(format!(
                "hash table slot {i} has {} partitions but relation '{}' has {}",
                spec.num_partitions, relation.name, relation.num_partitions
            )));
        }
    }
    for (i, spec) in context.generator_functions.iter().enumerate() {
        match spec {
            GeneratorFunctionSpec::Series { step, .. } => {
                if *step == 0 {
                    return Err(QuarryError::Plan(format!(
                        "generator slot {i} has zero step"
                    )));
                }
            }
        }
    }
    Ok(())
}

fn validate_aggregation_state(
    index: usize,
    spec: &AggregationStateSpec,
    catalog: &Catalog,
) -> Result<()> {
    let relation = catalog.get_relation(spec.input_relation).map_err(|_| {
        QuarryError::Plan(format!(
            "aggregation slot {index} references unknown relation {}",
            spec.input_relation
        ))
    })?;
    let key = relation
        .attribute(spec.key_attr)
        .map_err(|e| QuarryError::Plan(format!("aggregation slot {index}: {e}")))?;
    if !is_key_type(key.data_type()) {
        return Err(QuarryError::Plan(format!(
            "aggregation slot {index} group key type {:?} is not hashable",
            key.data_type()
        )));
    }
    if spec.num_partitions == 0 {
        return Err(QuarryError::Plan(format!(
            "aggregation slot {index} must have at least one state partition"
        )));
    }
    match (spec.function, &spec.argument) {
        (AggregateFunction::Count, None) => Ok(()),
        (AggregateFunction::Count, Some(_)) => Err(QuarryError::Plan(format!(
            "aggregation slot {index}: Count takes no argument"
        ))),
        (_, None) => Err(QuarryError::Plan(format!(
            "aggregation slot {index}: {:?} requires an argument",
            spec.function
        ))),
        (_, Some(argument)) => {
            let arg_type = validate_scalar(argument, &relation.schema)
                .map_err(|e| QuarryError::Plan(format!("aggregation slot {index}: {e}")))?;
            if !matches!(arg_type, DataType::Int64 | DataType::Float64) {
                return Err(QuarryError::Plan(format!(
                    "aggregation slot {index}: argument type {arg_type:?} is not numeric"
                )));
            }
            Ok(())
        }
    }
}

fn validate_operator(
    plan: &QueryPlan,
    op_index: OpIndex,
    op: &OperatorSpec,
    catalog: &Catalog,
) -> Result<()> {
    let context = &plan.context;
    match op {
        OperatorSpec::TableScan {
            relation_id,
            output_destination_index,
        } => {
            let input = catalog
                .get_relation(*relation_id)
                .map_err(|e| at_op(op_index, e))?;
            let dest =
                destination_relation(plan, catalog, op_index, *output_destination_index)?;
            check_types(op_index, &dest.schema, &schema_types(&input.schema))?;
            check_partitions(op_index, dest.num_partitions, input.num_partitions)
        }
        OperatorSpec::Selection {
            input_relation,
            input_is_stored,
            predicate_index,
            projection_indexes,
            output_destination_index,
        } => {
            let input = catalog
                .get_relation(*input_relation)
                .map_err(|e| at_op(op_index, e))?;
            if let Some(p) = predicate_index {
                let slot = context.predicates.get(*p).ok_or_else(|| {
                    QuarryError::Plan(format!(
                        "operator {op_index} references predicate slot {p} out of range"
                    ))
                })?;
                if slot.input_relation != *input_relation {
                    return Err(QuarryError::Plan(format!(
                        "operator {op_index} predicate slot {p} is typed against a different relation"
                    )));
                }
            }
            let mut out_types = Vec::new();
            for s in projection_indexes {
                let slot = context.scalars.get(*s).ok_or_else(|| {
                    QuarryError::Plan(format!(
                        "operator {op_index} references scalar slot {s} out of range"
                    ))
                })?;
                if slot.input_relation != *input_relation {
                    return Err(QuarryError::Plan(format!(
                        "operator {op_index} scalar slot {s} is typed against a different relation"
                    )));
                }
                out_types.push(validate_scalar(&slot.scalar, &input.schema)?);
            }
            if projection_indexes.is_empty() {
                out_types = schema_types(&input.schema);
            }
            if !*input_is_stored {
                check_has_pipelining_input(plan, op_index)?;
            }
            let dest =
                destination_relation(plan, catalog, op_index, *output_destination_index)?;
            check_types(op_index, &dest.schema, &out_types)?;
            check_partitions(op_index, dest.num_partitions, input.num_partitions)
        }
        OperatorSpec::BuildHash {
            input_relation,
            input_is_stored,
            hash_table_index,
        } => {
            catalog
                .get_relation(*input_relation)
                .map_err(|e| at_op(op_index, e))?;
            let table = context.join_hash_tables.get(*hash_table_index).ok_or_else(|| {
                QuarryError::Plan(format!(
                    "operator {op_index} references hash table slot {hash_table_index} out of range"
                ))
            })?;
            if table.build_relation != *input_relation {
                return Err(QuarryError::Plan(format!(
                    "operator {op_index} builds hash table slot {hash_table_index} over a different relation"
                )));
            }
            if !*input_is_stored {
                check_has_pipelining_input(plan, op_index)?;
            }
            Ok(())
        }
        OperatorSpec::HashJoin {
            probe_relation,
            probe_is_stored,
            hash_table_index,
            probe_key_attr,
            output_destination_index,
        } => {
            let probe = catalog
                .get_relation(*probe_relation)
                .map_err(|e| at_op(op_index, e))?;
            let table = context.join_hash_tables.get(*hash_table_index).ok_or_else(|| {
                QuarryError::Plan(format!(
                    "operator {op_index} references hash table slot {hash_table_index} out of range"
                ))
            })?;
            let build = catalog
                .get_relation(table.build_relation)
                .map_err(|e| at_op(op_index, e))?;
            let probe_key = probe
                .attribute(*probe_key_attr)
                .map_err(|e| at_op(op_index, e))?;
            let build_key = build
                .attribute(table.key_attr)
                .map_err(|e| at_op(op_index, e))?;
            if probe_key.data_type() != build_key.data_type() {
                return Err(QuarryError::Plan(format!(
                    "operator {op_index} probe key type {:?} does not match build key type {:?}",
                    probe_key.data_type(),
                    build_key.data_type()
                )));
            }
            if probe.num_partitions != table.num_partitions {
                return Err(QuarryError::Plan(format!(
                    "operator {op_index} probes a {}-way hash table with a {}-way relation",
                    table.num_partitions, probe.num_partitions
                )));
            }
            check_blocking_builder(plan, op_index, *hash_table_index)?;
            if !*probe_is_stored {
                check_has_pipelining_input(plan, op_index)?;
            }
            let mut out_types = schema_types(&probe.schema);
            out_types.extend(schema_types(&build.schema));
            let dest =
                destination_relation(plan, catalog, op_index, *output_destination_index)?;
            check_types(op_index, &dest.schema, &out_types)?;
            check_partitions(op_index, dest.num_partitions, probe.num_partitions)
        }
        OperatorSpec::InitializeAggregation { agg_state_index } => {
            check_agg_slot(plan, op_index, *agg_state_index)
        }
        OperatorSpec::Aggregation {
            input_relation,
            input_is_stored,
            agg_state_index,
        } => {
            check_agg_slot(plan, op_index, *agg_state_index)?;
            let spec = &context.aggregation_states[*agg_state_index];
            if spec.input_relation != *input_relation {
                return Err(QuarryError::Plan(format!(
                    "operator {op_index} accumulates aggregation slot {agg_state_index} over a different relation"
                )));
            }
            catalog
                .get_relation(*input_relation)
                .map_err(|e| at_op(op_index, e))?;
            if !*input_is_stored {
                check_has_pipelining_input(plan, op_index)?;
            }
            check_blocking_initializer(plan, op_index, *agg_state_index)?;
            Ok(())
        }
        OperatorSpec::FinalizeAggregation {
            agg_state_index,
            output_destination_index,
        } => {
            check_agg_slot(plan, op_index, *agg_state_index)?;
            let spec = &context.aggregation_states[*agg_state_index];
            let input = catalog
                .get_relation(spec.input_relation)
                .map_err(|e| at_op(op_index, e))?;
            let key_type = input.attribute(spec.key_attr)?.data_type().clone();
            let arg_type = match &spec.argument {
                Some(argument) => Some(validate_scalar(argument, &input.schema)?),
                None => None,
            };
            let value_type = aggregate_result_type(spec.function, arg_type.as_ref());
            let dest =
                destination_relation(plan, catalog, op_index, *output_destination_index)?;
            check_types(op_index, &dest.schema, &[key_type, value_type])?;
            if dest.num_partitions != 1 {
                return Err(QuarryError::Plan(format!(
                    "operator {op_index} finalization output must have exactly one partition"
                )));
            }
            Ok(())
        }
        OperatorSpec::Sort {
            input_relation,
            sort_keys,
            output_destination_index,
        } => {
            let input = catalog
                .get_relation(*input_relation)
                .map_err(|e| at_op(op_index, e))?;
            if sort_keys.is_empty() {
                return Err(QuarryError::Plan(format!(
                    "operator {op_index} has no sort keys"
                )));
            }
            for key in sort_keys {
                let field = input.attribute(key.attr_id).map_err(|e| at_op(op_index, e))?;
                if !matches!(
                    field.data_type(),
                    DataType::Int64 | DataType::Float64 | DataType::Utf8
                ) {
                    return Err(QuarryError::Plan(format!(
                        "operator {op_index} sort key type {:?} is not orderable",
                        field.data_type()
                    )));
                }
            }
            let dest =
                destination_relation(plan, catalog, op_index, *output_destination_index)?;
            check_types(op_index, &dest.schema, &schema_types(&input.schema))?;
            check_partitions(op_index, dest.num_partitions, input.num_partitions)
        }
        OperatorSpec::TableGenerator {
            generator_index,
            output_destination_index,
        } => {
            if *generator_index >= context.generator_functions.len() {
                return Err(QuarryError::Plan(format!(
                    "operator {op_index} references generator slot {generator_index} out of range"
                )));
            }
            let dest =
                destination_relation(plan, catalog, op_index, *output_destination_index)?;
            check_types(op_index, &dest.schema, &[DataType::Int64])
        }
    }
}

/// Result type of an aggregate function given its argument type.
pub fn aggregate_result_type(
    function: AggregateFunction,
    arg_type: Option<&DataType>,
) -> DataType {
    match function {
        AggregateFunction::Count => DataType::Int64,
        AggregateFunction::Avg => DataType::Float64,
        AggregateFunction::Sum | AggregateFunction::Min | AggregateFunction::Max => {
            arg_type.cloned().unwrap_or(DataType::Int64)
        }
    }
}

/// Number of work partitions an operator generates normal work orders over.
pub fn work_partitions(plan: &QueryPlan, op: OpIndex, catalog: &Catalog) -> Result<usize> {
    match &plan.operators[op] {
        OperatorSpec::TableScan { relation_id, .. } => {
            Ok(catalog.get_relation(*relation_id)?.num_partitions)
        }
        OperatorSpec::Selection { input_relation, .. }
        | OperatorSpec::BuildHash { input_relation, .. }
        | OperatorSpec::Aggregation { input_relation, .. }
        | OperatorSpec::Sort { input_relation, .. } => {
            Ok(catalog.get_relation(*input_relation)?.num_partitions)
        }
        OperatorSpec::HashJoin { probe_relation, .. } => {
            Ok(catalog.get_relation(*probe_relation)?.num_partitions)
        }
        OperatorSpec::InitializeAggregation { .. }
        | OperatorSpec::FinalizeAggregation { .. } => Ok(1),
        OperatorSpec::TableGenerator {
            output_destination_index,
            ..
        } => {
            let dest = &plan.context.insert_destinations[*output_destination_index];
            Ok(catalog.get_relation(dest.relation_id)?.num_partitions)
        }
    }
}

/// Number of output partitions an operator's completion is tracked over.
pub fn output_partitions(plan: &QueryPlan, op: OpIndex, catalog: &Catalog) -> Result<usize> {
    match &plan.operators[op] {
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
        } => {
            let dest = &plan.context.insert_destinations[*output_destination_index];
            Ok(catalog.get_relation(dest.relation_id)?.num_partitions)
        }
        OperatorSpec::BuildHash {
            hash_table_index, ..
        } => Ok(plan.context.join_hash_tables[*hash_table_index].num_partitions),
        OperatorSpec::Aggregation { agg_state_index, .. } => {
            Ok(plan.context.aggregation_states[*agg_state_index].num_partitions)
        }
        OperatorSpec::InitializeAggregation { .. } => Ok(1),
    }
}

// ------------------ helpers ------------------

fn at_op(op_index: OpIndex, e: QuarryError) -> QuarryError {
    QuarryError::Plan(format!("operator {op_index}: {e}"))
}

fn schema_types(schema: &arrow_schema::Schema) -> Vec<DataType> {
    schema
        .fields()
        .iter()
        .map(|f| f.data_type().clone())
        .collect()
}

fn is_key_type(dt: &DataType) -> bool {
    matches!(dt, DataType::Int64 | DataType::Utf8)
}

fn destination_relation(
    plan: &QueryPlan,
    catalog: &Catalog,
    op_index: OpIndex,
    dest_index: usize,
) -> Result<std::sync::Arc<quarry_storage::Relation>> {
    let dest = plan
        .context
        .insert_destinations
        .get(dest_index)
        .ok_or_else(|| {
            QuarryError::Plan(format!(
                "operator {op_index} references destination slot {dest_index} out of range"
            ))
        })?;
    catalog
        .get_relation(dest.relation_id)
        .map_err(|e| at_op(op_index, e))
}

fn check_types(
    op_index: OpIndex,
    dest_schema: &arrow_schema::Schema,
    produced: &[DataType],
) -> Result<()> {
    let dest_types = schema_types(dest_schema);
    if dest_types != produced {
        return Err(QuarryError::Plan(format!(
            "operator {op_index} produces types {produced:?} but its destination expects {dest_types:?}"
        )));
    }
    Ok(())
}

fn check_partitions(op_index: OpIndex, dest: usize, input: usize) -> Result<()> {
    if dest != input {
        return Err(QuarryError::Plan(format!(
            "operator {op_index} is partition-preserving but writes {input}-way input into a {dest}-way destination"
        )));
    }
    Ok(())
}

fn check_agg_slot(plan: &QueryPlan, op_index: OpIndex, agg_index: usize) -> Result<()> {
    if agg_index >= plan.context.aggregation_states.len() {
        return Err(QuarryError::Plan(format!(
            "operator {op_index} references aggregation slot {agg_index} out of range"
        )));
    }
    Ok(())
}

fn check_has_pipelining_input(plan: &QueryPlan, op_index: OpIndex) -> Result<()> {
    if plan.pipelining_dependencies(op_index).is_empty() {
        return Err(QuarryError::Plan(format!(
            "operator {op_index} expects streamed input but has no pipelining predecessor"
        )));
    }
    Ok(())
}

fn check_blocking_initializer(plan: &QueryPlan, op_index: OpIndex, agg_index: usize) -> Result<()> {
    let has_initializer = plan.blocking_dependencies(op_index).iter().any(|pred| {
        matches!(
            &plan.operators[*pred],
            OperatorSpec::InitializeAggregation { agg_state_index } if *agg_state_index == agg_index
        )
    });
    if !has_initializer {
        return Err(QuarryError::Plan(format!(
            "operator {op_index} accumulates aggregation slot {agg_index} without a blocking edge from its initializer"
        )));
    }
    Ok(())
}

fn check_blocking_builder(plan: &QueryPlan, op_index: OpIndex, hash_table_index: usize) -> Result<()> {
    let has_builder = plan.blocking_dependencies(op_index).iter().any(|pred| {
        matches!(
            &plan.operators[*pred],
            OperatorSpec::BuildHash { hash_table_index: built, .. } if *built == hash_table_index
        )
    });
    if !has_builder {
        return Err(QuarryError::Plan(format!(
            "operator {op_index} probes hash table slot {hash_table_index} without a blocking edge from its builder"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{ComparisonOp, LiteralValue, PredicateSpec, ScalarSpec};
    use crate::plan::{EdgeKind, EdgeSpec, InsertDestinationSpec, PredicateSlot};
    use arrow_schema::{Field, Schema};
    use quarry_common::QueryId;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("x", DataType::Int64, false),
        ])
    }

    fn scan_select_fixture() -> (Catalog, QueryPlan) {
        let catalog = Catalog::new();
        let input = catalog.add_relation("r", schema(), 4).unwrap();
        let scanned = catalog
            .add_temporary_relation("scanned", schema(), 4)
            .unwrap();
        let output = catalog
            .add_temporary_relation("out", schema(), 4)
            .unwrap();
        let plan = QueryPlan {
            query_id: QueryId(1),
            operators: vec![
                OperatorSpec::TableScan {
                    relation_id: input,
                    output_destination_index: 0,
                },
                OperatorSpec::Selection {
                    input_relation: scanned,
                    input_is_stored: false,
                    predicate_index: Some(0),
                    projection_indexes: vec![],
                    output_destination_index: 1,
                },
            ],
            edges: vec![EdgeSpec {
                src: 0,
                dst: 1,
                kind: EdgeKind::Pipelining,
            }],
            context: ContextSchema {
                insert_destinations: vec![
                    InsertDestinationSpec {
                        relation_id: scanned,
                    },
                    InsertDestinationSpec {
                        relation_id: output,
                    },
                ],
                predicates: vec![PredicateSlot {
                    input_relation: scanned,
                    predicate: PredicateSpec::Comparison {
                        op: ComparisonOp::Gt,
                        left: ScalarSpec::Attribute { attr_id: 1 },
                        right: ScalarSpec::Literal(LiteralValue::Int64(10)),
                    },
                }],
                ..ContextSchema::default()
            },
            root_op: 1,
        };
        (catalog, plan)
    }

    #[test]
    fn accepts_well_formed_plan() {
        let (catalog, plan) = scan_select_fixture();
        validate_plan(&plan, &catalog).unwrap();
        assert_eq!(work_partitions(&plan, 0, &catalog).unwrap(), 4);
        assert_eq!(output_partitions(&plan, 1, &catalog).unwrap(), 4);
    }

    #[test]
    fn rejects_dangling_attribute_reference() {
        let (catalog, mut plan) = scan_select_fixture();
        plan.context.predicates[0].predicate = PredicateSpec::Comparison {
            op: ComparisonOp::Gt,
            left: ScalarSpec::Attribute { attr_id: 17 },
            right: ScalarSpec::Literal(LiteralValue::Int64(10)),
        };
        let err = validate_plan(&plan, &catalog).unwrap_err();
        assert!(matches!(err, QuarryError::Plan(_)));
    }

    #[test]
    fn rejects_out_of_range_context_slot() {
        let (catalog, mut plan) = scan_select_fixture();
        plan.operators[1] = OperatorSpec::Selection {
            input_relation: plan.context.insert_destinations[0].relation_id,
            input_is_stored: false,
            predicate_index: Some(9),
            projection_indexes: vec![],
            output_destination_index: 1,
        };
        assert!(validate_plan(&plan, &catalog).is_err());
    }

    #[test]
    fn rejects_cyclic_dependencies() {
        let (catalog, mut plan) = scan_select_fixture();
        plan.edges.push(EdgeSpec {
            src: 1,
            dst: 0,
            kind: EdgeKind::Blocking,
        });
        assert!(validate_plan(&plan, &catalog).is_err());
    }

    #[test]
    fn rejects_probe_without_blocking_builder() {
        let catalog = Catalog::new();
        let probe = catalog.add_relation("r", schema(), 2).unwrap();
        let build = catalog.add_relation("s", schema(), 2).unwrap();
        let out_schema = Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("x", DataType::Int64, false),
            Field::new("k2", DataType::Int64, false),
            Field::new("x2", DataType::Int64, false),
        ]);
        let out = catalog.add_temporary_relation("out", out_schema, 2).unwrap();
        let plan = QueryPlan {
            query_id: QueryId(1),
            operators: vec![OperatorSpec::HashJoin {
                probe_relation: probe,
                probe_is_stored: true,
                hash_table_index: 0,
                probe_key_attr: 0,
                output_destination_index: 0,
            }],
            edges: vec![],
            context: ContextSchema {
                insert_destinations: vec![InsertDestinationSpec { relation_id: out }],
                join_hash_tables: vec![crate::plan::HashTableSpec {
                    build_relation: build,
                    key_attr: 0,
                    num_partitions: 2,
                }],
                ..ContextSchema::default()
            },
            root_op: 0,
        };
        assert!(validate_plan(&plan, &catalog).is_err());
    }
}
