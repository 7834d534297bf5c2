//! Generator-function leaf feeding a blocking whole-partition sort.

mod support;

use arrow_schema::{DataType, Field, Schema};
use quarry_common::QueryId;
use quarry_execution::QueryResultStatus;
use quarry_plan::{
    ContextSchema, EdgeKind, EdgeSpec, GeneratorFunctionSpec, InsertDestinationSpec,
    OperatorSpec, QueryPlan, SortKeySpec,
};
use support::{Fixture, Harness};

fn value_schema() -> Schema {
    Schema::new(vec![Field::new("v", DataType::Int64, false)])
}

#[test]
fn generated_series_is_sorted_descending_per_partition() {
    let fixture = Fixture::new(32);
    let generated = fixture
        .catalog
        .add_temporary_relation("gen", value_schema(), 2)
        .unwrap();
    let output = fixture
        .catalog
        .add_relation("sorted", value_schema(), 2)
        .unwrap();
    let plan = QueryPlan {
        query_id: QueryId(5),
        operators: vec![
            OperatorSpec::TableGenerator {
                generator_index: 0,
                output_destination_index: 0,
            },
            OperatorSpec::Sort {
                input_relation: generated,
                sort_keys: vec![SortKeySpec {
                    attr_id: 0,
                    descending: true,
                }],
                output_destination_index: 1,
            },
        ],
        edges: vec![EdgeSpec {
            src: 0,
            dst: 1,
            kind: EdgeKind::Blocking,
        }],
        context: ContextSchema {
            insert_destinations: vec![
                InsertDestinationSpec {
                    relation_id: generated,
                },
                InsertDestinationSpec {
                    relation_id: output,
                },
            ],
            generator_functions: vec![GeneratorFunctionSpec::Series {
                start: 0,
                stop: 100,
                step: 1,
            }],
            ..ContextSchema::default()
        },
        root_op: 1,
    };

    let mut harness = Harness::new(&fixture, plan).unwrap();
    assert_eq!(harness.run(), QueryResultStatus::Succeeded);

    let snapshot = harness.manager.status_snapshot();
    assert_eq!(snapshot.operators[0].dispatched_normal, 2);
    assert_eq!(snapshot.operators[1].dispatched_normal, 2);

    // Partition 0 holds 49..0, partition 1 holds 99..50, each descending.
    let values = fixture.read_column(output, 0);
    let expected: Vec<i64> = (0..50).rev().chain((50..100).rev()).collect();
    assert_eq!(values, expected);
}
