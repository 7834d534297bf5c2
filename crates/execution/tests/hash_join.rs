//! Hash-join build/probe scheduling discipline and correctness.

mod support;

use arrow_schema::{DataType, Field, Schema};
use quarry_common::QueryId;
use quarry_execution::QueryResultStatus;
use quarry_plan::{
    ContextSchema, EdgeKind, EdgeSpec, HashTableSpec, InsertDestinationSpec, OperatorSpec,
    QueryPlan,
};
use support::{kx_batch, kx_schema, Fixture, Harness};

fn join_output_schema() -> Schema {
    Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("x", DataType::Int64, false),
        Field::new("k2", DataType::Int64, false),
        Field::new("x2", DataType::Int64, false),
    ])
}

#[test]
fn probe_waits_for_its_build_partition_and_joins_correctly() {
    let fixture = Fixture::new(64);
    // Both relations are co-partitioned by key modulo 2.
    let build = fixture.load_table(
        "s",
        kx_schema(),
        vec![
            vec![kx_batch(&[(2, 200), (4, 400)])],
            vec![kx_batch(&[(1, 100), (3, 300)])],
        ],
    );
    let probe = fixture.load_table(
        "r",
        kx_schema(),
        vec![
            vec![kx_batch(&[(2, 20), (2, 21), (6, 60)])],
            vec![kx_batch(&[(1, 10), (3, 30), (5, 50)])],
        ],
    );
    let output = fixture
        .catalog
        .add_relation("join_out", join_output_schema(), 2)
        .unwrap();
    let plan = QueryPlan {
        query_id: QueryId(3),
        operators: vec![
            OperatorSpec::BuildHash {
                input_relation: build,
                input_is_stored: true,
                hash_table_index: 0,
            },
            OperatorSpec::HashJoin {
                probe_relation: probe,
                probe_is_stored: true,
                hash_table_index: 0,
                probe_key_attr: 0,
                output_destination_index: 0,
            },
        ],
        edges: vec![EdgeSpec {
            src: 0,
            dst: 1,
            kind: EdgeKind::Blocking,
        }],
        context: ContextSchema {
            insert_destinations: vec![InsertDestinationSpec {
                relation_id: output,
            }],
            join_hash_tables: vec![HashTableSpec {
                build_relation: build,
                key_attr: 0,
                num_partitions: 2,
            }],
            ..ContextSchema::default()
        },
        root_op: 1,
    };

    let mut harness = Harness::new(&fixture, plan).unwrap();
    assert_eq!(harness.run(), QueryResultStatus::Succeeded);

    // Per partition: every build order completes before the first probe
    // order of the same partition is dispatched.
    for part in 0..2 {
        let last_build = harness
            .dispatch_log
            .iter()
            .rposition(|(op, p, _)| *op == 0 && *p == part)
            .unwrap();
        let first_probe = harness
            .dispatch_log
            .iter()
            .position(|(op, p, _)| *op == 1 && *p == part)
            .unwrap();
        assert!(last_build < first_probe);
    }

    // Set-equivalent join result.
    let keys = fixture.read_column(output, 0);
    let probe_x = fixture.read_column(output, 1);
    let build_k = fixture.read_column(output, 2);
    let build_x = fixture.read_column(output, 3);
    let mut joined: Vec<(i64, i64, i64, i64)> = keys
        .into_iter()
        .zip(probe_x)
        .zip(build_k)
        .zip(build_x)
        .map(|(((k, x), k2), x2)| (k, x, k2, x2))
        .collect();
    joined.sort();
    assert_eq!(
        joined,
        vec![
            (1, 10, 1, 100),
            (2, 20, 2, 200),
            (2, 21, 2, 200),
            (3, 30, 3, 300),
        ]
    );
}
