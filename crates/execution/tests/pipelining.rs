//! Pipelined execution: the consumer runs one work order per streamed block.

mod support;

use quarry_common::QueryId;
use quarry_execution::QueryResultStatus;
use quarry_plan::{
    ContextSchema, EdgeKind, EdgeSpec, InsertDestinationSpec, OperatorSpec, QueryPlan,
};
use support::{kx_batch, kx_schema, Fixture, Harness};

#[test]
fn one_consumer_work_order_per_streamed_block() {
    let fixture = Fixture::new(10);
    // Five stored blocks of ten rows each.
    let blocks = (0..5i64)
        .map(|b| kx_batch(&(0..10i64).map(|i| (b, b * 10 + i)).collect::<Vec<_>>()))
        .collect::<Vec<_>>();
    let input = fixture.load_table("r", kx_schema(), vec![blocks]);
    let scanned = fixture
        .catalog
        .add_temporary_relation("q4_scanned", kx_schema(), 1)
        .unwrap();
    let output = fixture.catalog.add_relation("q4_out", kx_schema(), 1).unwrap();
    let plan = QueryPlan {
        query_id: QueryId(4),
        operators: vec![
            OperatorSpec::TableScan {
                relation_id: input,
                output_destination_index: 0,
            },
            OperatorSpec::Selection {
                input_relation: scanned,
                input_is_stored: false,
                predicate_index: None,
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
            ..ContextSchema::default()
        },
        root_op: 1,
    };

    let mut harness = Harness::new(&fixture, plan).unwrap();
    assert_eq!(harness.run(), QueryResultStatus::Succeeded);

    let snapshot = harness.manager.status_snapshot();
    let scanned_blocks = fixture.num_blocks(scanned);
    assert_eq!(snapshot.operators[0].dispatched_normal, 5);
    assert_eq!(scanned_blocks, 5);
    // Streamed blocks emitted == consumer work orders executed.
    assert_eq!(snapshot.operators[1].dispatched_normal, scanned_blocks);
    assert_eq!(fixture.read_column(output, 0).len(), 50);
}
