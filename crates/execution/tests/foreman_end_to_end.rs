//! Threaded end-to-end runs through the foreman and worker pool.

mod support;

use std::sync::Arc;
use std::time::Duration;

use quarry_common::{ExecutionConfig, QueryId, RelationId};
use quarry_execution::{
    ExecutionMessage, Foreman, MessageBus, QueryResultStatus,
};
use quarry_plan::{
    ComparisonOp, ContextSchema, EdgeKind, EdgeSpec, InsertDestinationSpec, LiteralValue,
    OperatorSpec, PredicateSlot, PredicateSpec, QueryPlan, ScalarSpec,
};
use support::{kx_batch, kx_schema, Fixture};

fn rows(n: usize, k: i64, x: i64) -> Vec<(i64, i64)> {
    (0..n).map(|_| (k, x)).collect()
}

fn scan_filter_plan(fixture: &Fixture, query_id: u64, tag: &str) -> (QueryPlan, RelationId) {
    let input = fixture.load_table(
        &format!("r_{tag}"),
        kx_schema(),
        vec![
            vec![kx_batch(&rows(100, 1, 5))],
            vec![kx_batch(&rows(100, 2, 20))],
            vec![kx_batch(&rows(100, 3, 20))],
            vec![kx_batch(&rows(100, 4, 5))],
        ],
    );
    let scanned = fixture
        .catalog
        .add_temporary_relation(format!("scanned_{tag}"), kx_schema(), 4)
        .unwrap();
    let output = fixture
        .catalog
        .add_relation(format!("out_{tag}"), kx_schema(), 4)
        .unwrap();
    let plan = QueryPlan {
        query_id: QueryId(query_id),
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
    (plan, output)
}

fn await_completion(
    rx: &crossbeam_channel::Receiver<ExecutionMessage>,
    query_id: QueryId,
) -> QueryResultStatus {
    loop {
        match rx
            .recv_timeout(Duration::from_secs(10))
            .expect("query did not complete in time")
        {
            ExecutionMessage::QueryComplete(complete) if complete.query_id == query_id => {
                return complete.status;
            }
            _ => continue,
        }
    }
}

#[test]
fn scan_filter_runs_across_the_worker_pool() {
    support::init_tracing();
    let fixture = Fixture::new(100);
    let (plan, output) = scan_filter_plan(&fixture, 7, "a");

    let bus = Arc::new(MessageBus::new());
    let (client_id, client_rx) = bus.register_client();
    let handle = Foreman::start(
        Arc::clone(&bus),
        Arc::clone(&fixture.catalog),
        Arc::clone(&fixture.storage),
        ExecutionConfig {
            num_workers: 4,
            num_numa_nodes: 2,
            batch_size_rows: 100,
            ..ExecutionConfig::default()
        },
    )
    .unwrap();

    handle.submit_query(plan, client_id).unwrap();
    assert_eq!(await_completion(&client_rx, QueryId(7)), QueryResultStatus::Succeeded);

    let surviving = fixture.read_column(output, 1);
    assert_eq!(surviving.len(), 200);
    assert!(surviving.iter().all(|x| *x == 20));
    handle.shutdown();
}

#[test]
fn invalid_plan_is_rejected_with_a_failed_status() {
    let fixture = Fixture::new(100);
    let (mut plan, _) = scan_filter_plan(&fixture, 8, "b");
    plan.context.predicates[0].predicate = PredicateSpec::Comparison {
        op: ComparisonOp::Gt,
        left: ScalarSpec::Attribute { attr_id: 42 },
        right: ScalarSpec::Literal(LiteralValue::Int64(10)),
    };

    let bus = Arc::new(MessageBus::new());
    let (client_id, client_rx) = bus.register_client();
    let handle = Foreman::start(
        Arc::clone(&bus),
        Arc::clone(&fixture.catalog),
        Arc::clone(&fixture.storage),
        ExecutionConfig::default(),
    )
    .unwrap();

    handle.submit_query(plan, client_id).unwrap();
    match await_completion(&client_rx, QueryId(8)) {
        QueryResultStatus::Failed(message) => assert!(message.contains("plan error")),
        other => panic!("expected rejection, got {other:?}"),
    }
    handle.shutdown();
}

#[test]
fn concurrent_queries_are_isolated() {
    let fixture = Fixture::new(100);
    let (plan_a, out_a) = scan_filter_plan(&fixture, 10, "c");
    let (plan_b, out_b) = scan_filter_plan(&fixture, 11, "d");

    let bus = Arc::new(MessageBus::new());
    let (client_id, client_rx) = bus.register_client();
    let handle = Foreman::start(
        Arc::clone(&bus),
        Arc::clone(&fixture.catalog),
        Arc::clone(&fixture.storage),
        ExecutionConfig {
            num_workers: 4,
            batch_size_rows: 100,
            ..ExecutionConfig::default()
        },
    )
    .unwrap();

    handle.submit_query(plan_a, client_id).unwrap();
    handle.submit_query(plan_b, client_id).unwrap();

    // Completions may arrive in either order.
    let mut statuses = std::collections::HashMap::new();
    while statuses.len() < 2 {
        match client_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("queries did not complete in time")
        {
            ExecutionMessage::QueryComplete(complete) => {
                statuses.insert(complete.query_id, complete.status);
            }
            _ => continue,
        }
    }
    assert_eq!(statuses.get(&QueryId(10)), Some(&QueryResultStatus::Succeeded));
    assert_eq!(statuses.get(&QueryId(11)), Some(&QueryResultStatus::Succeeded));
    assert_eq!(fixture.read_column(out_a, 1).len(), 200);
    assert_eq!(fixture.read_column(out_b, 1).len(), 200);
    handle.shutdown();
}
