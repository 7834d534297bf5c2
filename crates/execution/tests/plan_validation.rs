//! Plan validation rejects malformed plans before any execution state exists.

mod support;

use quarry_common::{QuarryError, QueryId, RelationId};
use quarry_plan::{
    ComparisonOp, ContextSchema, EdgeKind, EdgeSpec, InsertDestinationSpec, LiteralValue,
    OperatorSpec, PredicateSlot, PredicateSpec, QueryPlan, ScalarSpec,
};
use support::{kx_batch, kx_schema, Fixture, Harness};

fn fixture_with_plan(predicate_attr: usize) -> (Fixture, QueryPlan, RelationId, RelationId) {
    let fixture = Fixture::new(100);
    let input = fixture.load_table("r", kx_schema(), vec![vec![kx_batch(&[(1, 5), (2, 20)])]]);
    let scanned = fixture
        .catalog
        .add_temporary_relation("q6_scanned", kx_schema(), 1)
        .unwrap();
    let output = fixture.catalog.add_relation("q6_out", kx_schema(), 1).unwrap();
    let plan = QueryPlan {
        query_id: QueryId(6),
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
                    left: ScalarSpec::Attribute {
                        attr_id: predicate_attr,
                    },
                    right: ScalarSpec::Literal(LiteralValue::Int64(10)),
                },
            }],
            ..ContextSchema::default()
        },
        root_op: 1,
    };
    (fixture, plan, scanned, output)
}

#[test]
fn dangling_attribute_fails_before_any_work_order_exists() {
    let (fixture, plan, scanned, output) = fixture_with_plan(17);
    let err = Harness::new(&fixture, plan)
        .err()
        .expect("validation must fail");
    assert!(matches!(err, QuarryError::Plan(_)));
    // Nothing was mutated: no intermediate or output blocks exist.
    assert_eq!(fixture.num_blocks(scanned), 0);
    assert_eq!(fixture.num_blocks(output), 0);
}

#[test]
fn well_formed_variant_of_the_same_plan_is_accepted() {
    let (fixture, plan, _, _) = fixture_with_plan(1);
    assert!(Harness::new(&fixture, plan).is_ok());
}

#[test]
fn unknown_destination_relation_is_rejected() {
    let (fixture, mut plan, _, _) = fixture_with_plan(1);
    plan.context.insert_destinations[1].relation_id = RelationId(999);
    let err = Harness::new(&fixture, plan)
        .err()
        .expect("validation must fail");
    assert!(matches!(err, QuarryError::Plan(_)));
}

#[test]
fn malformed_wire_payload_is_rejected() {
    assert!(matches!(
        QueryPlan::from_bytes(b"{\"query_id\": \"oops\"").unwrap_err(),
        QuarryError::Plan(_)
    ));
}

#[test]
fn valid_plan_survives_a_wire_round_trip() {
    let (fixture, plan, _, _) = fixture_with_plan(1);
    let bytes = plan.to_bytes().unwrap();
    let decoded = QueryPlan::from_bytes(&bytes).unwrap();
    assert_eq!(decoded, plan);
    assert!(Harness::new(&fixture, decoded).is_ok());
}
