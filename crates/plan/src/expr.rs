//! Serialized scalar/predicate trees and their paired factories.
//!
//! Factory contract:
//! - `validate_scalar` / `validate_predicate` check a serialized tree against
//!   an input schema and compute its output type, without building anything;
//! - `compile_scalar` / `compile_predicate` reconstruct runnable expressions;
//!   callers MUST validate first; compilation assumes a validated tree.
//!
//! Evaluation contract: each evaluation returns an array aligned to the input
//! batch row count.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Float64Array, Float64Builder, Int64Array,
    Int64Builder, StringArray, StringBuilder,
};
use arrow::compute::kernels::{
    boolean::{and_kleene, not, or_kleene},
    cmp::{eq, gt, gt_eq, lt, lt_eq, neq},
    numeric::{add, div, mul, sub},
};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Schema};
use quarry_common::{AttributeId, QuarryError, Result};
use serde::{Deserialize, Serialize};

/// Literal constant in a serialized expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiteralValue {
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit float.
    Float64(f64),
    /// UTF-8 string.
    Utf8(String),
    /// Boolean.
    Boolean(bool),
}

impl LiteralValue {
    fn data_type(&self) -> DataType {
        match self {
            LiteralValue::Int64(_) => DataType::Int64,
            LiteralValue::Float64(_) => DataType::Float64,
            LiteralValue::Utf8(_) => DataType::Utf8,
            LiteralValue::Boolean(_) => DataType::Boolean,
        }
    }
}

/// Arithmetic operator in a serialized scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    /// Addition.
    Plus,
    /// Subtraction.
    Minus,
    /// Multiplication.
    Multiply,
    /// Division.
    Divide,
}

/// Comparison operator in a serialized predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOp {
    /// Equality.
    Eq,
    /// Inequality.
    NotEq,
    /// Less than.
    Lt,
    /// Less than or equal.
    LtEq,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    GtEq,
}

/// Serialized scalar expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarSpec {
    /// Input attribute by dense column index.
    Attribute {
        /// Column index into the input schema.
        attr_id: AttributeId,
    },
    /// Literal constant.
    Literal(LiteralValue),
    /// Binary arithmetic over two scalars of the same numeric type.
    BinaryOp {
        /// Arithmetic operator.
        op: BinaryOp,
        /// Left operand.
        left: Box<ScalarSpec>,
        /// Right operand.
        right: Box<ScalarSpec>,
    },
}

/// Serialized predicate expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PredicateSpec {
    /// Always true.
    True,
    /// Always false.
    False,
    /// Scalar comparison.
    Comparison {
        /// Comparison operator.
        op: ComparisonOp,
        /// Left operand.
        left: ScalarSpec,
        /// Right operand.
        right: ScalarSpec,
    },
    /// Negation.
    Not(Box<PredicateSpec>),
    /// Conjunction (empty conjunction is true).
    And(Vec<PredicateSpec>),
    /// Disjunction (empty disjunction is false).
    Or(Vec<PredicateSpec>),
}

/// Validates a serialized scalar against an input schema; returns its type.
pub fn validate_scalar(spec: &ScalarSpec, schema: &Schema) -> Result<DataType> {
    match spec {
        ScalarSpec::Attribute { attr_id } => {
            if *attr_id >= schema.fields().len() {
                return Err(QuarryError::Plan(format!(
                    "scalar references attribute {attr_id} outside the input schema"
                )));
            }
            Ok(schema.field(*attr_id).data_type().clone())
        }
        ScalarSpec::Literal(v) => Ok(v.data_type()),
        ScalarSpec::BinaryOp { op, left, right } => {
            let lt = validate_scalar(left, schema)?;
            let rt = validate_scalar(right, schema)?;
            if lt != rt {
                return Err(QuarryError::Plan(format!(
                    "arithmetic {op:?} over mismatched types {lt:?} vs {rt:?}"
                )));
            }
            if !matches!(lt, DataType::Int64 | DataType::Float64) {
                return Err(QuarryError::Plan(format!(
                    "arithmetic {op:?} unsupported for type {lt:?}"
                )));
            }
            Ok(lt)
        }
    }
}

/// Validates a serialized predicate against an input schema.
pub fn validate_predicate(spec: &PredicateSpec, schema: &Schema) -> Result<()> {
    match spec {
        PredicateSpec::True | PredicateSpec::False => Ok(()),
        PredicateSpec::Comparison { op, left, right } => {
            let lt = validate_scalar(left, schema)?;
            let rt = validate_scalar(right, schema)?;
            if lt != rt {
                return Err(QuarryError::Plan(format!(
                    "comparison {op:?} over mismatched types {lt:?} vs {rt:?}"
                )));
            }
            if lt == DataType::Boolean && !matches!(op, ComparisonOp::Eq | ComparisonOp::NotEq) {
                return Err(QuarryError::Plan(
                    "ordering comparisons unsupported for boolean".to_string(),
                ));
            }
            Ok(())
        }
        PredicateSpec::Not(inner) => validate_predicate(inner, schema),
        PredicateSpec::And(children) | PredicateSpec::Or(children) => {
            for child in children {
                validate_predicate(child, schema)?;
            }
            Ok(())
        }
    }
}

/// Runnable scalar expression.
pub trait PhysicalScalar: Send + Sync {
    /// Static output data type.
    fn data_type(&self) -> DataType;
    /// Evaluates the expression for every row in `batch`.
    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef>;
}

/// Runnable predicate.
pub trait PhysicalPredicate: Send + Sync {
    /// Evaluates the predicate for every row in `batch`.
    fn evaluate(&self, batch: &RecordBatch) -> Result<BooleanArray>;
}

/// Shared runnable-scalar handle.
pub type CompiledScalar = Arc<dyn PhysicalScalar>;
/// Shared runnable-predicate handle.
pub type CompiledPredicate = Arc<dyn PhysicalPredicate>;

/// Reconstructs a runnable scalar from a validated tree.
pub fn compile_scalar(spec: &ScalarSpec, schema: &Schema) -> Result<CompiledScalar> {
    match spec {
        ScalarSpec::Attribute { attr_id } => {
            let dt = schema.field(*attr_id).data_type().clone();
            Ok(Arc::new(AttributeScalar {
                index: *attr_id,
                dt,
            }))
        }
        ScalarSpec::Literal(v) => Ok(Arc::new(LiteralScalar { v: v.clone() })),
        ScalarSpec::BinaryOp { op, left, right } => {
            let l = compile_scalar(left, schema)?;
            let r = compile_scalar(right, schema)?;
            let out = l.data_type();
            Ok(Arc::new(BinaryScalar {
                left: l,
                right: r,
                op: *op,
                out,
            }))
        }
    }
}

/// Reconstructs a runnable predicate from a validated tree.
pub fn compile_predicate(spec: &PredicateSpec, schema: &Schema) -> Result<CompiledPredicate> {
    match spec {
        PredicateSpec::True => Ok(Arc::new(ConstPredicate { value: true })),
        PredicateSpec::False => Ok(Arc::new(ConstPredicate { value: false })),
        PredicateSpec::Comparison { op, left, right } => Ok(Arc::new(ComparisonPredicate {
            left: compile_scalar(left, schema)?,
            right: compile_scalar(right, schema)?,
            op: *op,
        })),
        PredicateSpec::Not(inner) => Ok(Arc::new(NotPredicate {
            inner: compile_predicate(inner, schema)?,
        })),
        PredicateSpec::And(children) => Ok(Arc::new(ConjunctionPredicate {
            children: children
                .iter()
                .map(|c| compile_predicate(c, schema))
                .collect::<Result<Vec<_>>>()?,
            conjunctive: true,
        })),
        PredicateSpec::Or(children) => Ok(Arc::new(ConjunctionPredicate {
            children: children
                .iter()
                .map(|c| compile_predicate(c, schema))
                .collect::<Result<Vec<_>>>()?,
            conjunctive: false,
        })),
    }
}

// =====================
// Scalar implementations
// =====================

struct AttributeScalar {
    index: usize,
    dt: DataType,
}

impl PhysicalScalar for AttributeScalar {
    fn data_type(&self) -> DataType {
        self.dt.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        Ok(batch.column(self.index).clone())
    }
}

struct LiteralScalar {
    v: LiteralValue,
}

impl PhysicalScalar for LiteralScalar {
    fn data_type(&self) -> DataType {
        self.v.data_type()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        literal_to_array(&self.v, batch.num_rows())
    }
}

struct BinaryScalar {
    left: CompiledScalar,
    right: CompiledScalar,
    op: BinaryOp,
    out: DataType,
}

impl PhysicalScalar for BinaryScalar {
    fn data_type(&self) -> DataType {
        self.out.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let l = self.left.evaluate(batch)?;
        let r = self.right.evaluate(batch)?;
        eval_arith(self.op, &l, &r, &self.out)
    }
}

// =====================
// Predicate implementations
// =====================

struct ConstPredicate {
    value: bool,
}

impl PhysicalPredicate for ConstPredicate {
    fn evaluate(&self, batch: &RecordBatch) -> Result<BooleanArray> {
        let mut b = BooleanBuilder::with_capacity(batch.num_rows());
        for _ in 0..batch.num_rows() {
            b.append_value(self.value);
        }
        Ok(b.finish())
    }
}

struct ComparisonPredicate {
    left: CompiledScalar,
    right: CompiledScalar,
    op: ComparisonOp,
}

impl PhysicalPredicate for ComparisonPredicate {
    fn evaluate(&self, batch: &RecordBatch) -> Result<BooleanArray> {
        let l = self.left.evaluate(batch)?;
        let r = self.right.evaluate(batch)?;
        eval_cmp(self.op, &l, &r)
    }
}

struct NotPredicate {
    inner: CompiledPredicate,
}

impl PhysicalPredicate for NotPredicate {
    fn evaluate(&self, batch: &RecordBatch) -> Result<BooleanArray> {
        let inner = self.inner.evaluate(batch)?;
        not(&inner).map_err(|e| QuarryError::Execution(format!("not kernel failed: {e}")))
    }
}

struct ConjunctionPredicate {
    children: Vec<CompiledPredicate>,
    conjunctive: bool,
}

impl PhysicalPredicate for ConjunctionPredicate {
    fn evaluate(&self, batch: &RecordBatch) -> Result<BooleanArray> {
        let mut acc: Option<BooleanArray> = None;
        for child in &self.children {
            let value = child.evaluate(batch)?;
            acc = Some(match acc {
                None => value,
                Some(prev) => if self.conjunctive {
                    and_kleene(&prev, &value)
                } else {
                    or_kleene(&prev, &value)
                }
                .map_err(|e| QuarryError::Execution(format!("boolean kernel failed: {e}")))?,
            });
        }
        match acc {
            Some(out) => Ok(out),
            // Empty conjunction is true, empty disjunction is false.
            None => {
                let mut b = BooleanBuilder::with_capacity(batch.num_rows());
                for _ in 0..batch.num_rows() {
                    b.append_value(self.conjunctive);
                }
                Ok(b.finish())
            }
        }
    }
}

// ------------------ helpers ------------------

fn literal_to_array(v: &LiteralValue, len: usize) -> Result<ArrayRef> {
    match v {
        LiteralValue::Int64(x) => {
            let mut b = Int64Builder::with_capacity(len);
            for _ in 0..len {
                b.append_value(*x);
            }
            Ok(Arc::new(b.finish()))
        }
        LiteralValue::Float64(x) => {
            let mut b = Float64Builder::with_capacity(len);
            for _ in 0..len {
                b.append_value(*x);
            }
            Ok(Arc::new(b.finish()))
        }
        LiteralValue::Boolean(x) => {
            let mut b = BooleanBuilder::with_capacity(len);
            for _ in 0..len {
                b.append_value(*x);
            }
            Ok(Arc::new(b.finish()))
        }
        LiteralValue::Utf8(s) => {
            let mut b = StringBuilder::with_capacity(len, s.len() * len);
            for _ in 0..len {
                b.append_value(s);
            }
            Ok(Arc::new(b.finish()))
        }
    }
}

fn eval_arith(op: BinaryOp, l: &ArrayRef, r: &ArrayRef, out: &DataType) -> Result<ArrayRef> {
    match out {
        DataType::Int64 => {
            let la = l
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| QuarryError::Execution("expected Int64 array".to_string()))?;
            let ra = r
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| QuarryError::Execution("expected Int64 array".to_string()))?;
            let res = match op {
                BinaryOp::Plus => add(la, ra),
                BinaryOp::Minus => sub(la, ra),
                BinaryOp::Multiply => mul(la, ra),
                BinaryOp::Divide => div(la, ra),
            }
            .map_err(|e| QuarryError::Execution(format!("arith kernel failed: {e}")))?;
            Ok(res)
        }
        DataType::Float64 => {
            let la = l
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| QuarryError::Execution("expected Float64 array".to_string()))?;
            let ra = r
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| QuarryError::Execution("expected Float64 array".to_string()))?;
            let res = match op {
                BinaryOp::Plus => add(la, ra),
                BinaryOp::Minus => sub(la, ra),
                BinaryOp::Multiply => mul(la, ra),
                BinaryOp::Divide => div(la, ra),
            }
            .map_err(|e| QuarryError::Execution(format!("arith kernel failed: {e}")))?;
            Ok(res)
        }
        other => Err(QuarryError::Execution(format!(
            "arith not supported for type {other:?}"
        ))),
    }
}

fn eval_cmp(op: ComparisonOp, l: &ArrayRef, r: &ArrayRef) -> Result<BooleanArray> {
    match l.data_type() {
        DataType::Int64 => {
            let la = l
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| QuarryError::Execution("expected Int64 array".to_string()))?;
            let ra = r
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| QuarryError::Execution("expected Int64 array".to_string()))?;
            cmp_kernel(op, la, ra)
        }
        DataType::Float64 => {
            let la = l
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| QuarryError::Execution("expected Float64 array".to_string()))?;
            let ra = r
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| QuarryError::Execution("expected Float64 array".to_string()))?;
            cmp_kernel(op, la, ra)
        }
        DataType::Utf8 => {
            let la = l
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| QuarryError::Execution("expected Utf8 array".to_string()))?;
            let ra = r
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| QuarryError::Execution("expected Utf8 array".to_string()))?;
            cmp_kernel(op, la, ra)
        }
        DataType::Boolean => {
            let la = l
                .as_any()
                .downcast_ref::<BooleanArray>()
                .ok_or_else(|| QuarryError::Execution("expected Boolean array".to_string()))?;
            let ra = r
                .as_any()
                .downcast_ref::<BooleanArray>()
                .ok_or_else(|| QuarryError::Execution("expected Boolean array".to_string()))?;
            match op {
                ComparisonOp::Eq | ComparisonOp::NotEq => cmp_kernel(op, la, ra),
                _ => Err(QuarryError::Execution(
                    "ordering comparisons unsupported for boolean".to_string(),
                )),
            }
        }
        other => Err(QuarryError::Execution(format!(
            "comparison not supported for {other:?}"
        ))),
    }
}

fn cmp_kernel<A: arrow::array::Datum>(op: ComparisonOp, la: &A, ra: &A) -> Result<BooleanArray> {
    match op {
        ComparisonOp::Eq => eq(la, ra),
        ComparisonOp::NotEq => neq(la, ra),
        ComparisonOp::Lt => lt(la, ra),
        ComparisonOp::LtEq => lt_eq(la, ra),
        ComparisonOp::Gt => gt(la, ra),
        ComparisonOp::GtEq => gt_eq(la, ra),
    }
    .map_err(|e| QuarryError::Execution(format!("cmp kernel failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_schema::Field;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("x", DataType::Int64, false),
        ])
    }

    fn batch() -> RecordBatch {
        RecordBatch::try_new(
            Arc::new(schema()),
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3])),
                Arc::new(Int64Array::from(vec![5, 15, 25])),
            ],
        )
        .unwrap()
    }

    fn gt_ten() -> PredicateSpec {
        PredicateSpec::Comparison {
            op: ComparisonOp::Gt,
            left: ScalarSpec::Attribute { attr_id: 1 },
            right: ScalarSpec::Literal(LiteralValue::Int64(10)),
        }
    }

    #[test]
    fn validates_then_compiles_predicate() {
        let spec = gt_ten();
        validate_predicate(&spec, &schema()).unwrap();
        let compiled = compile_predicate(&spec, &schema()).unwrap();
        let mask = compiled.evaluate(&batch()).unwrap();
        assert_eq!(
            (0..3).map(|i| mask.value(i)).collect::<Vec<_>>(),
            vec![false, true, true]
        );
    }

    #[test]
    fn rejects_unknown_attribute() {
        let spec = PredicateSpec::Comparison {
            op: ComparisonOp::Eq,
            left: ScalarSpec::Attribute { attr_id: 7 },
            right: ScalarSpec::Literal(LiteralValue::Int64(0)),
        };
        assert!(validate_predicate(&spec, &schema()).is_err());
    }

    #[test]
    fn rejects_mismatched_comparison_types() {
        let spec = PredicateSpec::Comparison {
            op: ComparisonOp::Eq,
            left: ScalarSpec::Attribute { attr_id: 0 },
            right: ScalarSpec::Literal(LiteralValue::Utf8("a".to_string())),
        };
        assert!(validate_predicate(&spec, &schema()).is_err());
    }

    #[test]
    fn arithmetic_scalar_evaluates() {
        let spec = ScalarSpec::BinaryOp {
            op: BinaryOp::Plus,
            left: Box::new(ScalarSpec::Attribute { attr_id: 1 }),
            right: Box::new(ScalarSpec::Literal(LiteralValue::Int64(100))),
        };
        assert_eq!(validate_scalar(&spec, &schema()).unwrap(), DataType::Int64);
        let compiled = compile_scalar(&spec, &schema()).unwrap();
        let out = compiled.evaluate(&batch()).unwrap();
        let out = out.as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(out.values().as_ref(), &[105, 115, 125]);
    }

    #[test]
    fn conjunction_and_negation_compose() {
        let spec = PredicateSpec::And(vec![
            gt_ten(),
            PredicateSpec::Not(Box::new(PredicateSpec::Comparison {
                op: ComparisonOp::Eq,
                left: ScalarSpec::Attribute { attr_id: 0 },
                right: ScalarSpec::Literal(LiteralValue::Int64(3)),
            })),
        ]);
        validate_predicate(&spec, &schema()).unwrap();
        let compiled = compile_predicate(&spec, &schema()).unwrap();
        let mask = compiled.evaluate(&batch()).unwrap();
        assert_eq!(
            (0..3).map(|i| mask.value(i)).collect::<Vec<_>>(),
            vec![false, true, false]
        );
    }

    #[test]
    fn spec_trees_round_trip_through_serde() {
        let spec = PredicateSpec::Or(vec![gt_ten(), PredicateSpec::False]);
        let bytes = serde_json::to_vec(&spec).unwrap();
        let back: PredicateSpec = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, spec);
    }
}
