//! Shared group-by aggregation state.
//!
//! Lifecycle per state partition: `initialize` (one work order each) ->
//! concurrent `accumulate` during the normal phase -> `seal` (rebuild phase,
//! partitioned states only) -> `finalize` (single reader per partition).
//!
//! Concurrency: rows hash to a state partition, then to a lock shard within
//! it; updates of the same group serialize on the shard lock while distinct
//! shards proceed in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, Float64Builder, Int64Array, Int64Builder};
use arrow::record_batch::RecordBatch;
use arrow_schema::DataType;
use parking_lot::Mutex;
use quarry_common::{PartitionId, QuarryError, Result};
use quarry_plan::{AggregateFunction, CompiledScalar};
use quarry_storage::InsertDestination;

use crate::keys::{key_at, key_hash, keys_to_array, GroupKey};

const LOCK_SHARDS_PER_PARTITION: usize = 16;

/// Numeric argument value of one input row.
#[derive(Debug, Clone, Copy)]
enum AggValue {
    Int(i64),
    Float(f64),
}

fn value_at(array: &ArrayRef, row: usize) -> Result<AggValue> {
    if array.is_null(row) {
        return Err(QuarryError::Execution(
            "null aggregate arguments are not supported".to_string(),
        ));
    }
    match array.data_type() {
        DataType::Int64 => {
            let typed = array
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| QuarryError::Execution("expected Int64 argument".to_string()))?;
            Ok(AggValue::Int(typed.value(row)))
        }
        DataType::Float64 => {
            let typed = array
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| QuarryError::Execution("expected Float64 argument".to_string()))?;
            Ok(AggValue::Float(typed.value(row)))
        }
        other => Err(QuarryError::Execution(format!(
            "unsupported aggregate argument type {other:?}"
        ))),
    }
}

#[derive(Debug, Clone, Copy)]
enum Accumulator {
    SumInt(i64),
    SumFloat(f64),
    Count(i64),
    MinInt(i64),
    MinFloat(f64),
    MaxInt(i64),
    MaxFloat(f64),
    Avg { sum: f64, count: i64 },
}

impl Accumulator {
    fn new(function: AggregateFunction, arg_type: Option<&DataType>) -> Result<Self> {
        match (function, arg_type) {
            (AggregateFunction::Count, _) => Ok(Accumulator::Count(0)),
            (AggregateFunction::Avg, _) => Ok(Accumulator::Avg { sum: 0.0, count: 0 }),
            (AggregateFunction::Sum, Some(DataType::Int64)) => Ok(Accumulator::SumInt(0)),
            (AggregateFunction::Sum, Some(DataType::Float64)) => Ok(Accumulator::SumFloat(0.0)),
            (AggregateFunction::Min, Some(DataType::Int64)) => Ok(Accumulator::MinInt(i64::MAX)),
            (AggregateFunction::Min, Some(DataType::Float64)) => {
                Ok(Accumulator::MinFloat(f64::INFINITY))
            }
            (AggregateFunction::Max, Some(DataType::Int64)) => Ok(Accumulator::MaxInt(i64::MIN)),
            (AggregateFunction::Max, Some(DataType::Float64)) => {
                Ok(Accumulator::MaxFloat(f64::NEG_INFINITY))
            }
            (function, arg_type) => Err(QuarryError::Execution(format!(
                "aggregate {function:?} unsupported over argument type {arg_type:?}"
            ))),
        }
    }

    fn update(&mut self, value: Option<AggValue>) -> Result<()> {
        match (self, value) {
            (Accumulator::Count(c), _) => *c += 1,
            (Accumulator::SumInt(acc), Some(AggValue::Int(v))) => *acc += v,
            (Accumulator::SumFloat(acc), Some(AggValue::Float(v))) => *acc += v,
            (Accumulator::MinInt(acc), Some(AggValue::Int(v))) => *acc = (*acc).min(v),
            (Accumulator::MinFloat(acc), Some(AggValue::Float(v))) => *acc = (*acc).min(v),
            (Accumulator::MaxInt(acc), Some(AggValue::Int(v))) => *acc = (*acc).max(v),
            (Accumulator::MaxFloat(acc), Some(AggValue::Float(v))) => *acc = (*acc).max(v),
            (Accumulator::Avg { sum, count }, Some(value)) => {
                *sum += match value {
                    AggValue::Int(v) => v as f64,
                    AggValue::Float(v) => v,
                };
                *count += 1;
            }
            _ => {
                return Err(QuarryError::Execution(
                    "aggregate argument/accumulator type mismatch".to_string(),
                ))
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct StatePartition {
    initialized: AtomicBool,
    sealed: AtomicBool,
    shards: Vec<Mutex<HashMap<GroupKey, Accumulator>>>,
}

/// Shared aggregation state for one context slot.
pub struct AggregationState {
    function: AggregateFunction,
    key_attr: usize,
    key_type: DataType,
    argument: Option<CompiledScalar>,
    arg_type: Option<DataType>,
    partitions: Vec<StatePartition>,
}

impl std::fmt::Debug for AggregationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationState")
            .field("function", &self.function)
            .field("key_attr", &self.key_attr)
            .field("num_partitions", &self.partitions.len())
            .finish()
    }
}

impl AggregationState {
    /// Constructs a state with `num_partitions` shards of the group space.
    pub fn new(
        function: AggregateFunction,
        key_attr: usize,
        key_type: DataType,
        argument: Option<CompiledScalar>,
        arg_type: Option<DataType>,
        num_partitions: usize,
    ) -> Self {
        let partitions = (0..num_partitions.max(1))
            .map(|_| StatePartition {
                initialized: AtomicBool::new(false),
                sealed: AtomicBool::new(false),
                shards: (0..LOCK_SHARDS_PER_PARTITION)
                    .map(|_| Mutex::new(HashMap::new()))
                    .collect(),
            })
            .collect();
        Self {
            function,
            key_attr,
            key_type,
            argument,
            arg_type,
            partitions,
        }
    }

    /// Whether the group hash space is sharded across multiple partitions.
    ///
    /// Partitioned states require the rebuild phase to seal each partition
    /// before finalization may read it.
    pub fn is_partitioned(&self) -> bool {
        self.partitions.len() > 1
    }

    /// State partitions requiring an initialization work order.
    pub fn num_initialization_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// State partitions requiring a finalization work order.
    ///
    /// Read from the live state at generation time; the serialized plan
    /// never carries this count.
    pub fn num_finalization_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Marks one state partition ready for accumulation.
    pub fn initialize(&self, partition: PartitionId) -> Result<()> {
        let state = self.partition(partition)?;
        state.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Accumulates every row of `batch` into the state.
    pub fn accumulate(&self, batch: &RecordBatch) -> Result<()> {
        let keys = batch.column(self.key_attr).clone();
        let args = match &self.argument {
            Some(argument) => Some(argument.evaluate(batch)?),
            None => None,
        };
        for row in 0..batch.num_rows() {
            let key = key_at(&keys, row)?;
            let hash = key_hash(&key);
            let partition = (hash as usize) % self.partitions.len();
            let state = &self.partitions[partition];
            if !state.initialized.load(Ordering::Acquire) {
                return Err(QuarryError::Execution(format!(
                    "aggregation state partition {partition} used before initialization"
                )));
            }
            if state.sealed.load(Ordering::Acquire) {
                return Err(QuarryError::Execution(format!(
                    "aggregation state partition {partition} mutated after seal"
                )));
            }
            let value = match &args {
                Some(args) => Some(value_at(args, row)?),
                None => None,
            };
            let shard = ((hash >> 32) as usize) % LOCK_SHARDS_PER_PARTITION;
            let mut groups = state.shards[shard].lock();
            let accumulator = match groups.entry(key) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    let fresh = Accumulator::new(self.function, self.arg_type.as_ref())?;
                    entry.insert(fresh)
                }
            };
            accumulator.update(value)?;
        }
        Ok(())
    }

    /// Seals one state partition (rebuild phase of a partitioned state).
    pub fn seal_partition(&self, partition: PartitionId) -> Result<()> {
        let state = self.partition(partition)?;
        state.sealed.store(true, Ordering::Release);
        Ok(())
    }

    /// Finalizes one state partition into `(key, value)` tuples.
    ///
    /// Requires initialization, and a seal when the state is partitioned;
    /// returns the number of emitted groups.
    pub fn finalize_partition(
        &self,
        partition: PartitionId,
        destination: &InsertDestination,
    ) -> Result<usize> {
        let state = self.partition(partition)?;
        if !state.initialized.load(Ordering::Acquire) {
            return Err(QuarryError::Execution(format!(
                "aggregation state partition {partition} finalized before initialization"
            )));
        }
        if self.is_partitioned() && !state.sealed.load(Ordering::Acquire) {
            return Err(QuarryError::Execution(format!(
                "aggregation state partition {partition} finalized before seal"
            )));
        }

        let mut keys = Vec::new();
        let mut values = Vec::new();
        for shard in &state.shards {
            let groups = shard.lock();
            for (key, accumulator) in groups.iter() {
                keys.push(key.clone());
                values.push(*accumulator);
            }
        }
        if keys.is_empty() {
            return Ok(0);
        }

        let key_array = keys_to_array(&keys, &self.key_type)?;
        let value_array = self.values_to_array(&values)?;
        let schema = destination.relation().schema_ref();
        let batch = RecordBatch::try_new(schema, vec![key_array, value_array])
            .map_err(|e| QuarryError::Execution(format!("finalize batch build failed: {e}")))?;
        let rows = batch.num_rows();
        destination.append(0, batch)?;
        Ok(rows)
    }

    fn partition(&self, partition: PartitionId) -> Result<&StatePartition> {
        self.partitions.get(partition).ok_or_else(|| {
            QuarryError::Execution(format!(
                "aggregation state partition {partition} out of range"
            ))
        })
    }

    fn values_to_array(&self, values: &[Accumulator]) -> Result<ArrayRef> {
        match self.function {
            AggregateFunction::Count => {
                let mut b = Int64Builder::with_capacity(values.len());
                for v in values {
                    match v {
                        Accumulator::Count(c) => b.append_value(*c),
                        _ => return Err(type_confusion()),
                    }
                }
                Ok(Arc::new(b.finish()))
            }
            AggregateFunction::Avg => {
                let mut b = Float64Builder::with_capacity(values.len());
                for v in values {
                    match v {
                        Accumulator::Avg { sum, count } => {
                            b.append_value(if *count == 0 { 0.0 } else { sum / *count as f64 })
                        }
                        _ => return Err(type_confusion()),
                    }
                }
                Ok(Arc::new(b.finish()))
            }
            AggregateFunction::Sum | AggregateFunction::Min | AggregateFunction::Max => {
                match self.arg_type {
                    Some(DataType::Int64) => {
                        let mut b = Int64Builder::with_capacity(values.len());
                        for v in values {
                            match v {
                                Accumulator::SumInt(x)
                                | Accumulator::MinInt(x)
                                | Accumulator::MaxInt(x) => b.append_value(*x),
                                _ => return Err(type_confusion()),
                            }
                        }
                        Ok(Arc::new(b.finish()))
                    }
                    Some(DataType::Float64) => {
                        let mut b = Float64Builder::with_capacity(values.len());
                        for v in values {
                            match v {
                                Accumulator::SumFloat(x)
                                | Accumulator::MinFloat(x)
                                | Accumulator::MaxFloat(x) => b.append_value(*x),
                                _ => return Err(type_confusion()),
                            }
                        }
                        Ok(Arc::new(b.finish()))
                    }
                    _ => Err(type_confusion()),
                }
            }
        }
    }
}

fn type_confusion() -> QuarryError {
    QuarryError::Execution("aggregation accumulator type confusion".to_string())
}
