//! Per-operator, per-partition execution bookkeeping.
//!
//! The ledger the query manager consults for its completion predicates:
//! normal-phase counters are tracked per *work* partition, rebuild and done
//! flags per *output* partition. Double completions are protocol errors.

use quarry_common::{OpIndex, PartitionId, QuarryError, Result};

#[derive(Debug)]
struct OperatorState {
    // Normal phase, per work partition.
    queued_normal: Vec<usize>,
    done_generation_normal: Vec<bool>,
    normal_phase_over: Vec<bool>,
    // Rebuild phase and completion, per output partition.
    rebuild_initiated: Vec<bool>,
    queued_rebuild: Vec<usize>,
    done: Vec<bool>,
    execution_finished: bool,
    // Cumulative counters for status snapshots and invariants.
    dispatched_normal: usize,
    dispatched_rebuild: usize,
    completed: usize,
}

/// Execution-state ledger for one query.
#[derive(Debug)]
pub struct QueryExecutionState {
    per_op: Vec<OperatorState>,
}

impl QueryExecutionState {
    /// Constructs the ledger: `normal_partitions[op]` work partitions and
    /// `output_partitions[op]` output partitions per operator.
    pub fn new(normal_partitions: &[usize], output_partitions: &[usize]) -> Self {
        let per_op = normal_partitions
            .iter()
            .zip(output_partitions)
            .map(|(normal, output)| OperatorState {
                queued_normal: vec![0; *normal],
                done_generation_normal: vec![false; *normal],
                normal_phase_over: vec![false; *normal],
                rebuild_initiated: vec![false; *output],
                queued_rebuild: vec![0; *output],
                done: vec![false; *output],
                execution_finished: false,
                dispatched_normal: 0,
                dispatched_rebuild: 0,
                completed: 0,
            })
            .collect();
        Self { per_op }
    }

    /// Number of operators tracked.
    pub fn num_operators(&self) -> usize {
        self.per_op.len()
    }

    /// Records a normal work-order dispatch.
    pub fn inc_queued_normal(&mut self, op: OpIndex, part: PartitionId) {
        let state = &mut self.per_op[op];
        state.queued_normal[part] += 1;
        state.dispatched_normal += 1;
    }

    /// Records a normal work-order completion.
    pub fn dec_queued_normal(&mut self, op: OpIndex, part: PartitionId) -> Result<()> {
        let state = &mut self.per_op[op];
        if state.queued_normal[part] == 0 {
            return Err(QuarryError::Protocol(format!(
                "duplicate normal completion for operator {op} partition {part}"
            )));
        }
        state.queued_normal[part] -= 1;
        state.completed += 1;
        Ok(())
    }

    /// Normal work orders in flight for `(op, part)`.
    pub fn num_queued_normal(&self, op: OpIndex, part: PartitionId) -> usize {
        self.per_op[op].queued_normal[part]
    }

    /// Normal work orders in flight across all partitions of `op`.
    pub fn total_queued_normal(&self, op: OpIndex) -> usize {
        self.per_op[op].queued_normal.iter().sum()
    }

    /// Marks that `op` will generate no more normal orders for `part`.
    pub fn set_done_generation(&mut self, op: OpIndex, part: PartitionId) {
        self.per_op[op].done_generation_normal[part] = true;
    }

    /// Whether normal generation finished for `(op, part)`.
    pub fn has_done_generation(&self, op: OpIndex, part: PartitionId) -> bool {
        self.per_op[op].done_generation_normal[part]
    }

    /// Marks the normal phase of `(op, part)` complete.
    pub fn set_normal_phase_over(&mut self, op: OpIndex, part: PartitionId) {
        self.per_op[op].normal_phase_over[part] = true;
    }

    /// Whether the normal phase of `(op, part)` completed.
    pub fn is_normal_phase_over(&self, op: OpIndex, part: PartitionId) -> bool {
        self.per_op[op].normal_phase_over[part]
    }

    /// Whether the normal phase completed for every work partition of `op`.
    pub fn is_normal_phase_over_all(&self, op: OpIndex) -> bool {
        self.per_op[op].normal_phase_over.iter().all(|done| *done)
    }

    /// Marks the rebuild phase of `(op, output part)` initiated.
    pub fn set_rebuild_initiated(&mut self, op: OpIndex, part: PartitionId) {
        self.per_op[op].rebuild_initiated[part] = true;
    }

    /// Whether the rebuild phase of `(op, output part)` has begun.
    pub fn has_rebuild_initiated(&self, op: OpIndex, part: PartitionId) -> bool {
        self.per_op[op].rebuild_initiated[part]
    }

    /// Records a rebuild work-order dispatch.
    pub fn inc_queued_rebuild(&mut self, op: OpIndex, part: PartitionId) {
        let state = &mut self.per_op[op];
        state.queued_rebuild[part] += 1;
        state.dispatched_rebuild += 1;
    }

    /// Records a rebuild work-order completion.
    pub fn dec_queued_rebuild(&mut self, op: OpIndex, part: PartitionId) -> Result<()> {
        let state = &mut self.per_op[op];
        if state.queued_rebuild[part] == 0 {
            return Err(QuarryError::Protocol(format!(
                "duplicate rebuild completion for operator {op} partition {part}"
            )));
        }
        state.queued_rebuild[part] -= 1;
        state.completed += 1;
        Ok(())
    }

    /// Rebuild work orders in flight for `(op, output part)`.
    pub fn num_queued_rebuild(&self, op: OpIndex, part: PartitionId) -> usize {
        self.per_op[op].queued_rebuild[part]
    }

    /// Marks `(op, output part)` fully complete.
    pub fn set_partition_done(&mut self, op: OpIndex, part: PartitionId) {
        self.per_op[op].done[part] = true;
    }

    /// Whether `(op, output part)` is fully complete.
    pub fn is_partition_done(&self, op: OpIndex, part: PartitionId) -> bool {
        self.per_op[op].done[part]
    }

    /// Whether every output partition of `op` is complete.
    pub fn all_partitions_done(&self, op: OpIndex) -> bool {
        self.per_op[op].done.iter().all(|done| *done)
    }

    /// Marks the whole operator finished.
    pub fn set_execution_finished(&mut self, op: OpIndex) {
        self.per_op[op].execution_finished = true;
    }

    /// Whether the whole operator finished.
    pub fn has_execution_finished(&self, op: OpIndex) -> bool {
        self.per_op[op].execution_finished
    }

    /// Cumulative dispatched work orders of `op` (both phases).
    pub fn num_dispatched(&self, op: OpIndex) -> usize {
        self.per_op[op].dispatched_normal + self.per_op[op].dispatched_rebuild
    }

    /// Cumulative dispatched normal work orders of `op`.
    pub fn num_dispatched_normal(&self, op: OpIndex) -> usize {
        self.per_op[op].dispatched_normal
    }

    /// Cumulative dispatched rebuild work orders of `op`.
    pub fn num_dispatched_rebuild(&self, op: OpIndex) -> usize {
        self.per_op[op].dispatched_rebuild
    }

    /// Cumulative completed work orders of `op` (both phases).
    pub fn num_completed(&self, op: OpIndex) -> usize {
        self.per_op[op].completed
    }

    /// Work orders dispatched but not yet completed, across all operators.
    pub fn total_inflight(&self) -> usize {
        self.per_op
            .iter()
            .map(|s| s.dispatched_normal + s.dispatched_rebuild - s.completed)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_dispatch_and_completion() {
        let mut state = QueryExecutionState::new(&[2], &[2]);
        state.inc_queued_normal(0, 1);
        assert_eq!(state.num_queued_normal(0, 1), 1);
        assert_eq!(state.total_inflight(), 1);
        state.dec_queued_normal(0, 1).unwrap();
        assert_eq!(state.num_queued_normal(0, 1), 0);
        assert_eq!(state.num_dispatched(0), 1);
        assert_eq!(state.num_completed(0), 1);
    }

    #[test]
    fn double_completion_is_a_protocol_error() {
        let mut state = QueryExecutionState::new(&[1], &[1]);
        state.inc_queued_normal(0, 0);
        state.dec_queued_normal(0, 0).unwrap();
        let err = state.dec_queued_normal(0, 0).unwrap_err();
        assert!(matches!(err, QuarryError::Protocol(_)));
    }

    #[test]
    fn rebuild_tracking_is_per_output_partition() {
        let mut state = QueryExecutionState::new(&[4], &[2]);
        state.set_rebuild_initiated(0, 0);
        state.inc_queued_rebuild(0, 0);
        assert!(state.has_rebuild_initiated(0, 0));
        assert!(!state.has_rebuild_initiated(0, 1));
        state.dec_queued_rebuild(0, 0).unwrap();
        assert_eq!(state.num_queued_rebuild(0, 0), 0);
    }

    #[test]
    fn operator_done_requires_every_partition() {
        let mut state = QueryExecutionState::new(&[1], &[2]);
        state.set_partition_done(0, 0);
        assert!(!state.all_partitions_done(0));
        state.set_partition_done(0, 1);
        assert!(state.all_partitions_done(0));
    }
}
