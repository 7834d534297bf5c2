//! Per-query orchestration: work-order generation, dependency bookkeeping,
//! rebuild initiation, and terminal-state handling.
//!
//! Contract:
//! - single-threaded: exactly one foreman thread drives a manager;
//! - a `(op, partition)` closes its normal phase when its blocking
//!   dependencies are met, the container holds no order for it, nothing is
//!   in flight, and generation reported done;
//! - operators declaring a rebuild phase initiate it only after the whole
//!   normal phase drains; output partitions then close as their rebuild
//!   orders drain;
//! - blocking edges are satisfied partition-wise when the producer's output
//!   partitioning matches the consumer's work partitioning, and only on full
//!   producer completion otherwise;
//! - failures and cancellation stop emission immediately and drain in-flight
//!   completions before the terminal status is reported.

use std::sync::Arc;
use std::time::Instant;

use quarry_common::{
    global_metrics, ExecutionConfig, OpIndex, PartitionId, QuarryError, QueryId, Result,
};
use quarry_plan::{validate_plan, EdgeKind, QueryPlan};
use quarry_storage::{BlockAnnouncer, BlockManager, Catalog, FlushedBlock};

use crate::bus::{ClientId, DataPipelineMessage, QueryResultStatus};
use crate::container::WorkOrdersContainer;
use crate::context::QueryContext;
use crate::operators::{OperatorEnv, OperatorNode, RelationalOperator};
use crate::state::QueryExecutionState;
use crate::work_order::{BoxedWorkOrder, WorkOrderPhase};

/// Progress counters for one operator, exposed in status snapshots.
#[derive(Debug, Clone)]
pub struct OperatorProgress {
    /// Operator name.
    pub name: &'static str,
    /// Work orders dispatched so far (both phases).
    pub dispatched: usize,
    /// Normal work orders dispatched so far.
    pub dispatched_normal: usize,
    /// Rebuild work orders dispatched so far.
    pub dispatched_rebuild: usize,
    /// Work orders completed so far (both phases).
    pub completed: usize,
    /// Whether the operator is fully done.
    pub finished: bool,
}

/// Point-in-time view of one query's execution.
#[derive(Debug, Clone)]
pub struct QueryStatusSnapshot {
    /// Query id.
    pub query_id: QueryId,
    /// Terminal status if the query left the running state.
    pub terminal: Option<QueryResultStatus>,
    /// Per-operator progress counters.
    pub operators: Vec<OperatorProgress>,
}

enum ManagerPhase {
    Running,
    Draining(QueryResultStatus),
}

/// Orchestrator for one admitted query.
pub struct QueryManager {
    plan: Arc<QueryPlan>,
    catalog: Arc<Catalog>,
    env: OperatorEnv,
    context: QueryContext,
    operators: Vec<OperatorNode>,
    container: WorkOrdersContainer,
    exec_state: QueryExecutionState,
    phase: ManagerPhase,
    reply_to: ClientId,
    started_at: Instant,
}

impl QueryManager {
    /// Validates the plan and builds all execution state, then performs the
    /// initialization walk: every operator without blocking dependencies is
    /// asked for work orders for each of its partitions.
    pub fn new(
        plan: QueryPlan,
        catalog: Arc<Catalog>,
        storage: Arc<BlockManager>,
        config: &ExecutionConfig,
        announcer: Option<BlockAnnouncer>,
        reply_to: ClientId,
    ) -> Result<Self> {
        validate_plan(&plan, &catalog)?;
        let context = QueryContext::from_plan(
            &plan,
            &catalog,
            &storage,
            config.batch_size_rows,
            announcer,
        )?;
        let operators = (0..plan.operators.len())
            .map(|op| OperatorNode::from_spec(&plan, op, &catalog))
            .collect::<Result<Vec<_>>>()?;
        let normal_partitions = operators
            .iter()
            .map(|op| op.num_partitions())
            .collect::<Vec<_>>();
        let output_partitions = operators
            .iter()
            .map(|op| op.num_output_partitions())
            .collect::<Vec<_>>();
        let container = WorkOrdersContainer::new(&normal_partitions, &output_partitions);
        let exec_state = QueryExecutionState::new(&normal_partitions, &output_partitions);

        let mut manager = Self {
            env: OperatorEnv {
                query_id: plan.query_id,
                storage,
                catalog: Arc::clone(&catalog),
            },
            plan: Arc::new(plan),
            catalog,
            context,
            operators,
            container,
            exec_state,
            phase: ManagerPhase::Running,
            reply_to,
            started_at: Instant::now(),
        };

        for op in 0..manager.operators.len() {
            if manager.operators[op].blocking_dependencies().is_empty() {
                for part in 0..manager.operators[op].num_partitions() {
                    manager.fetch_normal_work_orders(op, part)?;
                }
            }
        }
        Ok(manager)
    }

    /// Query this manager drives.
    pub fn query_id(&self) -> QueryId {
        self.plan.query_id
    }

    /// Client to notify with the terminal status.
    pub fn reply_to(&self) -> ClientId {
        self.reply_to
    }

    /// Wall-clock start of execution.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Asks one operator partition for newly generatable normal work orders
    /// and records generation completion.
    pub fn fetch_normal_work_orders(&mut self, op: OpIndex, part: PartitionId) -> Result<()> {
        if matches!(self.phase, ManagerPhase::Draining(_)) {
            return Ok(());
        }
        if self.exec_state.is_normal_phase_over(op, part) {
            return Ok(());
        }
        let generation_done = {
            let (operators, container, context, env) = (
                &mut self.operators,
                &mut self.container,
                &self.context,
                &self.env,
            );
            operators[op].get_all_work_orders(part, container, context, env)?
        };
        if generation_done {
            self.exec_state.set_done_generation(op, part);
        }
        global_metrics().set_queued(
            self.plan.query_id.0,
            op,
            self.container.num_normal_work_orders(op),
        );
        self.try_close_normal(op, part)
    }

    /// Handles a work-order completion message.
    pub fn process_work_order_completion(
        &mut self,
        phase: WorkOrderPhase,
        op: OpIndex,
        part: PartitionId,
        error: Option<String>,
    ) -> Result<()> {
        if op >= self.operators.len() {
            return Err(QuarryError::Protocol(format!(
                "completion for unknown operator {op}"
            )));
        }
        match phase {
            WorkOrderPhase::Normal => self.exec_state.dec_queued_normal(op, part)?,
            WorkOrderPhase::Rebuild => self.exec_state.dec_queued_rebuild(op, part)?,
        }
        match error {
            Some(message) => {
                global_metrics().inc_failed(self.plan.query_id.0, op, phase.label());
                tracing::error!(
                    query_id = %self.plan.query_id,
                    op_index = op,
                    partition_id = part,
                    error = %message,
                    operator = "QueryManagerCompletion",
                    "work order failed; draining query"
                );
                self.enter_draining(QueryResultStatus::Failed(message));
                Ok(())
            }
            None => {
                global_metrics().inc_completed(self.plan.query_id.0, op, phase.label());
                if matches!(self.phase, ManagerPhase::Draining(_)) {
                    return Ok(());
                }
                match phase {
                    WorkOrderPhase::Normal => self.fetch_normal_work_orders(op, part),
                    WorkOrderPhase::Rebuild => self.try_close_rebuild(op, part),
                }
            }
        }
    }

    /// Routes a data-pipelining message to the producer's consumers.
    pub fn process_data_pipeline_message(&mut self, message: &DataPipelineMessage) -> Result<()> {
        if matches!(self.phase, ManagerPhase::Draining(_)) {
            return Ok(());
        }
        global_metrics().inc_pipeline_message(self.plan.query_id.0, message.producer_op);
        let consumers = self
            .plan
            .successors(message.producer_op, EdgeKind::Pipelining);
        for consumer in consumers {
            if message.partition_id >= self.operators[consumer].num_partitions() {
                continue;
            }
            self.operators[consumer].feed_input_block(
                message.block_id,
                message.relation_id,
                message.partition_id,
            );
            if self.blocking_deps_met(consumer, message.partition_id) {
                self.fetch_normal_work_orders(consumer, message.partition_id)?;
            }
        }
        Ok(())
    }

    /// Round-robin scan for the next dispatchable work order, preferring
    /// NUMA-local orders and honoring the per-operator in-flight cap.
    pub fn get_next_work_order(
        &mut self,
        start_op_index: OpIndex,
        numa_hint: Option<usize>,
        max_inflight_per_operator: usize,
    ) -> Option<(BoxedWorkOrder, WorkOrderPhase)> {
        if matches!(self.phase, ManagerPhase::Draining(_)) {
            return None;
        }
        let num_ops = self.operators.len();
        for offset in 0..num_ops {
            let op = (start_op_index + offset) % num_ops;
            if self.inflight_for_op(op) >= max_inflight_per_operator {
                continue;
            }
            if let Some(order) = self.container.get_any_rebuild_work_order(op, numa_hint) {
                self.exec_state.inc_queued_rebuild(op, order.partition_id());
                global_metrics().inc_dispatched(self.plan.query_id.0, op, "rebuild");
                return Some((order, WorkOrderPhase::Rebuild));
            }
            if let Some(order) = self.container.get_any_normal_work_order(op, numa_hint) {
                self.exec_state.inc_queued_normal(op, order.partition_id());
                global_metrics().inc_dispatched(self.plan.query_id.0, op, "normal");
                return Some((order, WorkOrderPhase::Normal));
            }
        }
        None
    }

    /// Moves the query to the failed state (protocol-error path).
    pub fn fail(&mut self, message: String) {
        self.enter_draining(QueryResultStatus::Failed(message));
    }

    /// Stops emission and switches to cancellation draining.
    pub fn cancel(&mut self) {
        tracing::info!(
            query_id = %self.plan.query_id,
            operator = "QueryManagerCancel",
            "cancellation requested"
        );
        self.enter_draining(QueryResultStatus::Cancelled);
    }

    /// Terminal status once every in-flight completion has drained.
    pub fn is_done(&self) -> Option<QueryResultStatus> {
        match &self.phase {
            ManagerPhase::Draining(status) if self.exec_state.total_inflight() == 0 => {
                Some(status.clone())
            }
            _ => None,
        }
    }

    /// Whether the container still holds undispatched work orders.
    pub fn has_pending_work_orders(&self) -> bool {
        !self.container.is_empty()
    }

    /// Point-in-time progress snapshot.
    pub fn status_snapshot(&self) -> QueryStatusSnapshot {
        QueryStatusSnapshot {
            query_id: self.plan.query_id,
            terminal: match &self.phase {
                ManagerPhase::Running => None,
                ManagerPhase::Draining(status) => Some(status.clone()),
            },
            operators: (0..self.operators.len())
                .map(|op| OperatorProgress {
                    name: self.operators[op].name(),
                    dispatched: self.exec_state.num_dispatched(op),
                    dispatched_normal: self.exec_state.num_dispatched_normal(op),
                    dispatched_rebuild: self.exec_state.num_dispatched_rebuild(op),
                    completed: self.exec_state.num_completed(op),
                    finished: self.exec_state.has_execution_finished(op),
                })
                .collect(),
        }
    }

    /// Releases query-scoped storage: blocks of temporary relations are
    /// destroyed and the relations dropped from the catalog.
    pub fn teardown(&mut self) -> Result<()> {
        let mut dropped = Vec::new();
        for dest in &self.plan.context.insert_destinations {
            let Ok(relation) = self.catalog.get_relation(dest.relation_id) else {
                continue;
            };
            if relation.temporary && !dropped.contains(&relation.id) {
                self.env.storage.drop_relation_blocks(relation.id)?;
                self.catalog.drop_relation(relation.id)?;
                dropped.push(relation.id);
            }
        }
        Ok(())
    }

    fn inflight_for_op(&self, op: OpIndex) -> usize {
        let normal = self.exec_state.total_queued_normal(op);
        let rebuild: usize = (0..self.operators[op].num_output_partitions())
            .map(|part| self.exec_state.num_queued_rebuild(op, part))
            .sum();
        normal + rebuild
    }

    fn blocking_deps_met(&self, op: OpIndex, part: PartitionId) -> bool {
        self.operators[op].blocking_dependencies().iter().all(|dep| {
            if self.operators[*dep].num_output_partitions() == self.operators[op].num_partitions()
            {
                self.exec_state.is_partition_done(*dep, part)
            } else {
                self.exec_state.has_execution_finished(*dep)
            }
        })
    }

    fn normal_execution_over(&self, op: OpIndex, part: PartitionId) -> bool {
        self.blocking_deps_met(op, part)
            && !self.container.has_normal_work_order(op, part)
            && self.exec_state.num_queued_normal(op, part) == 0
            && self.exec_state.has_done_generation(op, part)
    }

    fn rebuild_over(&self, op: OpIndex, part: PartitionId) -> bool {
        self.exec_state.has_rebuild_initiated(op, part)
            && !self.container.has_rebuild_work_order(op, part)
            && self.exec_state.num_queued_rebuild(op, part) == 0
    }

    fn try_close_normal(&mut self, op: OpIndex, part: PartitionId) -> Result<()> {
        if self.exec_state.is_normal_phase_over(op, part) || !self.normal_execution_over(op, part)
        {
            return Ok(());
        }
        self.exec_state.set_normal_phase_over(op, part);

        // Flush the destination's partial tail for this partition and route
        // the blocks synchronously: consumers must see every block before
        // any done-feeding notification below.
        let destination = self.context.destination_for_op(op).cloned();
        if let Some(destination) = destination {
            if destination.relation().num_partitions == self.operators[op].num_partitions() {
                let flushed = destination.finalize_partition(part)?;
                self.route_flushed_blocks(&flushed)?;
            }
        }

        let aligned = self.operators[op].num_output_partitions()
            == self.operators[op].num_partitions();
        if !self.operators[op].needs_rebuild() && aligned {
            self.mark_partition_finished(op, part)?;
        }

        if self.exec_state.is_normal_phase_over_all(op) {
            if self.operators[op].needs_rebuild() {
                self.initiate_rebuild(op)?;
            } else if !aligned {
                for out_part in 0..self.operators[op].num_output_partitions() {
                    if !self.exec_state.is_partition_done(op, out_part) {
                        self.mark_partition_finished(op, out_part)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn initiate_rebuild(&mut self, op: OpIndex) -> Result<()> {
        for out_part in 0..self.operators[op].num_output_partitions() {
            if self.exec_state.has_rebuild_initiated(op, out_part) {
                continue;
            }
            self.exec_state.set_rebuild_initiated(op, out_part);
            global_metrics().inc_rebuild_initiated(self.plan.query_id.0, op);
            {
                let (operators, container, context, env) = (
                    &mut self.operators,
                    &mut self.container,
                    &self.context,
                    &self.env,
                );
                operators[op].get_all_rebuild_work_orders(out_part, container, context, env)?;
            }
            tracing::debug!(
                query_id = %self.plan.query_id,
                op_index = op,
                partition_id = out_part,
                operator = "QueryManagerRebuild",
                "rebuild initiated"
            );
        }
        // An operator may have nothing to rebuild for a partition.
        for out_part in 0..self.operators[op].num_output_partitions() {
            self.try_close_rebuild(op, out_part)?;
        }
        Ok(())
    }

    fn try_close_rebuild(&mut self, op: OpIndex, part: PartitionId) -> Result<()> {
        if !self.exec_state.is_partition_done(op, part) && self.rebuild_over(op, part) {
            self.mark_partition_finished(op, part)?;
        }
        Ok(())
    }

    fn mark_partition_finished(&mut self, op: OpIndex, out_part: PartitionId) -> Result<()> {
        self.exec_state.set_partition_done(op, out_part);

        // Partition-aligned propagation.
        for consumer in self.plan.successors(op, EdgeKind::Pipelining) {
            if self.operators[op].num_output_partitions()
                == self.operators[consumer].num_partitions()
            {
                self.operators[consumer].done_feeding_input(out_part);
                if self.blocking_deps_met(consumer, out_part) {
                    self.fetch_normal_work_orders(consumer, out_part)?;
                }
            }
        }
        for consumer in self.plan.successors(op, EdgeKind::Blocking) {
            if self.operators[op].num_output_partitions()
                == self.operators[consumer].num_partitions()
                && self.blocking_deps_met(consumer, out_part)
            {
                self.fetch_normal_work_orders(consumer, out_part)?;
            }
        }

        if self.exec_state.all_partitions_done(op) {
            self.operator_finished(op)?;
        }
        Ok(())
    }

    fn operator_finished(&mut self, op: OpIndex) -> Result<()> {
        if self.exec_state.has_execution_finished(op) {
            return Ok(());
        }
        self.exec_state.set_execution_finished(op);
        let destination = self.context.destination_for_op(op).cloned();
        if let Some(destination) = destination {
            let flushed = destination.finalize()?;
            self.route_flushed_blocks(&flushed)?;
        }
        tracing::info!(
            query_id = %self.plan.query_id,
            op_index = op,
            name = self.operators[op].name(),
            operator = "QueryManagerFinished",
            "operator finished"
        );

        // Whole-operator propagation covers consumers whose partitioning
        // does not line up with this producer.
        for consumer in self.plan.successors(op, EdgeKind::Pipelining) {
            if self.operators[op].num_output_partitions()
                != self.operators[consumer].num_partitions()
            {
                for part in 0..self.operators[consumer].num_partitions() {
                    self.operators[consumer].done_feeding_input(part);
                    if self.blocking_deps_met(consumer, part) {
                        self.fetch_normal_work_orders(consumer, part)?;
                    }
                }
            }
        }
        for consumer in self.plan.successors(op, EdgeKind::Blocking) {
            for part in 0..self.operators[consumer].num_partitions() {
                if self.blocking_deps_met(consumer, part) {
                    self.fetch_normal_work_orders(consumer, part)?;
                }
            }
        }

        if op == self.plan.root_op {
            self.enter_draining(QueryResultStatus::Succeeded);
        }
        Ok(())
    }

    fn route_flushed_blocks(&mut self, flushed: &[FlushedBlock]) -> Result<()> {
        for block in flushed {
            let message = DataPipelineMessage {
                query_id: block.query_id,
                producer_op: block.producer_op,
                block_id: block.block_id,
                relation_id: block.relation_id,
                partition_id: block.partition_id,
            };
            self.process_data_pipeline_message(&message)?;
        }
        Ok(())
    }

    fn enter_draining(&mut self, status: QueryResultStatus) {
        if let ManagerPhase::Running = self.phase {
            self.container.clear();
            self.phase = ManagerPhase::Draining(status);
        }
    }
}
