//! The long-lived scheduling thread.
//!
//! Responsibilities:
//! - admit queries (one [`QueryManager`] per active query, isolated from
//!   its peers);
//! - pump the bus and route completions and pipelining messages to the
//!   right manager;
//! - after every event, drain ready work orders to free workers, choosing a
//!   worker from the free queue and passing its NUMA node as the dispatch
//!   hint;
//! - enforce the per-operator in-flight cap (backpressure);
//! - detect terminal states, tear the query down, and notify the submitting
//!   client.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;
use quarry_common::{global_metrics, ExecutionConfig, QueryId, Result, WorkerId};
use quarry_plan::QueryPlan;
use quarry_storage::{BlockManager, Catalog, FlushedBlock};
use tracing::{debug, error, info, warn};

use crate::bus::{
    ClientId, CompletionMessage, DataPipelineMessage, ExecutionMessage, MessageBus, QueryCompleteMessage,
    QueryHandle, QueryResultStatus, WorkOrderEnvelope,
};
use crate::query_manager::QueryManager;
use crate::work_order::WorkOrderPhase;
use crate::worker::{WorkerMember, WorkerPool};

/// Handle to a running foreman thread.
pub struct ForemanHandle {
    bus: Arc<MessageBus>,
    foreman_client: ClientId,
    join: Option<JoinHandle<()>>,
}

impl ForemanHandle {
    /// Bus client id of the foreman (workers and clients send here).
    pub fn client_id(&self) -> ClientId {
        self.foreman_client
    }

    /// Submits a plan for execution; the terminal status arrives at
    /// `reply_to` as a [`ExecutionMessage::QueryComplete`].
    pub fn submit_query(&self, plan: QueryPlan, reply_to: ClientId) -> Result<()> {
        self.bus.send(
            self.foreman_client,
            ExecutionMessage::AdmitQuery(Box::new(QueryHandle { plan, reply_to })),
        )
    }

    /// Requests cancellation of a running query.
    pub fn cancel_query(&self, query_id: QueryId) -> Result<()> {
        self.bus
            .send(self.foreman_client, ExecutionMessage::CancelQuery(query_id))
    }

    /// Shuts the foreman (and its worker pool) down and joins the thread.
    pub fn shutdown(mut self) {
        let _ = self.bus.send(self.foreman_client, ExecutionMessage::Poison);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// The scheduler thread state.
pub struct Foreman {
    bus: Arc<MessageBus>,
    client_id: ClientId,
    receiver: Receiver<ExecutionMessage>,
    catalog: Arc<Catalog>,
    storage: Arc<BlockManager>,
    config: ExecutionConfig,
    pool: WorkerPool,
    worker_members: Vec<WorkerMember>,
    free_workers: VecDeque<WorkerId>,
    queries: Vec<QueryManager>,
    next_op_scan: HashMap<QueryId, usize>,
    next_query_scan: usize,
}

impl Foreman {
    /// Spawns the worker pool and the foreman thread.
    pub fn start(
        bus: Arc<MessageBus>,
        catalog: Arc<Catalog>,
        storage: Arc<BlockManager>,
        config: ExecutionConfig,
    ) -> Result<ForemanHandle> {
        config.validate()?;
        let (client_id, receiver) = bus.register_client();
        let pool = WorkerPool::spawn(&bus, client_id, &config);
        let worker_members = pool.members().to_vec();
        let free_workers = worker_members.iter().map(|m| m.worker_id).collect();
        let foreman = Foreman {
            bus: Arc::clone(&bus),
            client_id,
            receiver,
            catalog,
            storage,
            config,
            pool,
            worker_members,
            free_workers,
            queries: Vec::new(),
            next_op_scan: HashMap::new(),
            next_query_scan: 0,
        };
        let join = std::thread::Builder::new()
            .name("quarry-foreman".to_string())
            .spawn(move || foreman.run())
            .expect("foreman thread spawn");
        Ok(ForemanHandle {
            bus,
            foreman_client: client_id,
            join: Some(join),
        })
    }

    fn run(mut self) {
        info!(
            workers = self.worker_members.len(),
            operator = "ForemanStart",
            "foreman started"
        );
        while let Ok(message) = self.receiver.recv() {
            if !self.handle_message(message) {
                break;
            }
        }
        self.pool.shutdown();
        info!(operator = "ForemanStop", "foreman stopped");
    }

    fn handle_message(&mut self, message: ExecutionMessage) -> bool {
        match message {
            ExecutionMessage::AdmitQuery(handle) => self.admit_query(*handle),
            ExecutionMessage::WorkOrderCompletion(completion) => {
                self.handle_completion(WorkOrderPhase::Normal, completion)
            }
            ExecutionMessage::RebuildWorkOrderCompletion(completion) => {
                self.handle_completion(WorkOrderPhase::Rebuild, completion)
            }
            ExecutionMessage::DataPipeline(pipeline) => self.handle_pipeline(pipeline),
            ExecutionMessage::CancelQuery(query_id) => self.handle_cancel(query_id),
            ExecutionMessage::Poison => return false,
            other => {
                warn!(
                    operator = "ForemanProtocol",
                    "unexpected message: {other:?}"
                );
            }
        }
        true
    }

    fn admit_query(&mut self, handle: QueryHandle) {
        let query_id = handle.plan.query_id;
        if self.queries.iter().any(|m| m.query_id() == query_id) {
            let _ = self.bus.send(
                handle.reply_to,
                ExecutionMessage::QueryComplete(QueryCompleteMessage {
                    query_id,
                    status: QueryResultStatus::Failed(format!(
                        "query {query_id} is already running"
                    )),
                }),
            );
            return;
        }

        let announcer = {
            let bus = Arc::clone(&self.bus);
            let foreman_client = self.client_id;
            Arc::new(move |flushed: FlushedBlock| {
                let _ = bus.send(
                    foreman_client,
                    ExecutionMessage::DataPipeline(DataPipelineMessage {
                        query_id: flushed.query_id,
                        producer_op: flushed.producer_op,
                        block_id: flushed.block_id,
                        relation_id: flushed.relation_id,
                        partition_id: flushed.partition_id,
                    }),
                );
            }) as quarry_storage::BlockAnnouncer
        };

        match QueryManager::new(
            handle.plan,
            Arc::clone(&self.catalog),
            Arc::clone(&self.storage),
            &self.config,
            Some(announcer),
            handle.reply_to,
        ) {
            Ok(manager) => {
                info!(
                    query_id = %query_id,
                    operator = "ForemanAdmit",
                    "query admitted"
                );
                self.queries.push(manager);
                self.check_done(query_id);
                self.dispatch_work_orders();
            }
            Err(e) => {
                info!(
                    query_id = %query_id,
                    error = %e,
                    operator = "ForemanAdmit",
                    "query rejected"
                );
                let _ = self.bus.send(
                    handle.reply_to,
                    ExecutionMessage::QueryComplete(QueryCompleteMessage {
                        query_id,
                        status: QueryResultStatus::Failed(e.to_string()),
                    }),
                );
            }
        }
    }

    fn handle_completion(&mut self, phase: WorkOrderPhase, completion: CompletionMessage) {
        self.free_workers.push_back(completion.worker_id);
        let query_id = completion.query_id;
        match self.manager_mut(query_id) {
            Some(manager) => {
                if let Err(e) = manager.process_work_order_completion(
                    phase,
                    completion.op_index,
                    completion.partition_id,
                    completion.error,
                ) {
                    error!(
                        query_id = %query_id,
                        error = %e,
                        operator = "ForemanCompletion",
                        "protocol error; aborting query"
                    );
                    manager.fail(e.to_string());
                }
            }
            None => {
                error!(
                    query_id = %query_id,
                    operator = "ForemanCompletion",
                    "completion for unknown query"
                );
            }
        }
        self.check_done(query_id);
        self.dispatch_work_orders();
    }

    fn handle_pipeline(&mut self, pipeline: DataPipelineMessage) {
        let query_id = pipeline.query_id;
        match self.manager_mut(query_id) {
            Some(manager) => {
                if let Err(e) = manager.process_data_pipeline_message(&pipeline) {
                    error!(
                        query_id = %query_id,
                        error = %e,
                        operator = "ForemanPipeline",
                        "protocol error; aborting query"
                    );
                    manager.fail(e.to_string());
                }
            }
            None => {
                // Tail flushes of a finished query may still be in the bus.
                debug!(
                    query_id = %query_id,
                    operator = "ForemanPipeline",
                    "pipeline message for inactive query"
                );
                return;
            }
        }
        self.check_done(query_id);
        self.dispatch_work_orders();
    }

    fn handle_cancel(&mut self, query_id: QueryId) {
        if let Some(manager) = self.manager_mut(query_id) {
            manager.cancel();
        } else {
            warn!(
                query_id = %query_id,
                operator = "ForemanCancel",
                "cancellation for unknown query"
            );
        }
        self.check_done(query_id);
    }

    fn manager_mut(&mut self, query_id: QueryId) -> Option<&mut QueryManager> {
        self.queries.iter_mut().find(|m| m.query_id() == query_id)
    }

    fn check_done(&mut self, query_id: QueryId) {
        let Some(position) = self.queries.iter().position(|m| m.query_id() == query_id) else {
            return;
        };
        let Some(status) = self.queries[position].is_done() else {
            return;
        };
        let mut manager = self.queries.remove(position);
        self.next_op_scan.remove(&query_id);
        if let Err(e) = manager.teardown() {
            error!(
                query_id = %query_id,
                error = %e,
                operator = "ForemanTeardown",
                "teardown failed"
            );
        }
        global_metrics()
            .observe_query_duration(status.label(), manager.started_at().elapsed().as_secs_f64());
        info!(
            query_id = %query_id,
            status = status.label(),
            operator = "ForemanComplete",
            "query complete"
        );
        let _ = self.bus.send(
            manager.reply_to(),
            ExecutionMessage::QueryComplete(QueryCompleteMessage { query_id, status }),
        );
    }

    fn dispatch_work_orders(&mut self) {
        while let Some(worker_id) = self.free_workers.front().copied() {
            if self.queries.is_empty() {
                return;
            }
            let member = self.worker_members[worker_id.0];
            let mut dispatched = false;
            let num_queries = self.queries.len();
            for offset in 0..num_queries {
                let index = (self.next_query_scan + offset) % num_queries;
                let query_id = self.queries[index].query_id();
                let start_op = self.next_op_scan.get(&query_id).copied().unwrap_or(0);
                let picked = self.queries[index].get_next_work_order(
                    start_op,
                    Some(member.numa_node),
                    self.config.max_inflight_work_orders_per_operator,
                );
                if let Some((order, phase)) = picked {
                    self.next_op_scan.insert(query_id, order.op_index() + 1);
                    self.next_query_scan = (index + 1) % num_queries;
                    debug!(
                        query_id = %query_id,
                        worker_id = %worker_id,
                        op_index = order.op_index(),
                        partition_id = order.partition_id(),
                        phase = phase.label(),
                        operator = "ForemanDispatch",
                        "work order dispatched"
                    );
                    if self
                        .bus
                        .send(
                            member.client_id,
                            ExecutionMessage::WorkOrder(WorkOrderEnvelope {
                                work_order: order,
                                phase,
                            }),
                        )
                        .is_err()
                    {
                        error!(
                            worker_id = %worker_id,
                            operator = "ForemanDispatch",
                            "worker inbox is gone"
                        );
                        return;
                    }
                    self.free_workers.pop_front();
                    dispatched = true;
                    break;
                }
            }
            if !dispatched {
                return;
            }
        }
    }
}
