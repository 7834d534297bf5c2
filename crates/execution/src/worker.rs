//! Worker threads executing work orders to completion.
//!
//! Each worker is a thread mapped to a NUMA node with a two-state machine:
//! idle (registered as free with the foreman) or busy (executing one work
//! order). Workers never poll or steal; they are strictly driven by
//! [`crate::bus::ExecutionMessage::WorkOrder`] messages and reply with one
//! completion message per order. A poison message shuts the thread down.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;
use quarry_common::{ExecutionConfig, NumaNodeId, WorkerId};
use tracing::{debug, error, warn};

use crate::bus::{ClientId, CompletionMessage, ExecutionMessage, MessageBus};
use crate::work_order::WorkOrderPhase;

/// Pool membership record for one worker.
#[derive(Debug, Clone, Copy)]
pub struct WorkerMember {
    /// Worker id (dense index into the pool).
    pub worker_id: WorkerId,
    /// Bus client the foreman dispatches to.
    pub client_id: ClientId,
    /// NUMA node the worker is bound to.
    pub numa_node: NumaNodeId,
}

/// Fixed-size set of worker threads.
pub struct WorkerPool {
    members: Vec<WorkerMember>,
    handles: Vec<JoinHandle<()>>,
    bus: Arc<MessageBus>,
}

impl WorkerPool {
    /// Spawns `config.num_workers` threads, each with its own bus inbox and
    /// NUMA node assignment, replying to `foreman_client`.
    pub fn spawn(bus: &Arc<MessageBus>, foreman_client: ClientId, config: &ExecutionConfig) -> Self {
        let mut members = Vec::with_capacity(config.num_workers);
        let mut handles = Vec::with_capacity(config.num_workers);
        for index in 0..config.num_workers {
            let (client_id, receiver) = bus.register_client();
            let worker_id = WorkerId(index);
            let numa_node = config.numa_node_of_worker(index);
            members.push(WorkerMember {
                worker_id,
                client_id,
                numa_node,
            });
            let bus = Arc::clone(bus);
            let handle = std::thread::Builder::new()
                .name(format!("quarry-worker-{index}"))
                .spawn(move || run_worker(worker_id, bus, foreman_client, receiver))
                .expect("worker thread spawn");
            handles.push(handle);
        }
        Self {
            members,
            handles,
            bus: Arc::clone(bus),
        }
    }

    /// Pool membership records.
    pub fn members(&self) -> &[WorkerMember] {
        &self.members
    }

    /// Poisons every worker and joins the threads.
    pub fn shutdown(&mut self) {
        for member in &self.members {
            let _ = self.bus.send(member.client_id, ExecutionMessage::Poison);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    worker_id: WorkerId,
    bus: Arc<MessageBus>,
    foreman_client: ClientId,
    receiver: Receiver<ExecutionMessage>,
) {
    debug!(worker_id = %worker_id, operator = "WorkerStart", "worker started");
    for message in receiver.iter() {
        match message {
            ExecutionMessage::WorkOrder(envelope) => {
                let mut order = envelope.work_order;
                let result = order.execute();
                if let Err(e) = &result {
                    error!(
                        worker_id = %worker_id,
                        query_id = %order.query_id(),
                        op_index = order.op_index(),
                        partition_id = order.partition_id(),
                        error = %e,
                        operator = "WorkerExecute",
                        "work order failed"
                    );
                }
                let completion = CompletionMessage {
                    query_id: order.query_id(),
                    op_index: order.op_index(),
                    partition_id: order.partition_id(),
                    worker_id,
                    error: result.err().map(|e| e.to_string()),
                };
                let reply = match envelope.phase {
                    WorkOrderPhase::Normal => ExecutionMessage::WorkOrderCompletion(completion),
                    WorkOrderPhase::Rebuild => {
                        ExecutionMessage::RebuildWorkOrderCompletion(completion)
                    }
                };
                if bus.send(foreman_client, reply).is_err() {
                    break;
                }
            }
            ExecutionMessage::Poison => break,
            other => {
                warn!(
                    worker_id = %worker_id,
                    operator = "WorkerProtocol",
                    "unexpected message: {other:?}"
                );
            }
        }
    }
    debug!(worker_id = %worker_id, operator = "WorkerStop", "worker stopped");
}
