//! Typed message bus connecting the foreman, workers, and clients.
//!
//! Contract:
//! - reliable delivery with per-sender FIFO ordering (crossbeam channels
//!   preserve send order per channel; concurrent senders interleave
//!   arbitrarily);
//! - each registered client owns the receiving end of its inbox; anyone
//!   holding the bus may send to any client id.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use quarry_common::{BlockId, OpIndex, PartitionId, QuarryError, QueryId, RelationId, Result, WorkerId};
use quarry_plan::QueryPlan;

use crate::work_order::{BoxedWorkOrder, WorkOrderPhase};

/// Bus client identifier (dense index assigned at registration).
pub type ClientId = usize;

/// Admission payload carried by [`ExecutionMessage::AdmitQuery`].
#[derive(Debug)]
pub struct QueryHandle {
    /// Validated-on-admission serialized plan.
    pub plan: QueryPlan,
    /// Client to notify with the terminal [`ExecutionMessage::QueryComplete`].
    pub reply_to: ClientId,
}

/// Work-order dispatch payload.
pub struct WorkOrderEnvelope {
    /// The one-shot unit of work.
    pub work_order: BoxedWorkOrder,
    /// Scheduling phase the order belongs to.
    pub phase: WorkOrderPhase,
}

impl std::fmt::Debug for WorkOrderEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkOrderEnvelope")
            .field("query_id", &self.work_order.query_id())
            .field("op_index", &self.work_order.op_index())
            .field("partition_id", &self.work_order.partition_id())
            .field("phase", &self.phase)
            .finish()
    }
}

/// Completion report sent by a worker back to the foreman.
#[derive(Debug, Clone)]
pub struct CompletionMessage {
    /// Query the completed order belongs to.
    pub query_id: QueryId,
    /// Operator of the completed order.
    pub op_index: OpIndex,
    /// Partition of the completed order.
    pub partition_id: PartitionId,
    /// Worker that executed the order.
    pub worker_id: WorkerId,
    /// Error message if execution failed.
    pub error: Option<String>,
}

/// Announcement of a block produced by a pipelining operator.
#[derive(Debug, Clone)]
pub struct DataPipelineMessage {
    /// Query the producing operator belongs to.
    pub query_id: QueryId,
    /// Producing operator.
    pub producer_op: OpIndex,
    /// Newly available block.
    pub block_id: BlockId,
    /// Relation the block belongs to.
    pub relation_id: RelationId,
    /// Output partition of the producer.
    pub partition_id: PartitionId,
}

/// Terminal status delivered to the submitting client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResultStatus {
    /// Every operator partition completed.
    Succeeded,
    /// A work order failed; the query was drained and torn down.
    Failed(String),
    /// The query was cancelled and drained.
    Cancelled,
}

impl QueryResultStatus {
    /// Short status label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            QueryResultStatus::Succeeded => "succeeded",
            QueryResultStatus::Failed(_) => "failed",
            QueryResultStatus::Cancelled => "cancelled",
        }
    }
}

/// Terminal notification payload.
#[derive(Debug, Clone)]
pub struct QueryCompleteMessage {
    /// Finished query.
    pub query_id: QueryId,
    /// Terminal status.
    pub status: QueryResultStatus,
}

/// All messages exchanged over the bus.
#[derive(Debug)]
pub enum ExecutionMessage {
    /// Client -> foreman: admit a query for execution.
    AdmitQuery(Box<QueryHandle>),
    /// Foreman -> worker: execute one work order.
    WorkOrder(WorkOrderEnvelope),
    /// Worker -> foreman: a normal work order finished.
    WorkOrderCompletion(CompletionMessage),
    /// Worker -> foreman: a rebuild work order finished.
    RebuildWorkOrderCompletion(CompletionMessage),
    /// Worker -> foreman: a producer handed off an output block.
    DataPipeline(DataPipelineMessage),
    /// Client -> foreman: cancel a running query.
    CancelQuery(QueryId),
    /// Foreman -> client: terminal query status.
    QueryComplete(QueryCompleteMessage),
    /// Shutdown request for the receiving thread.
    Poison,
}

/// Multi-producer/multi-consumer transport with per-client inboxes.
#[derive(Debug, Default)]
pub struct MessageBus {
    clients: Mutex<Vec<Sender<ExecutionMessage>>>,
}

impl MessageBus {
    /// Constructs an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client, returning its id and the receiving inbox end.
    pub fn register_client(&self) -> (ClientId, Receiver<ExecutionMessage>) {
        let (tx, rx) = unbounded();
        let mut clients = self.clients.lock();
        let id = clients.len();
        clients.push(tx);
        (id, rx)
    }

    /// Sends a message to one client.
    pub fn send(&self, to: ClientId, message: ExecutionMessage) -> Result<()> {
        let sender = {
            let clients = self.clients.lock();
            clients
                .get(to)
                .cloned()
                .ok_or_else(|| QuarryError::Protocol(format!("unknown bus client {to}")))?
        };
        sender
            .send(message)
            .map_err(|_| QuarryError::Protocol(format!("bus client {to} is disconnected")))
    }

    /// Number of registered clients.
    pub fn num_clients(&self) -> usize {
        self.clients.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_per_sender_order() {
        let bus = MessageBus::new();
        let (id, rx) = bus.register_client();
        bus.send(id, ExecutionMessage::CancelQuery(QueryId(1))).unwrap();
        bus.send(id, ExecutionMessage::CancelQuery(QueryId(2))).unwrap();
        match rx.recv().unwrap() {
            ExecutionMessage::CancelQuery(q) => assert_eq!(q, QueryId(1)),
            other => panic!("unexpected message: {other:?}"),
        }
        match rx.recv().unwrap() {
            ExecutionMessage::CancelQuery(q) => assert_eq!(q, QueryId(2)),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_client_is_a_protocol_error() {
        let bus = MessageBus::new();
        let err = bus
            .send(42, ExecutionMessage::Poison)
            .unwrap_err();
        assert!(matches!(err, QuarryError::Protocol(_)));
    }
}
