//! Work-order scheduling core of the quarry analytic database.
//!
//! Architecture role:
//! - turns a validated physical operator DAG into work orders, schedules
//!   them across worker threads, and tracks per-partition progress
//! - two-phase execution: normal work orders, then rebuild work orders for
//!   operators that finalize intermediate structures
//! - foreman thread and worker pool communicate exclusively through the
//!   typed message bus
//!
//! Key modules:
//! - [`bus`]
//! - [`work_order`] / [`container`] / [`state`]
//! - [`context`] / [`aggregation`] / [`hash_table`]
//! - [`operators`]
//! - [`query_manager`] / [`foreman`] / [`worker`]

pub mod aggregation;
pub mod bus;
pub mod container;
pub mod context;
pub mod foreman;
pub mod hash_table;
pub mod keys;
pub mod operators;
pub mod query_manager;
pub mod state;
pub mod work_order;
pub mod worker;

pub use bus::{
    ClientId, CompletionMessage, DataPipelineMessage, ExecutionMessage, MessageBus,
    QueryCompleteMessage, QueryHandle, QueryResultStatus, WorkOrderEnvelope,
};
pub use container::WorkOrdersContainer;
pub use context::QueryContext;
pub use foreman::{Foreman, ForemanHandle};
pub use query_manager::{OperatorProgress, QueryManager, QueryStatusSnapshot};
pub use state::QueryExecutionState;
pub use work_order::{BoxedWorkOrder, WorkOrder, WorkOrderPhase};
pub use worker::{WorkerMember, WorkerPool};
