#![deny(missing_docs)]

//! Shared configuration, error types, IDs, and observability primitives for
//! quarry crates.
//!
//! Architecture role:
//! - defines scheduler/runtime configuration passed across layers
//! - provides common [`QuarryError`] / [`Result`] contracts
//! - hosts the Prometheus metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

/// Scheduler/runtime configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers and dense index aliases.
pub mod ids;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;

pub use config::ExecutionConfig;
pub use error::{QuarryError, Result};
pub use ids::*;
pub use metrics::{global_metrics, MetricsRegistry};
