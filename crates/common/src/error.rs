use thiserror::Error;

/// Canonical quarry error taxonomy used across crates.
///
/// Classification guidance:
/// - [`QuarryError::Plan`]: malformed serialized plans and catalog-reference
///   failures discovered by validation, before execution starts
/// - [`QuarryError::Execution`]: runtime work-order evaluation, decode, or
///   data-shape failures
/// - [`QuarryError::Storage`]: block manager contract violations (unknown
///   block, destroy-while-pinned, unpin without pin)
/// - [`QuarryError::Protocol`]: scheduling message contract violations
///   (double completion, completion for an unknown query)
/// - [`QuarryError::InvalidConfig`]: configuration/environment contract
///   violations
/// - [`QuarryError::Io`]: raw filesystem IO failures from std APIs
#[derive(Debug, Error)]
pub enum QuarryError {
    /// Invalid or inconsistent configuration state.
    ///
    /// Examples:
    /// - zero worker threads
    /// - NUMA node count exceeding worker count
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Plan validation failures.
    ///
    /// Examples:
    /// - unknown relation or attribute id
    /// - context-slot index out of range
    /// - type mismatch between an expression and its input schema
    #[error("plan error: {0}")]
    Plan(String),

    /// Runtime execution failures after validation succeeded.
    ///
    /// Examples:
    /// - expression evaluation failure inside a work order
    /// - arithmetic kernel failure
    /// - destination append with a mismatched schema
    #[error("execution error: {0}")]
    Execution(String),

    /// Block manager contract violations.
    ///
    /// Examples:
    /// - load of an unknown block id
    /// - destroying a block that still has pins
    #[error("storage error: {0}")]
    Storage(String),

    /// Scheduling protocol violations between foreman and workers.
    ///
    /// Examples:
    /// - completion reported twice for the same work order
    /// - message addressed to an unregistered bus client
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Standard quarry result alias.
pub type Result<T> = std::result::Result<T, QuarryError>;
