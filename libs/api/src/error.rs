//! The error taxonomy shared across the scheduling domain.

use thiserror::Error;

/// Every failure the core distinguishes. Transport-level errors are folded
/// into `AgentUnavailable` or `RuntimeFailure` at the proxy boundary; the
/// registry turns these into scheduling signals rather than propagating
/// them directly.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Bad container ID, config, or job definition.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The ID is already known in a state that forbids the operation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The ID is unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// The endpoint is unreachable, or its state machine is not trusted.
    #[error("agent unavailable: {0}")]
    AgentUnavailable(String),

    /// A grace window expired before the maneuver completed.
    #[error("operation timed out: {0}")]
    OperationTimeout(String),

    /// The agent accepted the request but the operation failed remotely.
    #[error("runtime failure: {0}")]
    RuntimeFailure(String),

    /// The agent disappeared while the container was scheduled on it.
    #[error("lost: {0}")]
    Lost(String),
}
