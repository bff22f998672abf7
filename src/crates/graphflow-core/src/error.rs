//! Error taxonomy for graph execution.
//!
//! The variants mirror how failures surface to the orchestrator: driver
//! failures arrive pre-classified as transient or permanent, node
//! contract violations are preconditions, and reducer or lineage
//! problems are internal assertions that indicate a bug rather than an
//! environmental failure.

use thiserror::Error;

/// Result type for graph operations.
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors raised while building or running a graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The graph structure is unusable (missing node, dangling edge).
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// A node raised. The run is aborted; state up to the last
    /// successful checkpoint is intact.
    #[error("Node '{node}' failed: {message}")]
    NodeFailed {
        /// Name of the failing node.
        node: String,
        /// Short human-readable cause, already stripped of driver detail.
        message: String,
    },

    /// An external driver failed transiently (rate limit, timeout, 5xx)
    /// after its own bounded retries were exhausted.
    #[error("Transient driver failure: {0}")]
    TransientDriver(String),

    /// An external driver failed permanently (4xx, bad config,
    /// unparseable structured output after retries).
    #[error("Permanent driver failure: {0}")]
    PermanentDriver(String),

    /// A node invariant was violated (e.g. a clarification with an
    /// empty question).
    #[error("State precondition violated: {0}")]
    Precondition(String),

    /// The request context was cancelled. No completion or error
    /// envelope is synthesized for this case.
    #[error("Run cancelled")]
    Cancelled,

    /// Reducer application failed.
    #[error("Reducer failed for field '{field}': {message}")]
    Reducer {
        /// State field the reducer was applied to.
        field: String,
        /// What went wrong.
        message: String,
    },

    /// Checkpoint persistence failed.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] graphflow_checkpoint::CheckpointError),

    /// A contract the engine relies on was broken. Indicates a bug.
    #[error("Internal assertion failed: {0}")]
    Internal(String),
}

impl GraphError {
    /// Whether the failure came from the cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GraphError::Cancelled)
    }

    /// Short string suitable for an `error` envelope payload.
    pub fn envelope_message(&self) -> String {
        match self {
            GraphError::NodeFailed { node, message } => format!("{node}: {message}"),
            other => other.to_string(),
        }
    }
}
