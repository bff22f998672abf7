//! Error types for checkpoint persistence.

use thiserror::Error;

/// Result type for checkpoint operations.
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors raised by checkpoint savers.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The caller passed an unusable config or checkpoint.
    #[error("Invalid checkpoint request: {0}")]
    Invalid(String),

    /// Checkpoint state could not be (de)serialized.
    #[error("Checkpoint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The storage backend failed.
    #[error("Checkpoint storage failed: {0}")]
    Storage(#[from] sqlx::Error),
}
