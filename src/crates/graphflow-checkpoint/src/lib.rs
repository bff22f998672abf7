//! Checkpoint persistence for graphflow execution.
//!
//! A checkpoint is a snapshot of the full graph state taken after every
//! engine step. Checkpoints are keyed by `(thread_id, namespace)` and carry
//! a parent pointer, so the checkpoints of one thread form a lineage tree
//! whose latest leaf is the state a new run resumes from.
//!
//! The [`CheckpointSaver`] trait is the storage abstraction. Two backends
//! are provided:
//!
//! - [`MemorySaver`] - process-local, for tests and DSN-less operation
//! - [`SqliteSaver`] - durable storage on a `sqlx` SQLite pool
//!
//! Checkpoint state is an opaque JSON blob to this crate; the engine owns
//! its meaning.
//!
//! # Example
//!
//! ```rust,no_run
//! use graphflow_checkpoint::{Checkpoint, CheckpointConfig, CheckpointSaver, MemorySaver};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), graphflow_checkpoint::CheckpointError> {
//! let saver = MemorySaver::new();
//! let config = CheckpointConfig::new("thread-1");
//!
//! let first = Checkpoint::new(json!({"step": 1}), None);
//! let first_id = first.id.clone();
//! saver.put(&config, first).await?;
//!
//! // The next checkpoint chains onto the previous leaf.
//! saver.put(&config, Checkpoint::new(json!({"step": 2}), Some(first_id))).await?;
//!
//! let latest = saver.get_latest(&config).await?.unwrap();
//! assert_eq!(latest.state["step"], 2);
//! # Ok(())
//! # }
//! ```

mod error;
mod memory;
mod saver;
mod sqlite;

pub use error::{CheckpointError, Result};
pub use memory::MemorySaver;
pub use saver::CheckpointSaver;
pub use sqlite::SqliteSaver;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default namespace used when a graph does not run as a subgraph.
pub const DEFAULT_NAMESPACE: &str = "";

/// A snapshot of graph state at a single engine step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique checkpoint id.
    pub id: String,

    /// Id of the checkpoint this one was derived from, `None` for the
    /// first checkpoint of a thread.
    pub parent_id: Option<String>,

    /// Serialized graph state. Opaque to the persistence layer.
    pub state: Value,

    /// Creation time; ordering within a thread is by insertion, not by
    /// this timestamp.
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a checkpoint with a fresh id.
    pub fn new(state: Value, parent_id: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id,
            state,
            created_at: Utc::now(),
        }
    }
}

/// Addresses the checkpoint lineage of one graph invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Conversation thread the lineage belongs to.
    pub thread_id: String,

    /// Distinguishes parent graph from subgraph lineages within one
    /// thread. Empty for the main graph.
    pub namespace: String,
}

impl CheckpointConfig {
    /// Config for the main graph of a thread.
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }

    /// Scope the config to a subgraph namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}
