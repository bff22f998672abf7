//! Flat, query-optimized store of threads, messages, and trace events.
//!
//! This is the half of the hybrid persistence model the UI reads:
//! threads with ordered messages, each assistant message carrying one
//! ordered trace sequence. Checkpoints (the other half) live in
//! `graphflow-checkpoint`; the two are coordinated per thread by the
//! orchestrator.
//!
//! `message_index` is dense and strictly increasing per thread and is
//! assigned inside the store's write path. Trace sequences are written
//! with replace-all semantics only, which is what makes post-run
//! reconciliation idempotent.

mod memory;
mod sqlite;

pub use memory::MemoryMessageStore;
pub use sqlite::SqliteMessageStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by the message store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Referenced thread or message does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Payload (de)serialization failed.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The storage backend failed.
    #[error("Storage failed: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Wire/storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Parse from the storage name.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(StoreError::NotFound(format!("unknown role '{other}'"))),
        }
    }
}

/// A conversation thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    /// Opaque stable id.
    pub id: String,
    /// Human-readable name, generated once on the first turn.
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Unique message id.
    pub id: String,
    /// Owning thread.
    pub thread_id: String,
    pub role: Role,
    pub content: String,
    /// Dense position within the thread.
    pub message_index: i64,
}

/// One persisted trace event. `event_index` is positional: the slice
/// order passed to [`MessageStore::set_trace`] is the stored order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Trace kind (`node_call`, `reasoning`, `search`, ...).
    pub kind: String,
    /// Structured payload, opaque to the store.
    pub payload: Value,
    /// Emission time, display only.
    pub timestamp_ms: i64,
}

/// A message joined with its trace sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageWithTrace {
    pub message: MessageRecord,
    pub trace: Vec<TraceRecord>,
}

/// Persistent store of threads, ordered messages, and per-message
/// trace sequences.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Create a thread if absent; set its name when one is given and
    /// none is stored yet.
    async fn create_thread(&self, id: &str, name: Option<&str>) -> Result<()>;

    /// Fetch one thread.
    async fn get_thread(&self, id: &str) -> Result<Option<Thread>>;

    /// All threads, most recently updated first.
    async fn list_threads(&self) -> Result<Vec<Thread>>;

    /// Append a message at the next dense index.
    async fn append_message(&self, thread_id: &str, role: Role, content: &str)
        -> Result<MessageRecord>;

    /// Replace the full trace sequence of a message.
    async fn set_trace(&self, message_id: &str, events: &[TraceRecord]) -> Result<()>;

    /// Number of persisted trace events for a message.
    async fn get_trace_count(&self, message_id: &str) -> Result<usize>;

    /// Messages of a thread in index order, each with its trace.
    async fn get_history(&self, thread_id: &str) -> Result<Vec<MessageWithTrace>>;

    /// Delete a thread, cascading to messages and traces.
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;
}
