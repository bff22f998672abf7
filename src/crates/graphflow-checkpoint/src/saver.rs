//! The storage abstraction for checkpoint lineages.

use crate::{Checkpoint, CheckpointConfig, Result};
use async_trait::async_trait;

/// Storage backend for checkpoint lineages.
///
/// Implementations must keep checkpoints of one `(thread_id, namespace)`
/// pair in insertion order: [`get_latest`](Self::get_latest) returns the
/// most recently stored checkpoint, which is the leaf the engine chains
/// the next `parent_id` onto. Writers for a single thread are serialized
/// by the engine; implementations only need to tolerate concurrent
/// writers across *different* threads.
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Store a checkpoint at the end of the lineage.
    async fn put(&self, config: &CheckpointConfig, checkpoint: Checkpoint) -> Result<()>;

    /// Fetch the latest checkpoint of a lineage, if any.
    async fn get_latest(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>>;

    /// Fetch the full lineage in insertion order. Used by tests and
    /// debugging tools; not on the hot path.
    async fn list(&self, config: &CheckpointConfig) -> Result<Vec<Checkpoint>>;

    /// Drop every checkpoint of a thread across all namespaces.
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;
}
