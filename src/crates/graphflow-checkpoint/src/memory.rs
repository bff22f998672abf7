//! In-memory checkpoint saver.
//!
//! The default backend when no persistence DSN is configured. State lives
//! for the lifetime of the process; threads cannot resume across
//! restarts, but within a process the semantics match [`SqliteSaver`]
//! exactly.
//!
//! [`SqliteSaver`]: crate::SqliteSaver

use crate::{Checkpoint, CheckpointConfig, CheckpointSaver, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

type Storage = Arc<RwLock<HashMap<CheckpointConfig, Vec<Checkpoint>>>>;

/// Process-local checkpoint storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySaver {
    storage: Storage,
}

impl MemorySaver {
    /// Create an empty saver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoints across all lineages. Test helper.
    pub async fn checkpoint_count(&self) -> usize {
        self.storage.read().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl CheckpointSaver for MemorySaver {
    async fn put(&self, config: &CheckpointConfig, checkpoint: Checkpoint) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage.entry(config.clone()).or_default().push(checkpoint);
        Ok(())
    }

    async fn get_latest(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>> {
        let storage = self.storage.read().await;
        Ok(storage.get(config).and_then(|entries| entries.last().cloned()))
    }

    async fn list(&self, config: &CheckpointConfig) -> Result<Vec<Checkpoint>> {
        let storage = self.storage.read().await;
        Ok(storage.get(config).cloned().unwrap_or_default())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage.retain(|config, _| config.thread_id != thread_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn latest_follows_insertion_order() {
        let saver = MemorySaver::new();
        let config = CheckpointConfig::new("t1");

        let first = Checkpoint::new(json!({"n": 1}), None);
        let first_id = first.id.clone();
        saver.put(&config, first).await.unwrap();
        saver
            .put(&config, Checkpoint::new(json!({"n": 2}), Some(first_id.clone())))
            .await
            .unwrap();

        let latest = saver.get_latest(&config).await.unwrap().unwrap();
        assert_eq!(latest.state["n"], 2);
        assert_eq!(latest.parent_id.as_deref(), Some(first_id.as_str()));
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let saver = MemorySaver::new();
        let root = CheckpointConfig::new("t1");
        let sub = CheckpointConfig::new("t1").with_namespace("researcher");

        saver.put(&root, Checkpoint::new(json!({"g": "main"}), None)).await.unwrap();
        saver.put(&sub, Checkpoint::new(json!({"g": "sub"}), None)).await.unwrap();

        assert_eq!(saver.get_latest(&root).await.unwrap().unwrap().state["g"], "main");
        assert_eq!(saver.get_latest(&sub).await.unwrap().unwrap().state["g"], "sub");
    }

    #[tokio::test]
    async fn delete_thread_clears_all_namespaces() {
        let saver = MemorySaver::new();
        let root = CheckpointConfig::new("t1");
        let sub = CheckpointConfig::new("t1").with_namespace("researcher");
        let other = CheckpointConfig::new("t2");

        saver.put(&root, Checkpoint::new(json!({}), None)).await.unwrap();
        saver.put(&sub, Checkpoint::new(json!({}), None)).await.unwrap();
        saver.put(&other, Checkpoint::new(json!({}), None)).await.unwrap();

        saver.delete_thread("t1").await.unwrap();

        assert!(saver.get_latest(&root).await.unwrap().is_none());
        assert!(saver.get_latest(&sub).await.unwrap().is_none());
        assert!(saver.get_latest(&other).await.unwrap().is_some());
    }
}
