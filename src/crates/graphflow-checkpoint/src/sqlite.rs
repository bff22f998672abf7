//! SQLite checkpoint saver.
//!
//! Durable lineage storage on a `sqlx` SQLite pool. Insertion order is
//! tracked by an autoincrement sequence column rather than by timestamp,
//! so two checkpoints written within the same millisecond still resolve
//! to a deterministic latest leaf.

use crate::{Checkpoint, CheckpointConfig, CheckpointError, CheckpointSaver, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

/// Checkpoint saver backed by SQLite.
#[derive(Clone)]
pub struct SqliteSaver {
    pool: SqlitePool,
}

impl SqliteSaver {
    /// Wrap an existing pool and ensure the schema exists.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                 seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                 id         TEXT NOT NULL UNIQUE,
                 thread_id  TEXT NOT NULL,
                 namespace  TEXT NOT NULL,
                 parent_id  TEXT,
                 state      TEXT NOT NULL,
                 created_at TEXT NOT NULL
             )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_checkpoints_thread
             ON checkpoints (thread_id, namespace, seq)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    fn row_to_checkpoint(row: &sqlx::sqlite::SqliteRow) -> Result<Checkpoint> {
        let state: String = row.get("state");
        let created_at: String = row.get("created_at");
        Ok(Checkpoint {
            id: row.get("id"),
            parent_id: row.get("parent_id"),
            state: serde_json::from_str(&state)?,
            created_at: created_at
                .parse::<DateTime<Utc>>()
                .map_err(|e| CheckpointError::Invalid(format!("bad created_at: {e}")))?,
        })
    }
}

#[async_trait]
impl CheckpointSaver for SqliteSaver {
    async fn put(&self, config: &CheckpointConfig, checkpoint: Checkpoint) -> Result<()> {
        sqlx::query(
            "INSERT INTO checkpoints (id, thread_id, namespace, parent_id, state, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&checkpoint.id)
        .bind(&config.thread_id)
        .bind(&config.namespace)
        .bind(&checkpoint.parent_id)
        .bind(serde_json::to_string(&checkpoint.state)?)
        .bind(checkpoint.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_latest(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT id, parent_id, state, created_at FROM checkpoints
             WHERE thread_id = ? AND namespace = ?
             ORDER BY seq DESC LIMIT 1",
        )
        .bind(&config.thread_id)
        .bind(&config.namespace)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_checkpoint).transpose()
    }

    async fn list(&self, config: &CheckpointConfig) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(
            "SELECT id, parent_id, state, created_at FROM checkpoints
             WHERE thread_id = ? AND namespace = ?
             ORDER BY seq ASC",
        )
        .bind(&config.thread_id)
        .bind(&config.namespace)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_checkpoint).collect()
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
