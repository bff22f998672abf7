//! SQLite message store.
//!
//! `message_index` is assigned as `max(index) + 1` inside a transaction,
//! so concurrent writers on *different* threads never conflict and a
//! single thread's indices stay dense. Trace replacement (delete +
//! insert) also runs in one transaction so readers never observe a
//! half-written sequence.

use super::{MessageRecord, MessageStore, MessageWithTrace, Result, Role, StoreError, Thread, TraceRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

/// Message store backed by SQLite.
#[derive(Clone)]
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    /// Wrap an existing pool and ensure the schema exists.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS threads (
                 id         TEXT PRIMARY KEY,
                 name       TEXT,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                 id            TEXT PRIMARY KEY,
                 thread_id     TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
                 role          TEXT NOT NULL,
                 content       TEXT NOT NULL,
                 message_index INTEGER NOT NULL,
                 UNIQUE (thread_id, message_index)
             )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trace_events (
                 message_id   TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                 event_index  INTEGER NOT NULL,
                 kind         TEXT NOT NULL,
                 payload      TEXT NOT NULL,
                 timestamp_ms INTEGER NOT NULL,
                 PRIMARY KEY (message_id, event_index)
             )",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    fn row_to_thread(row: &sqlx::sqlite::SqliteRow) -> Result<Thread> {
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");
        let parse = |s: &str| {
            s.parse::<DateTime<Utc>>()
                .map_err(|e| StoreError::NotFound(format!("bad timestamp: {e}")))
        };
        Ok(Thread {
            id: row.get("id"),
            name: row.get("name"),
            created_at: parse(&created_at)?,
            updated_at: parse(&updated_at)?,
        })
    }

    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<MessageRecord> {
        let role: String = row.get("role");
        Ok(MessageRecord {
            id: row.get("id"),
            thread_id: row.get("thread_id"),
            role: Role::parse(&role)?,
            content: row.get("content"),
            message_index: row.get("message_index"),
        })
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn create_thread(&self, id: &str, name: Option<&str>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO threads (id, name, created_at, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                 name = COALESCE(threads.name, excluded.name),
                 updated_at = excluded.updated_at",
        )
        .bind(id)
        .bind(name)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_thread(&self, id: &str) -> Result<Option<Thread>> {
        let row = sqlx::query("SELECT * FROM threads WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_thread).transpose()
    }

    async fn list_threads(&self) -> Result<Vec<Thread>> {
        let rows = sqlx::query("SELECT * FROM threads ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_thread).collect()
    }

    async fn append_message(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
    ) -> Result<MessageRecord> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM threads WHERE id = ?")
            .bind(thread_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!("thread '{thread_id}'")));
        }

        let next_index: (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(message_index) + 1, 0) FROM messages WHERE thread_id = ?",
        )
        .bind(thread_id)
        .fetch_one(&mut *tx)
        .await?;

        let message = MessageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            role,
            content: content.to_string(),
            message_index: next_index.0,
        };

        sqlx::query(
            "INSERT INTO messages (id, thread_id, role, content, message_index)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&message.thread_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.message_index)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE threads SET updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(message)
    }

    async fn set_trace(&self, message_id: &str, events: &[TraceRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM trace_events WHERE message_id = ?")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;

        for (index, event) in events.iter().enumerate() {
            sqlx::query(
                "INSERT INTO trace_events (message_id, event_index, kind, payload, timestamp_ms)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(message_id)
            .bind(index as i64)
            .bind(&event.kind)
            .bind(serde_json::to_string(&event.payload)?)
            .bind(event.timestamp_ms)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_trace_count(&self, message_id: &str) -> Result<usize> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM trace_events WHERE message_id = ?")
                .bind(message_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0 as usize)
    }

    async fn get_history(&self, thread_id: &str) -> Result<Vec<MessageWithTrace>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE thread_id = ? ORDER BY message_index ASC",
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;

        let mut history = Vec::with_capacity(rows.len());
        for row in &rows {
            let message = Self::row_to_message(row)?;
            let trace_rows = sqlx::query(
                "SELECT kind, payload, timestamp_ms FROM trace_events
                 WHERE message_id = ? ORDER BY event_index ASC",
            )
            .bind(&message.id)
            .fetch_all(&self.pool)
            .await?;

            let mut trace = Vec::with_capacity(trace_rows.len());
            for trace_row in &trace_rows {
                let payload: String = trace_row.get("payload");
                trace.push(TraceRecord {
                    kind: trace_row.get("kind"),
                    payload: serde_json::from_str(&payload)?,
                    timestamp_ms: trace_row.get("timestamp_ms"),
                });
            }
            history.push(MessageWithTrace { message, trace });
        }
        Ok(history)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        // Cascade by hand: SQLite enforces FK cascades only when the
        // pragma is on, which pool configs differ about.
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM trace_events WHERE message_id IN
                 (SELECT id FROM messages WHERE thread_id = ?)",
        )
        .bind(thread_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM messages WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM threads WHERE id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> SqliteMessageStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteMessageStore::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn append_assigns_dense_indices() {
        let store = test_store().await;
        store.create_thread("t1", Some("Test thread")).await.unwrap();

        let first = store.append_message("t1", Role::User, "question").await.unwrap();
        let second = store.append_message("t1", Role::Assistant, "answer").await.unwrap();
        assert_eq!(first.message_index, 0);
        assert_eq!(second.message_index, 1);
    }

    #[tokio::test]
    async fn trace_round_trips_in_order() {
        let store = test_store().await;
        store.create_thread("t1", None).await.unwrap();
        let message = store.append_message("t1", Role::Assistant, "report").await.unwrap();

        let events = vec![
            TraceRecord {
                kind: "node_call".to_string(),
                payload: json!({"node": "supervisor"}),
                timestamp_ms: 10,
            },
            TraceRecord {
                kind: "search".to_string(),
                payload: json!({"query": "rust"}),
                timestamp_ms: 20,
            },
        ];
        store.set_trace(&message.id, &events).await.unwrap();

        let history = store.get_history("t1").await.unwrap();
        assert_eq!(history[0].trace, events);
        assert_eq!(store.get_trace_count(&message.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn delete_thread_cascades_to_traces() {
        let store = test_store().await;
        store.create_thread("t1", None).await.unwrap();
        let message = store.append_message("t1", Role::Assistant, "x").await.unwrap();
        store
            .set_trace(
                &message.id,
                &[TraceRecord {
                    kind: "node_call".to_string(),
                    payload: json!({}),
                    timestamp_ms: 1,
                }],
            )
            .await
            .unwrap();

        store.delete_thread("t1").await.unwrap();
        assert!(store.get_thread("t1").await.unwrap().is_none());
        assert_eq!(store.get_trace_count(&message.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn append_rejects_unknown_thread() {
        let store = test_store().await;
        let result = store.append_message("nope", Role::User, "x").await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
