//! In-memory message store, used when no persistence DSN is configured.

use super::{MessageRecord, MessageStore, MessageWithTrace, Result, Role, StoreError, Thread, TraceRecord};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct Inner {
    threads: HashMap<String, Thread>,
    // thread_id -> ordered messages
    messages: HashMap<String, Vec<MessageRecord>>,
    // message_id -> ordered trace
    traces: HashMap<String, Vec<TraceRecord>>,
}

/// Process-local message store.
#[derive(Clone, Default)]
pub struct MemoryMessageStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn create_thread(&self, id: &str, name: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        match inner.threads.get_mut(id) {
            Some(thread) => {
                if thread.name.is_none() {
                    if let Some(name) = name {
                        thread.name = Some(name.to_string());
                    }
                }
                thread.updated_at = now;
            }
            None => {
                inner.threads.insert(
                    id.to_string(),
                    Thread {
                        id: id.to_string(),
                        name: name.map(str::to_string),
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
        Ok(())
    }

    async fn get_thread(&self, id: &str) -> Result<Option<Thread>> {
        Ok(self.inner.lock().await.threads.get(id).cloned())
    }

    async fn list_threads(&self) -> Result<Vec<Thread>> {
        let inner = self.inner.lock().await;
        let mut threads: Vec<Thread> = inner.threads.values().cloned().collect();
        threads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(threads)
    }

    async fn append_message(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
    ) -> Result<MessageRecord> {
        let mut inner = self.inner.lock().await;
        if !inner.threads.contains_key(thread_id) {
            return Err(StoreError::NotFound(format!("thread '{thread_id}'")));
        }

        let messages = inner.messages.entry(thread_id.to_string()).or_default();
        let message = MessageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            role,
            content: content.to_string(),
            message_index: messages.len() as i64,
        };
        messages.push(message.clone());

        if let Some(thread) = inner.threads.get_mut(thread_id) {
            thread.updated_at = Utc::now();
        }
        Ok(message)
    }

    async fn set_trace(&self, message_id: &str, events: &[TraceRecord]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.traces.insert(message_id.to_string(), events.to_vec());
        Ok(())
    }

    async fn get_trace_count(&self, message_id: &str) -> Result<usize> {
        Ok(self
            .inner
            .lock()
            .await
            .traces
            .get(message_id)
            .map(Vec::len)
            .unwrap_or(0))
    }

    async fn get_history(&self, thread_id: &str) -> Result<Vec<MessageWithTrace>> {
        let inner = self.inner.lock().await;
        let messages = inner.messages.get(thread_id).cloned().unwrap_or_default();
        Ok(messages
            .into_iter()
            .map(|message| {
                let trace = inner.traces.get(&message.id).cloned().unwrap_or_default();
                MessageWithTrace { message, trace }
            })
            .collect())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.threads.remove(thread_id);
        if let Some(messages) = inner.messages.remove(thread_id) {
            for message in messages {
                inner.traces.remove(&message.id);
            }
        }
        Ok(())
    }
}
