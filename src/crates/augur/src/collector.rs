//! Per-run trace collection and post-run reconciliation.
//!
//! The collector subscribes to the run's engine output, retains
//! trace-type envelopes in observation order, and additionally captures
//! `execution_trace` arrays returned in terminal-node updates (those
//! carry events created just before the node returned, which may never
//! travel the bus before the run ends).
//!
//! After the run, [`TraceCollector::reconcile`] compares its count with
//! the persisted count for the assistant message and atomically replaces
//! the persisted sequence when the collected one is larger. Replacement
//! (never merge) keeps the per-message single-sequence invariant:
//! re-running reconciliation with the same collection is a no-op.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use graphflow_core::{EngineOutput, Envelope};

use crate::state::fields;
use crate::store::{MessageStore, Result, TraceRecord};

/// Ordered trace collection for one run.
#[derive(Default)]
pub struct TraceCollector {
    events: Vec<TraceRecord>,
}

impl TraceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one engine output through the collector.
    pub fn observe(&mut self, output: &EngineOutput) {
        match output {
            EngineOutput::Event(envelope) if envelope.is_trace() => {
                self.events.push(Self::record(envelope));
            }
            EngineOutput::Updates { update, .. } => {
                if let Some(entries) = update.get(fields::EXECUTION_TRACE).and_then(Value::as_array)
                {
                    for entry in entries {
                        let envelope = Envelope::from_value(entry.clone());
                        if envelope.is_trace() {
                            self.events.push(Self::record(&envelope));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Collected events in observation order.
    pub fn events(&self) -> &[TraceRecord] {
        &self.events
    }

    /// Replace the persisted trace when the collected one is larger.
    pub async fn reconcile(&self, store: &dyn MessageStore, message_id: &str) -> Result<()> {
        let persisted = store.get_trace_count(message_id).await?;
        if self.events.len() > persisted {
            tracing::debug!(
                message_id,
                persisted,
                collected = self.events.len(),
                "repairing incomplete trace"
            );
            store.set_trace(message_id, &self.events).await?;
        }
        Ok(())
    }

    fn record(envelope: &Envelope) -> TraceRecord {
        TraceRecord {
            kind: envelope.event.clone(),
            payload: envelope.payload.clone(),
            timestamp_ms: envelope.timestamp_ms,
        }
    }
}

/// Per-thread async locks serializing reconciliation and message writes
/// for one thread. Different threads proceed concurrently.
#[derive(Clone, Default)]
pub struct ThreadLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ThreadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for one thread, created on first use.
    pub async fn for_thread(&self, thread_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
