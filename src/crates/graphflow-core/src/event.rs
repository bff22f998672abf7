//! Event envelopes and the per-run event bus.
//!
//! Every event crossing a run boundary is a normalized [`Envelope`] with
//! five fields: a closed [`EventType`], a millisecond timestamp, the
//! emitting node, an event name, and an opaque JSON payload. Nodes never
//! build raw shapes; the constructors on [`Envelope`] are the only legal
//! producers, and anything legacy-shaped is normalized on ingress by
//! [`Envelope::from_value`].
//!
//! The bus itself is a bounded `tokio` mpsc channel with the engine as
//! the single producer. The channel blocks the emitter when full -
//! dropping events is not permitted, so slow consumers back-pressure
//! node emission instead of losing data. Items on the bus are
//! [`EngineOutput`]s: either an envelope or a per-node `updates` record.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Closed set of envelope types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Execution trace event, persisted alongside the assistant message.
    Trace,
    /// Application-defined progress event streamed to the client.
    Custom,
    /// Auto-derived snapshot of configured state fields after a step.
    StateUpdate,
    /// Run-level marker (e.g. the thread id announcement).
    System,
    /// Terminal failure marker.
    Error,
    /// Terminal success marker carrying the final response.
    Complete,
}

impl EventType {
    /// Wire name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Trace => "trace",
            EventType::Custom => "custom",
            EventType::StateUpdate => "state_update",
            EventType::System => "system",
            EventType::Error => "error",
            EventType::Complete => "complete",
        }
    }
}

/// Kinds of trace events recorded for an assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    /// A node started executing.
    NodeCall,
    /// Model reasoning text surfaced for display.
    Reasoning,
    /// A search was issued or produced a hit.
    Search,
    /// A notable state transition.
    StateUpdate,
    /// Anything else the application wants on the trace.
    Custom,
}

impl TraceKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceKind::NodeCall => "node_call",
            TraceKind::Reasoning => "reasoning",
            TraceKind::Search => "search",
            TraceKind::StateUpdate => "state_update",
            TraceKind::Custom => "custom",
        }
    }
}

/// The normalized five-field event shape carried on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Which family of event this is.
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Emission time in milliseconds since the epoch. Display only;
    /// ordering is positional.
    pub timestamp_ms: i64,

    /// Name of the emitting node, or a marker like `engine`.
    pub node: String,

    /// Event name within the type (e.g. `web_search_url`).
    pub event: String,

    /// Event-specific payload. Opaque to the bus.
    pub payload: Value,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl Envelope {
    /// A trace event attributed to `node`.
    pub fn trace(kind: TraceKind, node: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: EventType::Trace,
            timestamp_ms: now_ms(),
            node: node.into(),
            event: kind.as_str().to_string(),
            payload,
        }
    }

    /// A custom progress event attributed to `node`.
    pub fn custom(event: impl Into<String>, node: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: EventType::Custom,
            timestamp_ms: now_ms(),
            node: node.into(),
            event: event.into(),
            payload,
        }
    }

    /// A state snapshot for the configured state-update field set.
    pub fn state_update(node: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: EventType::StateUpdate,
            timestamp_ms: now_ms(),
            node: node.into(),
            event: "state_update".to_string(),
            payload,
        }
    }

    /// A run-level system marker.
    pub fn system(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: EventType::System,
            timestamp_ms: now_ms(),
            node: "engine".to_string(),
            event: event.into(),
            payload,
        }
    }

    /// The terminal failure envelope.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Error,
            timestamp_ms: now_ms(),
            node: "engine".to_string(),
            event: "error".to_string(),
            payload: json!({"error": message.into()}),
        }
    }

    /// The terminal success envelope carrying the final response.
    pub fn complete(response: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Complete,
            timestamp_ms: now_ms(),
            node: "engine".to_string(),
            event: "complete".to_string(),
            payload: json!({"response": response.into()}),
        }
    }

    /// Normalize a possibly legacy-shaped value into an envelope.
    ///
    /// Missing `timestamp_ms` and `node` are filled; values that are not
    /// envelope-shaped at all become `custom/event` envelopes wrapping
    /// the original value as payload.
    pub fn from_value(value: Value) -> Self {
        if let Ok(envelope) = serde_json::from_value::<Envelope>(value.clone()) {
            return envelope;
        }

        if let Some(obj) = value.as_object() {
            let event_type = obj
                .get("type")
                .and_then(|t| serde_json::from_value::<EventType>(t.clone()).ok())
                .unwrap_or(EventType::Custom);
            let timestamp_ms = obj
                .get("timestamp_ms")
                .and_then(Value::as_i64)
                .unwrap_or_else(now_ms);
            let node = obj
                .get("node")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let event = obj
                .get("event")
                .and_then(Value::as_str)
                .unwrap_or("event")
                .to_string();
            let payload = obj.get("payload").cloned().unwrap_or(Value::Null);
            return Self {
                event_type,
                timestamp_ms,
                node,
                event,
                payload,
            };
        }

        Self {
            event_type: EventType::Custom,
            timestamp_ms: now_ms(),
            node: "unknown".to_string(),
            event: "event".to_string(),
            payload: value,
        }
    }

    /// Whether this is a trace envelope the collector should retain.
    pub fn is_trace(&self) -> bool {
        self.event_type == EventType::Trace
    }
}

/// One item on the per-run bus.
#[derive(Debug, Clone)]
pub enum EngineOutput {
    /// A normalized event envelope.
    Event(Envelope),

    /// The partial update a node just had applied through the reducers.
    Updates {
        /// Node the update came from.
        node: String,
        /// The partial update as returned by the node.
        update: Value,
    },

    /// Terminal item on successful runs only: the final graph state.
    /// Consumed by the orchestrator for finalization; never forwarded
    /// to clients.
    Done(Value),
}

/// Sending half of the per-run bus handed to nodes.
///
/// Cloned freely into fan-out branches. Sends suspend when the buffer is
/// full; when the receiving side is gone (consumer stopped reading) the
/// event is silently discarded and the engine stops scheduling at the
/// next safe point.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<EngineOutput>,
}

impl EventSink {
    /// Wrap a bus sender.
    pub fn new(tx: mpsc::Sender<EngineOutput>) -> Self {
        Self { tx }
    }

    /// Publish an envelope, normalizing nothing: the type system already
    /// guarantees the shape.
    pub async fn send(&self, envelope: Envelope) {
        let _ = self.tx.send(EngineOutput::Event(envelope)).await;
    }

    /// Publish a legacy-shaped value after normalization.
    pub async fn send_value(&self, value: Value) {
        self.send(Envelope::from_value(value)).await;
    }

    /// Publish a raw engine output. Engine-internal.
    pub(crate) async fn send_output(&self, output: EngineOutput) {
        let _ = self.tx.send(output).await;
    }

    /// Whether the consumer has stopped reading.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_fill_all_five_fields() {
        let envelope = Envelope::custom("supervisor_decision", "supervisor", json!({"d": 1}));
        assert_eq!(envelope.event_type, EventType::Custom);
        assert!(envelope.timestamp_ms > 0);
        assert_eq!(envelope.node, "supervisor");
        assert_eq!(envelope.event, "supervisor_decision");
        assert_eq!(envelope.payload, json!({"d": 1}));
    }

    #[test]
    fn serializes_type_with_wire_name() {
        let envelope = Envelope::state_update("supervisor", json!({"iterations": 1}));
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["type"], "state_update");
        assert_eq!(wire["event"], "state_update");
    }

    #[test]
    fn normalizes_legacy_shape_with_missing_fields() {
        let legacy = json!({"type": "custom", "event": "search_start", "payload": {"query": "q"}});
        let envelope = Envelope::from_value(legacy);
        assert_eq!(envelope.event_type, EventType::Custom);
        assert_eq!(envelope.event, "search_start");
        assert_eq!(envelope.node, "unknown");
        assert!(envelope.timestamp_ms > 0);
    }

    #[test]
    fn normalizes_bare_value_to_custom() {
        let envelope = Envelope::from_value(json!("just a string"));
        assert_eq!(envelope.event_type, EventType::Custom);
        assert_eq!(envelope.payload, json!("just a string"));
    }

    #[test]
    fn complete_and_error_payload_shapes() {
        let done = Envelope::complete("the answer");
        assert_eq!(done.payload, json!({"response": "the answer"}));

        let failed = Envelope::error("driver exploded");
        assert_eq!(failed.payload, json!({"error": "driver exploded"}));
    }

    #[tokio::test]
    async fn sink_discards_after_consumer_drops() {
        let (tx, rx) = mpsc::channel(4);
        let sink = EventSink::new(tx);
        drop(rx);
        // Must not panic or block.
        sink.send(Envelope::system("thread_id", json!({}))).await;
        assert!(sink.is_closed());
    }
}
