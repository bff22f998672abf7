//! Per-run context handed to nodes.
//!
//! Nodes receive their services through a [`NodeContext`] argument
//! rather than through module-level globals: the event sink, the
//! cancellation token, and the thread key all travel with the call.

use serde_json::Value;
use tokio::sync::watch;

use crate::event::{Envelope, EventSink, TraceKind};
use crate::graph::NodeId;

/// Create a linked cancellation handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx: Some(rx) })
}

/// Owner side of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation. In-flight nodes run to completion; the
    /// engine stops scheduling at the next safe point.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observer side of a cancellation signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelToken {
    /// A token that never fires. Used for tests and fire-and-forget runs.
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }
}

/// Services available to a node during one invocation.
#[derive(Clone)]
pub struct NodeContext {
    /// Name of the executing node.
    pub node: NodeId,

    /// Thread the run belongs to.
    pub thread_id: String,

    /// The per-run event bus.
    pub events: EventSink,

    /// Cancellation signal for the request.
    pub cancel: CancelToken,
}

impl NodeContext {
    /// Publish a trace event attributed to this node.
    pub async fn emit_trace(&self, kind: TraceKind, payload: Value) {
        self.events.send(Envelope::trace(kind, &self.node, payload)).await;
    }

    /// Publish a custom progress event attributed to this node.
    pub async fn emit_custom(&self, event: &str, payload: Value) {
        self.events.send(Envelope::custom(event, &self.node, payload)).await;
    }

    /// Publish the single `custom/error` event a node emits before
    /// letting its failure propagate.
    pub async fn emit_failure(&self, message: &str) {
        self.emit_custom("error", serde_json::json!({"error": message})).await;
    }

    /// Whether the request was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_pair_links_handle_and_token() {
        let (handle, token) = cancel_pair();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn never_token_stays_quiet() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
    }
}
