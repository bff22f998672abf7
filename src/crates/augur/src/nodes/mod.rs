//! Node implementations for the three graphs.
//!
//! Every node is produced by a factory that captures its driver and
//! store handles in an `Arc`, so a compiled graph owns its dependencies
//! explicitly. Nodes follow one error discipline: emit a single
//! `custom/error` event, then let the typed error propagate to the
//! engine.

pub mod market;
pub mod report;
pub mod researcher;
pub mod summarize;
pub mod supervisor;

use graphflow_core::{GraphError, NodeContext};

/// Emit the node's one `custom/error` event and hand back the error for
/// propagation.
pub(crate) async fn fail(ctx: &NodeContext, err: impl Into<GraphError>) -> GraphError {
    let err = err.into();
    ctx.emit_failure(&err.envelope_message()).await;
    err
}
