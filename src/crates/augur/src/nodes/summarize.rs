//! The conversation summarizer.
//!
//! Folds the rolling history into `conversation_summary` and sends the
//! reset signal to the history reducer, so every run ends with an empty
//! history and a summary that covers everything to date.

use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::sync::Arc;

use drivers::ChatModel;
use graphflow_core::{NodeContext, Result, TraceKind};

use crate::nodes::fail;
use crate::prompts;
use crate::state::{SupervisorState, HISTORY_RESET};

/// Build the summarizer node.
pub fn summarize_node(
    llm: Arc<dyn ChatModel>,
) -> impl Fn(NodeContext, Value) -> BoxFuture<'static, Result<Value>> {
    move |ctx, value| {
        let llm = llm.clone();
        Box::pin(async move {
            let state = SupervisorState::from_value(&value)?;
            ctx.emit_trace(TraceKind::NodeCall, json!({"node": "summarize_conversation"})).await;

            if state.conversation_history.is_empty() {
                return Ok(json!({ "conversation_history": HISTORY_RESET }));
            }

            let summary = match llm
                .complete(&prompts::summarize(&state.conversation_history, &state.conversation_summary))
                .await
            {
                Ok(summary) => summary,
                Err(err) => return Err(fail(&ctx, err).await),
            };

            Ok(json!({
                "conversation_summary": summary,
                "conversation_history": HISTORY_RESET,
            }))
        })
    }
}
