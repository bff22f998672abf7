//! Terminal answer nodes: final report, direct answer, clarification,
//! and the market-blurb rewrite.
//!
//! All three terminal nodes write `final_report`, append the user and
//! assistant turns to `conversation_history`, and return their closing
//! trace event in `execution_trace` (the collector captures it from the
//! update even if the run ends before the bus drains). Actual message
//! persistence happens in the orchestrator's finalization phase.

use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::sync::Arc;

use drivers::ChatModel;
use graphflow_core::{Envelope, GraphError, NodeContext, Result, TraceKind};

use crate::nodes::fail;
use crate::prompts;
use crate::state::{fields, HistoryEntry, SupervisorState};

/// Build the final-report node. Uses the refinement prompt for revised
/// reports (`current_report_version >= 1`) and the format instruction
/// matching `answer_format`.
pub fn final_report_node(
    llm: Arc<dyn ChatModel>,
) -> impl Fn(NodeContext, Value) -> BoxFuture<'static, Result<Value>> {
    move |ctx, value| {
        let llm = llm.clone();
        Box::pin(async move {
            let state = SupervisorState::from_value(&value)?;
            ctx.emit_trace(TraceKind::NodeCall, json!({"node": "final_report"})).await;
            ctx.emit_custom("writing_report", json!({})).await;

            let refine = state.current_report_version >= 1;
            let report = match llm.complete(&prompts::final_report(&state, refine)).await {
                Ok(report) => report,
                Err(err) => return Err(fail(&ctx, err).await),
            };

            ctx.emit_custom("final_report_complete", json!({"report": &report})).await;
            let mut update =
                terminal_update(&ctx, &state.user_request, report, "final_report_complete")?;
            // A produced report bumps the revision; the next run's
            // refinement prompt keys off it.
            update[fields::CURRENT_REPORT_VERSION] = json!(state.current_report_version + 1);
            Ok(update)
        })
    }
}

/// Build the direct-answer node: answers from the conversation summary
/// alone, no research involved.
pub fn direct_answer_node(
    llm: Arc<dyn ChatModel>,
) -> impl Fn(NodeContext, Value) -> BoxFuture<'static, Result<Value>> {
    move |ctx, value| {
        let llm = llm.clone();
        Box::pin(async move {
            let state = SupervisorState::from_value(&value)?;
            ctx.emit_trace(TraceKind::NodeCall, json!({"node": "direct_answer"})).await;

            let answer = match llm.complete(&prompts::direct_answer(&state)).await {
                Ok(answer) => answer,
                Err(err) => return Err(fail(&ctx, err).await),
            };

            terminal_update(&ctx, &state.user_request, answer, "direct_answer_complete")
        })
    }
}

/// Build the clarification node: surfaces the question parsed out of
/// `next_topic` as the assistant turn.
pub fn clarification_node() -> impl Fn(NodeContext, Value) -> BoxFuture<'static, Result<Value>> {
    move |ctx, value| {
        Box::pin(async move {
            let state = SupervisorState::from_value(&value)?;
            ctx.emit_trace(TraceKind::NodeCall, json!({"node": "clarification"})).await;

            let question = match state.clarify_question() {
                Some(q) if !q.is_empty() => q.to_string(),
                Some(_) => "Could you clarify what you would like me to look into?".to_string(),
                None => {
                    return Err(fail(
                        &ctx,
                        GraphError::Precondition(
                            "clarification node reached without a clarify topic".to_string(),
                        ),
                    )
                    .await)
                }
            };

            terminal_update(&ctx, &state.user_request, question, "clarification_complete")
        })
    }
}

/// Build the market-blurb rewrite node: a short paragraph tying the
/// approved markets back to the report.
pub fn market_blurb_node(
    llm: Arc<dyn ChatModel>,
) -> impl Fn(NodeContext, Value) -> BoxFuture<'static, Result<Value>> {
    move |ctx, value| {
        let llm = llm.clone();
        Box::pin(async move {
            let state = SupervisorState::from_value(&value)?;
            ctx.emit_trace(TraceKind::NodeCall, json!({"node": "rewrite_market_blurb"})).await;

            if state.prediction_markets.is_empty() {
                return Ok(json!({}));
            }

            let blurb = match llm
                .complete(&prompts::market_blurb(&state.final_report, &state.prediction_markets))
                .await
            {
                Ok(blurb) => blurb,
                Err(err) => return Err(fail(&ctx, err).await),
            };

            Ok(json!({ "polymarket_blurb": blurb }))
        })
    }
}

/// Common return shape of the three terminal nodes.
fn terminal_update(
    ctx: &NodeContext,
    user_request: &str,
    answer: String,
    closing_event: &str,
) -> Result<Value> {
    let closing = Envelope::trace(
        TraceKind::Custom,
        &ctx.node,
        json!({"event": closing_event, "response": &answer}),
    );
    let closing = serde_json::to_value(closing)
        .map_err(|e| GraphError::Internal(format!("closing trace: {e}")))?;
    let history = [HistoryEntry::user(user_request), HistoryEntry::assistant(&answer)];

    Ok(json!({
        "final_report": answer,
        "conversation_history": history,
        "execution_trace": [closing],
    }))
}
