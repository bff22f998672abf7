//! The supervisor node: decide the next step from the current state.

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use drivers::ChatModel;
use graphflow_core::{GraphError, NodeContext, Result, TraceKind};

use crate::nodes::fail;
use crate::prompts;
use crate::state::{AnswerFormat, SupervisorState, CLARIFY_PREFIX, FINISH};
use crate::store::MessageStore;

/// Structured decision returned by the supervisor model.
#[derive(Debug, Deserialize)]
struct Decision {
    next_step: String,
    #[serde(default)]
    research_topic: Option<String>,
    reasoning: String,
    #[serde(default)]
    answer_format: Option<AnswerFormat>,
}

/// Build the supervisor node.
///
/// On the first turn of a thread it also generates and persists a
/// thread name (≤ 5 words) before deciding. Once `iterations` reaches
/// `iteration_cap` the decision is forced to `finish` without an LLM
/// call.
pub fn supervisor_node(
    llm: Arc<dyn ChatModel>,
    name_llm: Arc<dyn ChatModel>,
    store: Arc<dyn MessageStore>,
    iteration_cap: u32,
) -> impl Fn(NodeContext, Value) -> BoxFuture<'static, Result<Value>> {
    move |ctx, value| {
        let llm = llm.clone();
        let name_llm = name_llm.clone();
        let store = store.clone();
        Box::pin(async move {
            let state = SupervisorState::from_value(&value)?;
            let iterations = state.iterations + 1;

            ctx.emit_trace(
                TraceKind::NodeCall,
                json!({"node": "supervisor", "iteration": iterations}),
            )
            .await;

            if state.current_report_version == 0 && state.iterations == 0 {
                let name = generate_thread_name(&*name_llm, &state.user_request).await;
                if let Err(err) = store.create_thread(&ctx.thread_id, Some(&name)).await {
                    return Err(fail(
                        &ctx,
                        GraphError::NodeFailed {
                            node: ctx.node.clone(),
                            message: format!("thread creation: {err}"),
                        },
                    )
                    .await);
                }
                ctx.emit_custom(
                    "thread_name",
                    json!({"thread_id": &ctx.thread_id, "name": name}),
                )
                .await;
            }

            let (decision, reasoning, topic, answer_format) = if iterations >= iteration_cap {
                (
                    "finish".to_string(),
                    "Iteration limit reached; composing the answer from gathered notes."
                        .to_string(),
                    None,
                    state.answer_format,
                )
            } else {
                let raw = match llm
                    .complete_structured(&prompts::supervisor(&state), &prompts::supervisor_schema())
                    .await
                {
                    Ok(raw) => raw,
                    Err(err) => return Err(fail(&ctx, err).await),
                };
                let parsed: Decision = match serde_json::from_value(raw) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        return Err(fail(
                            &ctx,
                            GraphError::PermanentDriver(format!("supervisor decision: {err}")),
                        )
                        .await)
                    }
                };
                let format = parsed.answer_format.unwrap_or(state.answer_format);
                (parsed.next_step, parsed.reasoning, parsed.research_topic, format)
            };

            let next_topic = match decision.as_str() {
                "finish" => FINISH.to_string(),
                "clarify" => {
                    let question = topic.as_deref().map(str::trim).unwrap_or("");
                    if question.is_empty() {
                        return Err(fail(
                            &ctx,
                            GraphError::Precondition(
                                "clarification requested with an empty question".to_string(),
                            ),
                        )
                        .await);
                    }
                    format!("{CLARIFY_PREFIX} {question}")
                }
                _ => topic
                    .as_deref()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .unwrap_or(&state.user_request)
                    .to_string(),
            };

            ctx.emit_trace(TraceKind::Reasoning, json!({"reasoning": &reasoning})).await;
            ctx.emit_custom(
                "supervisor_decision",
                json!({
                    "decision": decision,
                    "reasoning": reasoning,
                    "topic": &next_topic,
                }),
            )
            .await;

            Ok(json!({
                "iterations": iterations,
                "next_topic": next_topic,
                "answer_format": answer_format,
            }))
        })
    }
}

/// Name the thread from its first message, tolerating model failure:
/// a bland name beats a dead run.
async fn generate_thread_name(name_llm: &dyn ChatModel, user_request: &str) -> String {
    let raw = match name_llm.complete(&prompts::thread_name(user_request)).await {
        Ok(raw) => raw,
        Err(err) => {
            tracing::warn!(error = %err, "thread-name generation failed, using request prefix");
            user_request.to_string()
        }
    };
    clamp_words(raw.trim().trim_matches('"'), 5)
}

fn clamp_words(s: &str, max_words: usize) -> String {
    let words: Vec<&str> = s.split_whitespace().take(max_words).collect();
    if words.is_empty() {
        "New conversation".to_string()
    } else {
        words.join(" ")
    }
}
