//! The researcher subgraph and the parent node that drives it.
//!
//! Subgraph shape: `generate_queries` fans out to one `perform_search`
//! branch per query, and `synthesize_research` folds every branch's
//! results into one markdown note. The parent `call_researcher` node
//! streams the subgraph, forwards its custom and trace envelopes onto
//! the parent bus, deduplicates `web_search_url` events per run, and
//! appends the summary to the parent's `research_notes`.

use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio_stream::StreamExt;

use drivers::{ChatModel, SearchProvider};
use graphflow_checkpoint::CheckpointSaver;
use graphflow_core::{
    CompiledGraph, EngineOutput, EventType, GraphError, NodeContext, Result, RouteResult,
    RunConfig, Send as BranchSend, StateGraph, TraceKind, END,
};

use crate::nodes::fail;
use crate::prompts;
use crate::state::{researcher_schema, ResearcherState, SearchResultEntry, SupervisorState};

/// Checkpoint namespace of the researcher subgraph.
pub const RESEARCHER_NS: &str = "researcher";

/// Per-run `web_search_url` deduplication, keyed by thread. The
/// orchestrator resets a thread's set at run start; dedup then spans
/// every research cycle within that run.
#[derive(Clone, Default)]
pub struct UrlDeduper {
    seen: Arc<Mutex<HashMap<String, HashSet<String>>>>,
}

impl UrlDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget a thread's URLs at the start of a run.
    pub fn begin_run(&self, thread_id: &str) {
        self.seen.lock().unwrap().remove(thread_id);
    }

    /// Record a URL; returns false when it was already seen this run.
    fn insert(&self, thread_id: &str, url: &str) -> bool {
        self.seen
            .lock()
            .unwrap()
            .entry(thread_id.to_string())
            .or_default()
            .insert(url.to_string())
    }
}

/// Build the researcher subgraph.
pub fn build_researcher_graph(
    llm: Arc<dyn ChatModel>,
    search: Arc<dyn SearchProvider>,
    checkpointer: Arc<dyn CheckpointSaver>,
) -> Result<CompiledGraph> {
    let mut graph = StateGraph::new(researcher_schema());

    let query_llm = llm.clone();
    graph.add_node("generate_queries", move |ctx: NodeContext, value: Value| {
        let llm = query_llm.clone();
        async move {
            let state = ResearcherState::from_value(&value)?;
            let target = state.query_breadth.max(1);
            ctx.emit_trace(TraceKind::NodeCall, json!({"node": "generate_queries"})).await;

            let raw = match llm
                .complete_structured(
                    &prompts::generate_queries(&state.topic, target),
                    &prompts::queries_schema(),
                )
                .await
            {
                Ok(raw) => raw,
                Err(err) => return Err(fail(&ctx, err).await),
            };

            let mut queries: Vec<String> = Vec::new();
            for query in raw["queries"].as_array().into_iter().flatten() {
                if let Some(q) = query.as_str().map(str::trim).filter(|q| !q.is_empty()) {
                    if !queries.iter().any(|seen| seen.eq_ignore_ascii_case(q)) {
                        queries.push(q.to_string());
                    }
                }
            }
            if queries.is_empty() {
                queries.push(state.topic.clone());
            }
            queries.truncate(target);

            ctx.emit_custom("generated_queries", json!({"queries": &queries})).await;
            Ok(json!({ "queries": queries }))
        }
    });

    let branch_search = search.clone();
    graph.add_node("perform_search", move |ctx: NodeContext, value: Value| {
        let search = branch_search.clone();
        async move {
            let query = value["query"].as_str().unwrap_or_default().to_string();
            let breadth = value["query_breadth"].as_u64().unwrap_or(2) as usize;

            ctx.emit_custom("search_start", json!({"query": &query})).await;
            let hits = match search.search(&query, breadth).await {
                Ok(hits) => hits,
                Err(err) => return Err(fail(&ctx, err).await),
            };

            let mut entries = Vec::with_capacity(hits.len());
            for hit in &hits {
                ctx.emit_custom(
                    "web_search_url",
                    json!({
                        "url": &hit.url,
                        "markdown": format!("[{}]({})", hit.title, hit.url),
                    }),
                )
                .await;
                entries.push(SearchResultEntry {
                    query: query.clone(),
                    url: hit.url.clone(),
                    title: hit.title.clone(),
                    content: hit.content.clone(),
                });
            }
            ctx.emit_trace(
                TraceKind::Search,
                json!({
                    "query": &query,
                    "urls": hits.iter().map(|h| h.url.as_str()).collect::<Vec<_>>(),
                }),
            )
            .await;

            Ok(json!({ "search_results": entries }))
        }
    });

    let synth_llm = llm.clone();
    graph.add_node("synthesize_research", move |ctx: NodeContext, value: Value| {
        let llm = synth_llm.clone();
        async move {
            let state = ResearcherState::from_value(&value)?;
            let formatted = state
                .search_results
                .iter()
                .map(|r| format!("- [{}]({}): {}", r.title, r.url, r.content))
                .collect::<Vec<_>>()
                .join("\n");

            let summary = match llm.complete(&prompts::synthesize(&state.topic, &formatted)).await {
                Ok(summary) => summary,
                Err(err) => return Err(fail(&ctx, err).await),
            };

            ctx.emit_custom("research_synthesis_done", json!({"summary": &summary})).await;
            Ok(json!({ "research_summary": summary }))
        }
    });

    graph.set_entry("generate_queries");
    graph.add_conditional_edge("generate_queries", |state: &Value| {
        let breadth = state["query_breadth"].as_u64().unwrap_or(2);
        let sends: Vec<BranchSend> = state["queries"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .map(|query| {
                BranchSend::new(
                    "perform_search",
                    json!({"query": query, "query_breadth": breadth}),
                )
            })
            .collect();
        if sends.is_empty() {
            // generate_queries guarantees at least one query; nothing to
            // search means nothing to synthesize.
            RouteResult::Next(END.to_string())
        } else {
            RouteResult::Sends(sends)
        }
    });
    graph.add_edge("perform_search", "synthesize_research");
    graph.add_edge("synthesize_research", END);

    Ok(graph.compile()?.with_checkpointer(checkpointer))
}

/// Build the parent `call_researcher` node around a compiled researcher
/// subgraph.
pub fn call_researcher_node(
    researcher: CompiledGraph,
    dedup: UrlDeduper,
) -> impl Fn(NodeContext, Value) -> BoxFuture<'static, Result<Value>> {
    move |ctx, value| {
        let researcher = researcher.clone();
        let dedup = dedup.clone();
        Box::pin(async move {
            let state = SupervisorState::from_value(&value)?;
            let topic = state.next_topic.clone();
            let breadth = state.answer_format.query_breadth();

            ctx.emit_trace(
                TraceKind::NodeCall,
                json!({"node": "call_researcher", "topic": &topic, "query_breadth": breadth}),
            )
            .await;

            let child_state = serde_json::to_value(ResearcherState {
                topic: topic.clone(),
                query_breadth: breadth,
                ..Default::default()
            })
            .map_err(|e| GraphError::Internal(format!("researcher seed: {e}")))?;

            let mut stream = researcher.run(
                child_state,
                RunConfig::new(&ctx.thread_id)
                    .with_namespace(RESEARCHER_NS)
                    .with_cancel(ctx.cancel.clone()),
            );

            let mut summary: Option<String> = None;
            let mut child_error: Option<String> = None;
            while let Some(output) = stream.next().await {
                match output {
                    EngineOutput::Event(envelope) => match envelope.event_type {
                        EventType::Custom => {
                            if envelope.event == "web_search_url" {
                                let url = envelope.payload["url"].as_str().unwrap_or_default();
                                if !dedup.insert(&ctx.thread_id, url) {
                                    continue;
                                }
                            }
                            ctx.events.send(envelope).await;
                        }
                        EventType::Trace => ctx.events.send(envelope).await,
                        EventType::Error => {
                            child_error = Some(
                                envelope.payload["error"]
                                    .as_str()
                                    .unwrap_or("researcher subgraph failed")
                                    .to_string(),
                            );
                        }
                        // Subgraph state updates and terminal markers are
                        // not forwarded; only the parent's own return is.
                        _ => {}
                    },
                    EngineOutput::Done(final_state) => {
                        summary = final_state["research_summary"].as_str().map(str::to_string);
                    }
                    EngineOutput::Updates { .. } => {}
                }
            }

            if let Some(message) = child_error {
                return Err(GraphError::NodeFailed {
                    node: ctx.node.clone(),
                    message,
                });
            }
            if ctx.is_cancelled() {
                return Err(GraphError::Cancelled);
            }
            let summary = summary.unwrap_or_default();

            let note = format!("## {topic}\n\n{summary}");
            Ok(json!({ "research_notes": [note] }))
        })
    }
}
