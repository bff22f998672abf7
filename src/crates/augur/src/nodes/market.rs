//! The market-research subgraph and the parent node that drives it.
//!
//! Four strictly sequential stages: select catalog tags with the model
//! over paginated batches, fetch and flatten the markets filed under
//! them, rank by slug, then approve a subset. The model only ever sees
//! slugs and questions; full market objects are rehydrated from
//! `raw_events` by slug lookup so no field is lost in transit. Approved
//! markets are enriched with recent price history where token ids allow.

use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_stream::StreamExt;

use drivers::{ChatModel, Market, MarketCatalog, Tag};
use graphflow_checkpoint::CheckpointSaver;
use graphflow_core::{
    CompiledGraph, EngineOutput, EventType, GraphError, NodeContext, Result, RunConfig,
    StateGraph, TraceKind, END,
};

use crate::nodes::fail;
use crate::prompts;
use crate::state::{fields, market_schema, MarketResearchState, SupervisorState};

/// Checkpoint namespace of the market-research subgraph.
pub const MARKET_NS: &str = "market_research";

/// Tags fetched per catalog page.
const TAG_PAGE_SIZE: usize = 20;

/// Distinct tag ids accumulated at most.
const MAX_TAGS: usize = 10;

/// Hard bound on pagination, independent of the model's appetite.
const MAX_TAG_PAGES: usize = 25;

/// Build the market-research subgraph.
pub fn build_market_graph(
    llm: Arc<dyn ChatModel>,
    catalog: Arc<dyn MarketCatalog>,
    fallback: usize,
    checkpointer: Arc<dyn CheckpointSaver>,
) -> Result<CompiledGraph> {
    let mut graph = StateGraph::new(market_schema());

    let tag_llm = llm.clone();
    let tag_catalog = catalog.clone();
    graph.add_node("generate_market_queries", move |ctx: NodeContext, value: Value| {
        let llm = tag_llm.clone();
        let catalog = tag_catalog.clone();
        async move {
            let state = MarketResearchState::from_value(&value)?;
            ctx.emit_trace(TraceKind::NodeCall, json!({"node": "generate_market_queries"})).await;

            let mut selected: Vec<Tag> = Vec::new();
            let mut offset = 0;
            for _ in 0..MAX_TAG_PAGES {
                let batch = match catalog.fetch_tags(offset, TAG_PAGE_SIZE).await {
                    Ok(batch) => batch,
                    Err(err) => return Err(fail(&ctx, err).await),
                };
                if batch.is_empty() {
                    break;
                }

                let raw = match llm
                    .complete_structured(
                        &prompts::select_tags(&state.original_topic, &batch),
                        &prompts::tags_schema(),
                    )
                    .await
                {
                    Ok(raw) => raw,
                    Err(err) => return Err(fail(&ctx, err).await),
                };

                // Names come back free-form; match case-insensitively to
                // recover the ids from the batch.
                for name in raw["selected_tags"].as_array().into_iter().flatten() {
                    let Some(name) = name.as_str() else { continue };
                    let found = batch
                        .iter()
                        .find(|tag| tag.name.eq_ignore_ascii_case(name.trim()));
                    if let Some(tag) = found {
                        if !selected.iter().any(|s| s.id == tag.id) {
                            selected.push(tag.clone());
                        }
                    }
                }

                if selected.len() >= MAX_TAGS {
                    selected.truncate(MAX_TAGS);
                    break;
                }
                if !raw["continue_search"].as_bool().unwrap_or(false) {
                    break;
                }
                offset += TAG_PAGE_SIZE;
            }

            ctx.emit_custom("tag_selected", json!({"tags": &selected})).await;
            Ok(json!({ "selected_tags": selected }))
        }
    });

    let fetch_catalog = catalog.clone();
    graph.add_node("fetch_markets", move |ctx: NodeContext, value: Value| {
        let catalog = fetch_catalog.clone();
        async move {
            let state = MarketResearchState::from_value(&value)?;
            ctx.emit_trace(TraceKind::NodeCall, json!({"node": "fetch_markets"})).await;

            let mut markets: Vec<Market> = Vec::new();
            let mut seen_slugs: HashSet<String> = HashSet::new();
            for tag in &state.selected_tags {
                let events = match catalog.fetch_events_by_tag_id(&tag.id).await {
                    Ok(events) => events,
                    Err(err) => return Err(fail(&ctx, err).await),
                };
                for event in events {
                    for mut market in event.markets {
                        if market.slug.is_empty() || !seen_slugs.insert(market.slug.clone()) {
                            continue;
                        }
                        market.event_title = Some(event.title.clone());
                        market.event_slug = Some(event.slug.clone());
                        market.event_image = event.image.clone();
                        markets.push(market);
                    }
                }
            }

            ctx.emit_trace(
                TraceKind::Search,
                json!({"tags": state.selected_tags.len(), "markets": markets.len()}),
            )
            .await;
            Ok(json!({ "raw_events": markets }))
        }
    });

    let rank_llm = llm.clone();
    graph.add_node("process_and_rank_markets", move |ctx: NodeContext, value: Value| {
        let llm = rank_llm.clone();
        async move {
            let state = MarketResearchState::from_value(&value)?;
            ctx.emit_trace(TraceKind::NodeCall, json!({"node": "process_and_rank_markets"})).await;

            if state.raw_events.is_empty() {
                return Ok(json!({
                    "candidate_markets": [],
                    "reasoning_trace": ["no markets found under the selected tags"],
                }));
            }

            let raw = match llm
                .complete_structured(
                    &prompts::rank_markets(&state.original_topic, &state.ai_response, &state.raw_events),
                    &prompts::rank_schema(),
                )
                .await
            {
                Ok(raw) => raw,
                Err(err) => return Err(fail(&ctx, err).await),
            };
            let reasoning = raw["reasoning"].as_str().unwrap_or_default().to_string();

            let mut candidates =
                rehydrate_by_slug(&state.raw_events, raw["ranked_slugs"].as_array());
            if candidates.is_empty() {
                candidates = state.raw_events.iter().take(fallback).cloned().collect();
            }

            Ok(json!({
                "candidate_markets": candidates,
                "reasoning_trace": [reasoning],
            }))
        }
    });

    let eval_llm = llm.clone();
    let eval_catalog = catalog.clone();
    graph.add_node("evaluate_markets", move |ctx: NodeContext, value: Value| {
        let llm = eval_llm.clone();
        let catalog = eval_catalog.clone();
        async move {
            let state = MarketResearchState::from_value(&value)?;
            ctx.emit_trace(TraceKind::NodeCall, json!({"node": "evaluate_markets"})).await;

            if state.candidate_markets.is_empty() {
                ctx.emit_custom(
                    "market_research_complete",
                    json!({"reasoning": "no candidate markets to evaluate"}),
                )
                .await;
                return Ok(json!({
                    "approved_markets": [],
                    "reasoning_trace": ["no candidate markets to evaluate"],
                }));
            }

            let raw = match llm
                .complete_structured(
                    &prompts::evaluate_markets(&state.original_topic, &state.candidate_markets),
                    &prompts::evaluate_schema(),
                )
                .await
            {
                Ok(raw) => raw,
                Err(err) => return Err(fail(&ctx, err).await),
            };
            let reasoning = raw["reasoning"].as_str().unwrap_or_default().to_string();

            let mut approved =
                rehydrate_by_slug(&state.candidate_markets, raw["approved_slugs"].as_array());
            if approved.is_empty() {
                approved = state.candidate_markets.iter().take(fallback).cloned().collect();
            }

            for market in &mut approved {
                enrich_price_history(&*catalog, market).await;
                ctx.emit_custom(
                    "market_approved",
                    json!({
                        "slug": &market.slug,
                        "clobTokenIds": &market.clob_token_ids,
                        "question": &market.question,
                        "description": &market.description,
                        "rules": &market.rules,
                    }),
                )
                .await;
            }

            ctx.emit_custom("market_research_complete", json!({"reasoning": &reasoning})).await;
            Ok(json!({
                "approved_markets": approved,
                "reasoning_trace": [reasoning],
            }))
        }
    });

    graph.set_entry("generate_market_queries");
    graph.add_edge("generate_market_queries", "fetch_markets");
    graph.add_edge("fetch_markets", "process_and_rank_markets");
    graph.add_edge("process_and_rank_markets", "evaluate_markets");
    graph.add_edge("evaluate_markets", END);

    Ok(graph.compile()?.with_checkpointer(checkpointer))
}

/// Look slugs back up in `pool`, preserving the model's order and
/// dropping hallucinated slugs.
fn rehydrate_by_slug(pool: &[Market], slugs: Option<&Vec<Value>>) -> Vec<Market> {
    let mut out = Vec::new();
    for slug in slugs.into_iter().flatten() {
        let Some(slug) = slug.as_str() else { continue };
        if out.iter().any(|m: &Market| m.slug == slug) {
            continue;
        }
        if let Some(market) = pool.iter().find(|m| m.slug == slug) {
            out.push(market.clone());
        }
    }
    out
}

/// Attach recent price points for the market's first outcome token.
/// Tolerant: a market without usable token ids, or a failing price
/// endpoint, just stays unenriched.
async fn enrich_price_history(catalog: &dyn MarketCatalog, market: &mut Market) {
    let Some(token_id) = first_token_id(market.clob_token_ids.as_ref()) else {
        return;
    };
    match catalog.fetch_price_history(&token_id, "1w", 60).await {
        Ok(history) if !history.is_empty() => market.price_history = Some(history),
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(slug = %market.slug, error = %err, "price-history enrichment failed");
        }
    }
}

/// Token ids arrive either as a JSON array or as a string containing
/// one; take the first entry either way.
fn first_token_id(value: Option<&Value>) -> Option<String> {
    let value = value?;
    let array = match value {
        Value::Array(items) => Some(items.clone()),
        Value::String(s) => serde_json::from_str::<Vec<Value>>(s).ok(),
        _ => None,
    }?;
    array.first()?.as_str().map(str::to_string)
}

/// Build the parent `call_market_research` node around a compiled
/// market subgraph.
pub fn call_market_research_node(
    market: CompiledGraph,
) -> impl Fn(NodeContext, Value) -> BoxFuture<'static, Result<Value>> {
    move |ctx, value| {
        let market = market.clone();
        Box::pin(async move {
            let state = SupervisorState::from_value(&value)?;
            ctx.emit_trace(TraceKind::NodeCall, json!({"node": "call_market_research"})).await;

            let child_state = serde_json::to_value(MarketResearchState {
                original_topic: state.user_request.clone(),
                ai_response: state.final_report.clone(),
                ..Default::default()
            })
            .map_err(|e| GraphError::Internal(format!("market seed: {e}")))?;

            let mut stream = market.run(
                child_state,
                RunConfig::new(&ctx.thread_id)
                    .with_namespace(MARKET_NS)
                    .with_cancel(ctx.cancel.clone()),
            );

            let mut approved = Value::Array(Vec::new());
            let mut child_error: Option<String> = None;
            while let Some(output) = stream.next().await {
                match output {
                    EngineOutput::Event(envelope) => match envelope.event_type {
                        EventType::Custom | EventType::Trace => ctx.events.send(envelope).await,
                        EventType::Error => {
                            child_error = Some(
                                envelope.payload["error"]
                                    .as_str()
                                    .unwrap_or("market subgraph failed")
                                    .to_string(),
                            );
                        }
                        _ => {}
                    },
                    EngineOutput::Done(final_state) => {
                        approved = final_state[fields::APPROVED_MARKETS].clone();
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

            // `approved_markets` mirrors the list for the streamed
            // state-update vocabulary; `prediction_markets` is the typed
            // supervisor field.
            Ok(json!({
                "prediction_markets": approved.clone(),
                "approved_markets": approved,
            }))
        })
    }
}
