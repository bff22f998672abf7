//! Main-graph assembly and routing policy.

use serde_json::Value;
use std::sync::Arc;

use drivers::{ChatModel, MarketCatalog, SearchProvider};
use graphflow_checkpoint::CheckpointSaver;
use graphflow_core::{CompiledGraph, Result, RouteResult, StateGraph, END};

use crate::config::Settings;
use crate::nodes::market::{build_market_graph, call_market_research_node};
use crate::nodes::report::{
    clarification_node, direct_answer_node, final_report_node, market_blurb_node,
};
use crate::nodes::researcher::{build_researcher_graph, call_researcher_node, UrlDeduper};
use crate::nodes::summarize::summarize_node;
use crate::nodes::supervisor::supervisor_node;
use crate::state::{fields, supervisor_schema, CLARIFY_PREFIX, FINISH};
use crate::store::MessageStore;

/// Everything the main graph needs to own.
pub struct GraphDeps {
    pub llm: Arc<dyn ChatModel>,
    pub name_llm: Arc<dyn ChatModel>,
    pub search: Arc<dyn SearchProvider>,
    pub catalog: Arc<dyn MarketCatalog>,
    pub store: Arc<dyn MessageStore>,
    pub checkpointer: Arc<dyn CheckpointSaver>,
    pub url_dedup: UrlDeduper,
    pub settings: Settings,
}

/// Build the main (supervisor) graph with both subgraphs wired in.
pub fn build_main_graph(deps: &GraphDeps) -> Result<CompiledGraph> {
    let researcher = build_researcher_graph(
        deps.llm.clone(),
        deps.search.clone(),
        deps.checkpointer.clone(),
    )?;
    let market = build_market_graph(
        deps.llm.clone(),
        deps.catalog.clone(),
        deps.settings.market_fallback,
        deps.checkpointer.clone(),
    )?;

    let mut graph = StateGraph::new(supervisor_schema(deps.settings.history_cap));

    graph.add_node(
        "supervisor",
        supervisor_node(
            deps.llm.clone(),
            deps.name_llm.clone(),
            deps.store.clone(),
            deps.settings.iteration_cap,
        ),
    );
    graph.add_node(
        "call_researcher",
        call_researcher_node(researcher, deps.url_dedup.clone()),
    );
    graph.add_node("final_report", final_report_node(deps.llm.clone()));
    graph.add_node("direct_answer", direct_answer_node(deps.llm.clone()));
    graph.add_node("clarification", clarification_node());
    graph.add_node("call_market_research", call_market_research_node(market));
    graph.add_node("rewrite_market_blurb", market_blurb_node(deps.llm.clone()));
    graph.add_node("summarize_conversation", summarize_node(deps.llm.clone()));

    graph.set_entry("supervisor");
    graph.add_conditional_edge("supervisor", route_from_supervisor);
    graph.add_edge("call_researcher", "supervisor");
    graph.add_edge("final_report", "call_market_research");
    graph.add_edge("call_market_research", "rewrite_market_blurb");
    graph.add_edge("rewrite_market_blurb", "summarize_conversation");
    graph.add_edge("direct_answer", "summarize_conversation");
    graph.add_edge("clarification", "summarize_conversation");
    graph.add_edge("summarize_conversation", END);

    // Backstop on supervisor re-entries; the node itself also forces a
    // finish decision at the same bound.
    graph.add_visit_cap(
        "supervisor",
        deps.settings.iteration_cap as usize,
        "final_report",
    );

    for field in [
        fields::RESEARCH_NOTES,
        fields::ITERATIONS,
        fields::FINAL_REPORT,
        fields::APPROVED_MARKETS,
        fields::POLYMARKET_BLURB,
    ] {
        graph.add_state_update_field(field);
    }
    graph.set_completion_field(fields::FINAL_REPORT);

    Ok(graph.compile()?.with_checkpointer(deps.checkpointer.clone()))
}

/// Routing policy out of the supervisor.
fn route_from_supervisor(state: &Value) -> RouteResult {
    let next_topic = state[fields::NEXT_TOPIC].as_str().unwrap_or("");

    if next_topic.starts_with(CLARIFY_PREFIX) {
        return "clarification".into();
    }
    if next_topic == FINISH {
        let has_notes = state[fields::RESEARCH_NOTES]
            .as_array()
            .map(|notes| !notes.is_empty())
            .unwrap_or(false);
        let wants_report = state[fields::ANSWER_FORMAT].as_str() == Some("report");
        return if has_notes || wants_report {
            "final_report".into()
        } else {
            "direct_answer".into()
        };
    }
    "call_researcher".into()
}
