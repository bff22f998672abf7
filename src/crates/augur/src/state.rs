//! Typed graph states and their reducer tables.
//!
//! Graph state travels through the engine as a JSON object; the structs
//! here are the typed views nodes deserialize it into. Each graph's
//! schema function is the authoritative reducer table: append-only
//! fields use concat, `conversation_history` uses the bounded reducer
//! with a reset signal, everything else replaces.

use drivers::{Market, Tag};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use graphflow_core::state::{ConcatReducer, Reducer, StateSchema};
use graphflow_core::{GraphError, Result};

/// Sentinel `next_topic` value: the supervisor is done researching.
pub const FINISH: &str = "FINISH";

/// Prefix marking a clarification request in `next_topic`.
pub const CLARIFY_PREFIX: &str = "CLARIFY:";

/// Reset signal understood by the conversation-history reducer.
pub const HISTORY_RESET: &str = "__reset__";

/// Field names shared between schemas, nodes, and the streaming layer.
pub mod fields {
    pub const USER_REQUEST: &str = "user_request";
    pub const CONVERSATION_SUMMARY: &str = "conversation_summary";
    pub const CONVERSATION_HISTORY: &str = "conversation_history";
    pub const RESEARCH_NOTES: &str = "research_notes";
    pub const EXECUTION_TRACE: &str = "execution_trace";
    pub const NEXT_TOPIC: &str = "next_topic";
    pub const FINAL_REPORT: &str = "final_report";
    pub const ITERATIONS: &str = "iterations";
    pub const ANSWER_FORMAT: &str = "answer_format";
    pub const CURRENT_REPORT_VERSION: &str = "current_report_version";
    pub const PREDICTION_MARKETS: &str = "prediction_markets";
    pub const APPROVED_MARKETS: &str = "approved_markets";
    pub const POLYMARKET_BLURB: &str = "polymarket_blurb";

    pub const TOPIC: &str = "topic";
    pub const QUERIES: &str = "queries";
    pub const QUERY_BREADTH: &str = "query_breadth";
    pub const SEARCH_RESULTS: &str = "search_results";
    pub const RESEARCH_SUMMARY: &str = "research_summary";

    pub const ORIGINAL_TOPIC: &str = "original_topic";
    pub const AI_RESPONSE: &str = "ai_response";
    pub const SELECTED_TAGS: &str = "selected_tags";
    pub const RAW_EVENTS: &str = "raw_events";
    pub const CANDIDATE_MARKETS: &str = "candidate_markets";
    pub const REASONING_TRACE: &str = "reasoning_trace";
}

/// How the final answer should be shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerFormat {
    /// Short, direct answer.
    #[default]
    Concise,
    /// Full markdown report.
    Report,
}

impl AnswerFormat {
    /// Queries generated (and results fetched per query) for this format.
    pub fn query_breadth(&self) -> usize {
        match self {
            AnswerFormat::Concise => 3,
            AnswerFormat::Report => 5,
        }
    }
}

/// One entry of the rolling conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// `user` or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl HistoryEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// State of the main (supervisor) graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorState {
    pub user_request: String,
    pub conversation_summary: String,
    pub conversation_history: Vec<HistoryEntry>,
    pub research_notes: Vec<String>,
    pub execution_trace: Vec<Value>,
    pub next_topic: String,
    pub final_report: String,
    pub iterations: u32,
    pub answer_format: AnswerFormat,
    pub current_report_version: u32,
    pub prediction_markets: Vec<Market>,
    pub polymarket_blurb: Option<String>,
}

impl SupervisorState {
    /// Deserialize the engine's JSON state into the typed view.
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| GraphError::Internal(format!("supervisor state: {e}")))
    }

    /// Serialize back to the engine's JSON representation.
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self)
            .map_err(|e| GraphError::Internal(format!("supervisor state: {e}")))
    }

    /// The clarification question carried in `next_topic`, if any.
    pub fn clarify_question(&self) -> Option<&str> {
        self.next_topic.strip_prefix(CLARIFY_PREFIX).map(str::trim)
    }
}

/// State of the researcher subgraph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearcherState {
    pub topic: String,
    pub queries: Vec<String>,
    pub query_breadth: usize,
    pub search_results: Vec<SearchResultEntry>,
    pub research_summary: String,
}

impl Default for ResearcherState {
    fn default() -> Self {
        Self {
            topic: String::new(),
            queries: Vec::new(),
            query_breadth: 2,
            search_results: Vec::new(),
            research_summary: String::new(),
        }
    }
}

impl ResearcherState {
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| GraphError::Internal(format!("researcher state: {e}")))
    }
}

/// One formatted search hit, tagged with the query that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResultEntry {
    pub query: String,
    pub url: String,
    pub title: String,
    pub content: String,
}

/// State of the market-research subgraph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketResearchState {
    pub original_topic: String,
    pub ai_response: String,
    pub selected_tags: Vec<Tag>,
    pub raw_events: Vec<Market>,
    pub candidate_markets: Vec<Market>,
    pub approved_markets: Vec<Market>,
    pub reasoning_trace: Vec<String>,
}

impl MarketResearchState {
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| GraphError::Internal(format!("market state: {e}")))
    }
}

/// Bounded conversation-history reducer.
///
/// Appends entry arrays and truncates to the trailing `cap` entries; the
/// string signal [`HISTORY_RESET`] empties the list (the summarizer
/// sends it after folding the history into the summary).
pub struct HistoryReducer {
    cap: usize,
}

impl HistoryReducer {
    pub fn new(cap: usize) -> Self {
        Self { cap }
    }
}

impl Reducer for HistoryReducer {
    fn reduce(&self, current: &Value, update: &Value) -> Result<Value> {
        if update.as_str() == Some(HISTORY_RESET) {
            return Ok(Value::Array(Vec::new()));
        }

        let additions = update.as_array().ok_or_else(|| GraphError::Reducer {
            field: fields::CONVERSATION_HISTORY.to_string(),
            message: "history update must be an entry array or the reset signal".to_string(),
        })?;

        let mut merged = match current {
            Value::Array(existing) => existing.clone(),
            Value::Null => Vec::new(),
            _ => {
                return Err(GraphError::Reducer {
                    field: fields::CONVERSATION_HISTORY.to_string(),
                    message: "history is not an array".to_string(),
                })
            }
        };
        merged.extend_from_slice(additions);

        if merged.len() > self.cap {
            merged.drain(..merged.len() - self.cap);
        }
        Ok(Value::Array(merged))
    }

    fn name(&self) -> &str {
        "history"
    }
}

/// Reducer table of the main graph.
pub fn supervisor_schema(history_cap: usize) -> StateSchema {
    StateSchema::new()
        .with_field(fields::CONVERSATION_HISTORY, Box::new(HistoryReducer::new(history_cap)))
        .with_field(fields::RESEARCH_NOTES, Box::new(ConcatReducer))
        .with_field(fields::EXECUTION_TRACE, Box::new(ConcatReducer))
}

/// Reducer table of the researcher subgraph.
pub fn researcher_schema() -> StateSchema {
    StateSchema::new().with_field(fields::SEARCH_RESULTS, Box::new(ConcatReducer))
}

/// Reducer table of the market-research subgraph.
pub fn market_schema() -> StateSchema {
    StateSchema::new().with_field(fields::REASONING_TRACE, Box::new(ConcatReducer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn clarify_question_strips_prefix() {
        let state = SupervisorState {
            next_topic: "CLARIFY: which election?".to_string(),
            ..Default::default()
        };
        assert_eq!(state.clarify_question(), Some("which election?"));

        let plain = SupervisorState {
            next_topic: "ai policy".to_string(),
            ..Default::default()
        };
        assert!(plain.clarify_question().is_none());
    }

    #[test]
    fn history_reducer_appends_and_caps() {
        let reducer = HistoryReducer::new(3);
        let current = json!([
            {"role": "user", "content": "1"},
            {"role": "assistant", "content": "2"},
        ]);
        let update = json!([
            {"role": "user", "content": "3"},
            {"role": "assistant", "content": "4"},
        ]);

        let merged = reducer.reduce(&current, &update).unwrap();
        let contents: Vec<&str> = merged
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["content"].as_str().unwrap())
            .collect();
        assert_eq!(contents, vec!["2", "3", "4"]);
    }

    #[test]
    fn history_reducer_resets() {
        let reducer = HistoryReducer::new(50);
        let current = json!([{"role": "user", "content": "old"}]);
        let merged = reducer.reduce(&current, &json!(HISTORY_RESET)).unwrap();
        assert_eq!(merged, json!([]));
    }

    #[test]
    fn answer_format_defaults_concise() {
        let state = SupervisorState::from_value(&json!({"user_request": "hi"})).unwrap();
        assert_eq!(state.answer_format, AnswerFormat::Concise);
        assert_eq!(state.answer_format.query_breadth(), 3);
        assert_eq!(AnswerFormat::Report.query_breadth(), 5);
    }

    #[test]
    fn supervisor_state_round_trips() {
        let state = SupervisorState {
            user_request: "what happened?".to_string(),
            research_notes: vec!["note".to_string()],
            iterations: 2,
            ..Default::default()
        };
        let back = SupervisorState::from_value(&state.to_value().unwrap()).unwrap();
        assert_eq!(back.user_request, "what happened?");
        assert_eq!(back.research_notes, vec!["note".to_string()]);
        assert_eq!(back.iterations, 2);
    }

    proptest! {
        // Any append sequence with a single reset somewhere ends as the
        // capped tail of the appends after the reset.
        #[test]
        fn history_matches_capped_tail_after_reset(
            before in proptest::collection::vec(proptest::collection::vec(0u32..1000, 0..4), 0..6),
            after in proptest::collection::vec(proptest::collection::vec(0u32..1000, 0..4), 0..30),
        ) {
            let cap = 50;
            let reducer = HistoryReducer::new(cap);
            let mut state = Value::Null;

            for batch in &before {
                let update = json!(batch.iter().map(|n| json!({"role": "user", "content": n.to_string()})).collect::<Vec<_>>());
                state = reducer.reduce(&state, &update).unwrap();
            }
            state = reducer.reduce(&state, &json!(HISTORY_RESET)).unwrap();

            let mut expected: Vec<String> = Vec::new();
            for batch in &after {
                let update = json!(batch.iter().map(|n| json!({"role": "user", "content": n.to_string()})).collect::<Vec<_>>());
                state = reducer.reduce(&state, &update).unwrap();
                expected.extend(batch.iter().map(|n| n.to_string()));
            }
            if expected.len() > cap {
                expected.drain(..expected.len() - cap);
            }

            let got: Vec<String> = state
                .as_array()
                .unwrap()
                .iter()
                .map(|e| e["content"].as_str().unwrap().to_string())
                .collect();
            prop_assert_eq!(got, expected);
        }
    }
}
