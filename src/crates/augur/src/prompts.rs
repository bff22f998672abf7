//! Prompt construction for every LLM call site.
//!
//! Kept in one module so the call sites stay free of string plumbing.
//! These are working prompts, not a prompt-engineering effort.

use crate::state::{HistoryEntry, SupervisorState};
use drivers::{Market, Tag};

pub fn supervisor(state: &SupervisorState) -> String {
    let notes = if state.research_notes.is_empty() {
        "none yet".to_string()
    } else {
        state.research_notes.join("\n---\n")
    };
    format!(
        "You are the supervisor of a research agent. Decide the next step for the \
         user's request.\n\n\
         User request: {request}\n\
         Conversation summary: {summary}\n\
         Recent messages:\n{history}\n\
         Research notes so far:\n{notes}\n\
         Iterations used: {iterations}\n\
         Report revision: {version}\n\n\
         Choose one: `research` (name a research_topic not yet covered by the notes), \
         `finish` (the notes or summary already answer the request), or \
         `clarify` (the request is too ambiguous; put the question in research_topic). \
         Also pick answer_format: `concise` for simple questions, `report` for \
         anything needing sourced depth.",
        request = state.user_request,
        summary = or_none(&state.conversation_summary),
        history = render_history(&state.conversation_history),
        notes = notes,
        iterations = state.iterations,
        version = state.current_report_version,
    )
}

pub fn supervisor_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "next_step": {"type": "string", "enum": ["research", "finish", "clarify"]},
            "research_topic": {"type": "string"},
            "reasoning": {"type": "string"},
            "answer_format": {"type": "string", "enum": ["concise", "report"]}
        },
        "required": ["next_step", "reasoning"]
    })
}

pub fn thread_name(user_request: &str) -> String {
    format!(
        "Name this conversation in at most five words, no punctuation, no quotes. \
         First message: {user_request}"
    )
}

pub fn generate_queries(topic: &str, count: usize) -> String {
    format!(
        "Produce {count} distinct, short web-search queries covering different \
         angles of this research topic. Topic: {topic}"
    )
}

pub fn queries_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "queries": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["queries"]
    })
}

pub fn synthesize(topic: &str, formatted_results: &str) -> String {
    format!(
        "Synthesize the search results below into a single markdown research note \
         on \"{topic}\". Cite source URLs inline. Keep only what is supported by \
         the results.\n\n{formatted_results}"
    )
}

pub fn final_report(state: &SupervisorState, refine: bool) -> String {
    let format_instruction = match state.answer_format {
        crate::state::AnswerFormat::Concise => {
            "Answer concisely: a few sentences, no headings."
        }
        crate::state::AnswerFormat::Report => {
            "Write a structured markdown report with headings and inline source links."
        }
    };
    let framing = if refine {
        "Revise your previous report for the follow-up request, reusing what still holds."
    } else {
        "Write the answer from scratch."
    };
    format!(
        "{framing} {format_instruction}\n\n\
         User request: {request}\n\
         Conversation summary: {summary}\n\
         Research notes:\n{notes}",
        request = state.user_request,
        summary = or_none(&state.conversation_summary),
        notes = state.research_notes.join("\n---\n"),
    )
}

pub fn direct_answer(state: &SupervisorState) -> String {
    format!(
        "Answer the user's request directly and concisely from what you know and \
         the conversation summary.\n\n\
         Conversation summary: {summary}\n\
         User request: {request}",
        summary = or_none(&state.conversation_summary),
        request = state.user_request,
    )
}

pub fn summarize(history: &[HistoryEntry], existing_summary: &str) -> String {
    format!(
        "Update the running conversation summary. Fold the new messages into the \
         existing summary; keep it under 200 words and keep every fact needed to \
         continue the conversation.\n\n\
         Existing summary: {existing}\n\
         New messages:\n{history}",
        existing = or_none(existing_summary),
        history = render_history(history),
    )
}

pub fn select_tags(topic: &str, batch: &[Tag]) -> String {
    let names: Vec<&str> = batch.iter().map(|t| t.name.as_str()).collect();
    format!(
        "From the prediction-market tags below, select the ones relevant to the \
         topic \"{topic}\". Return their names exactly as given, and set \
         continue_search to true only if a later page might hold better tags.\n\n\
         Tags: {names:?}"
    )
}

pub fn tags_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "selected_tags": {"type": "array", "items": {"type": "string"}},
            "continue_search": {"type": "boolean"}
        },
        "required": ["selected_tags", "continue_search"]
    })
}

pub fn rank_markets(topic: &str, ai_response: &str, markets: &[Market]) -> String {
    format!(
        "Rank the prediction markets below by relevance to the topic and the \
         report. Return the slugs of the relevant ones, most relevant first, \
         plus one short reasoning string.\n\n\
         Topic: {topic}\n\
         Report: {ai_response}\n\
         Markets:\n{listing}",
        listing = render_markets(markets),
    )
}

pub fn rank_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "ranked_slugs": {"type": "array", "items": {"type": "string"}},
            "reasoning": {"type": "string"}
        },
        "required": ["ranked_slugs", "reasoning"]
    })
}

pub fn evaluate_markets(topic: &str, markets: &[Market]) -> String {
    format!(
        "Approve the subset of these candidate markets genuinely worth showing \
         next to an answer about \"{topic}\". Return approved slugs and one short \
         reasoning string.\n\n{listing}",
        listing = render_markets(markets),
    )
}

pub fn evaluate_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "approved_slugs": {"type": "array", "items": {"type": "string"}},
            "reasoning": {"type": "string"}
        },
        "required": ["approved_slugs", "reasoning"]
    })
}

pub fn market_blurb(report: &str, markets: &[Market]) -> String {
    format!(
        "Write one short paragraph pointing the reader at these prediction \
         markets as a live signal on the question, given the report below. \
         Mention each market question once.\n\n\
         Report: {report}\n\
         Markets:\n{listing}",
        listing = render_markets(markets),
    )
}

fn render_history(history: &[HistoryEntry]) -> String {
    if history.is_empty() {
        return "(empty)".to_string();
    }
    history
        .iter()
        .map(|entry| format!("{}: {}", entry.role, entry.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_markets(markets: &[Market]) -> String {
    markets
        .iter()
        .map(|m| format!("- {}: {}", m.slug, m.question))
        .collect::<Vec<_>>()
        .join("\n")
}

fn or_none(s: &str) -> &str {
    if s.is_empty() {
        "(none)"
    } else {
        s
    }
}
