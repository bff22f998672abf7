//! # augur
//!
//! A multi-step research agent. Each user question drives a typed state
//! machine: a supervisor decides whether to answer directly, ask for
//! clarification, or dispatch research; a researcher subgraph fans out
//! parallel web searches and synthesizes notes; a market-research
//! subgraph surfaces relevant prediction markets; terminal nodes compose
//! the answer; a summarizer compacts the conversation. Every run streams
//! normalized event envelopes to the caller and persists twice over:
//! checkpoints for resumption, plus a flat message/trace store for UI
//! reads, repaired after the run by trace reconciliation.
//!
//! The engine lives in `graphflow-core`, checkpointing in
//! `graphflow-checkpoint`, and the external collaborators (chat model,
//! web search, market catalog) behind the `drivers` traits. This crate
//! supplies the states, nodes, graphs, stores, and the [`Agent`]
//! orchestrator.
//!
//! ```rust,no_run
//! use augur::{Agent, Settings};
//! use tokio_stream::StreamExt;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let agent = Agent::bootstrap(Settings::from_env()).await?;
//! let mut stream = agent.run("What changed in EU AI policy this month?", None);
//! while let Some(envelope) = stream.next().await {
//!     println!("{}", serde_json::to_string(&envelope)?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod collector;
pub mod config;
pub mod graphs;
pub mod nodes;
pub mod prompts;
pub mod state;
pub mod store;

pub use agent::Agent;
pub use collector::{ThreadLocks, TraceCollector};
pub use config::Settings;
pub use graphs::{build_main_graph, GraphDeps};
pub use nodes::researcher::UrlDeduper;
pub use state::{
    AnswerFormat, HistoryEntry, MarketResearchState, ResearcherState, SupervisorState,
};
pub use store::{
    MemoryMessageStore, MessageStore, MessageWithTrace, Role, SqliteMessageStore, Thread,
};
