//! The per-process orchestrator.
//!
//! An [`Agent`] owns the compiled graph, both persistence backends, and
//! the per-run plumbing. [`Agent::run`] resolves the thread, seeds the
//! initial state (fresh, or resumed from the latest checkpoint), drives
//! the engine on a spawned task, and demultiplexes engine output to the
//! client stream and the trace collector. When the engine finishes
//! cleanly, finalization persists the user and assistant messages and
//! reconciles the collected trace under the thread's write lock.
//!
//! Resume seeds only `user_request`, `conversation_summary`, an empty
//! `conversation_history`, and an incremented `current_report_version`.
//! Append-only fields are never pre-populated: their history already
//! lives in the checkpoint lineage, and seeding them again would
//! double-append through the concat reducers.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use graphflow_checkpoint::{CheckpointConfig, CheckpointSaver};
use graphflow_core::{CompiledGraph, EngineOutput, Envelope, EventType, Result, RunConfig};

use crate::collector::{ThreadLocks, TraceCollector};
use crate::config::Settings;
use crate::graphs::{build_main_graph, GraphDeps};
use crate::nodes::researcher::UrlDeduper;
use crate::state::SupervisorState;
use crate::store::{MessageStore, MessageWithTrace, Role, Thread};

/// The orchestrator: one per process (or per test).
pub struct Agent {
    graph: CompiledGraph,
    store: Arc<dyn MessageStore>,
    checkpointer: Arc<dyn CheckpointSaver>,
    url_dedup: UrlDeduper,
    locks: ThreadLocks,
    settings: Settings,
}

impl Agent {
    /// Build an agent from its dependencies.
    pub fn new(deps: GraphDeps) -> Result<Self> {
        let graph = build_main_graph(&deps)?;
        Ok(Self {
            graph,
            store: deps.store,
            checkpointer: deps.checkpointer,
            url_dedup: deps.url_dedup,
            locks: ThreadLocks::new(),
            settings: deps.settings,
        })
    }

    /// Run one user question against a thread, streaming envelopes.
    ///
    /// A missing `thread_id` starts a fresh thread whose id is announced
    /// as `system/thread_id`. An empty message is refused: the stream
    /// carries the system marker and closes with no state change.
    pub fn run(&self, user_message: impl Into<String>, thread_id: Option<String>) -> ReceiverStream<Envelope> {
        let (tx, rx) = mpsc::channel(256);
        let user_message = user_message.into();
        let graph = self.graph.clone();
        let store = self.store.clone();
        let checkpointer = self.checkpointer.clone();
        let url_dedup = self.url_dedup.clone();
        let locks = self.locks.clone();
        let settings = self.settings.clone();

        tokio::spawn(async move {
            let thread_id = thread_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let _ = tx
                .send(Envelope::system("thread_id", serde_json::json!({"thread_id": &thread_id})))
                .await;

            let trimmed = user_message.trim().to_string();
            if trimmed.is_empty() {
                tracing::debug!(thread_id = %thread_id, "refusing empty message");
                return;
            }

            let initial = match seed_state(&*checkpointer, &thread_id, &trimmed).await {
                Ok(initial) => initial,
                Err(err) => {
                    let _ = tx.send(Envelope::error(err.envelope_message())).await;
                    return;
                }
            };
            let initial_value = match initial.to_value() {
                Ok(value) => value,
                Err(err) => {
                    let _ = tx.send(Envelope::error(err.envelope_message())).await;
                    return;
                }
            };

            url_dedup.begin_run(&thread_id);

            let mut engine = graph.run(initial_value, RunConfig::new(&thread_id));
            let mut collector = TraceCollector::new();
            let mut final_state: Option<Value> = None;
            let mut run_failed = false;

            while let Some(output) = engine.next().await {
                collector.observe(&output);
                match output {
                    EngineOutput::Event(envelope) => {
                        if envelope.event_type == EventType::Error {
                            run_failed = true;
                        }
                        if tx.send(envelope).await.is_err() {
                            // Client stopped reading; dropping the engine
                            // stream cancels it at the next safe point.
                            return;
                        }
                    }
                    EngineOutput::Done(state) => final_state = Some(state),
                    EngineOutput::Updates { .. } => {}
                }
            }

            if run_failed {
                return;
            }
            let Some(state) = final_state else { return };

            if let Err(err) =
                finalize(&*store, &locks, &settings, &thread_id, &state, &collector).await
            {
                tracing::error!(thread_id = %thread_id, error = %err, "finalization failed");
            }
        });

        ReceiverStream::new(rx)
    }

    /// Build an agent with the real HTTP drivers and the stores implied
    /// by the settings: SQLite when a DSN is configured, in-memory
    /// otherwise.
    pub async fn bootstrap(settings: Settings) -> anyhow::Result<Self> {
        use drivers::{GammaClient, LlmConfig, OpenAiClient, RetryPolicy, TavilyClient};
        use graphflow_checkpoint::{MemorySaver, SqliteSaver};
        use crate::store::{MemoryMessageStore, SqliteMessageStore};

        let api_key = settings
            .llm_api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("OPENAI_API_KEY is not set"))?;
        let search_key = settings
            .search_api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("TAVILY_API_KEY is not set"))?;

        let retry = RetryPolicy::new(settings.llm_retries);
        let llm = OpenAiClient::new(
            LlmConfig::new(&api_key, &settings.supervisor_model)
                .with_temperature(settings.temperature)
                .with_retry(retry.clone()),
        )?;
        let name_llm = OpenAiClient::new(
            LlmConfig::new(&api_key, &settings.thread_name_model)
                .with_temperature(settings.temperature)
                .with_retry(retry),
        )?;
        let search = TavilyClient::new(search_key)?;
        let catalog = GammaClient::new(&settings.market_base_url)?;

        let (checkpointer, store): (Arc<dyn CheckpointSaver>, Arc<dyn MessageStore>) =
            match &settings.database_url {
                Some(dsn) => {
                    let pool = sqlx::sqlite::SqlitePoolOptions::new()
                        .max_connections(5)
                        .connect(dsn)
                        .await?;
                    (
                        Arc::new(SqliteSaver::new(pool.clone()).await?),
                        Arc::new(SqliteMessageStore::new(pool).await?),
                    )
                }
                None => (
                    Arc::new(MemorySaver::new()),
                    Arc::new(MemoryMessageStore::new()),
                ),
            };

        Ok(Self::new(GraphDeps {
            llm: Arc::new(llm),
            name_llm: Arc::new(name_llm),
            search: Arc::new(search),
            catalog: Arc::new(catalog),
            store,
            checkpointer,
            url_dedup: UrlDeduper::new(),
            settings,
        })?)
    }

    /// Threads in the message store, most recent first.
    pub async fn list_threads(&self) -> crate::store::Result<Vec<Thread>> {
        self.store.list_threads().await
    }

    /// A thread's messages with their traces.
    pub async fn get_history(&self, thread_id: &str) -> crate::store::Result<Vec<MessageWithTrace>> {
        self.store.get_history(thread_id).await
    }

    /// Delete a thread everywhere: messages, traces, checkpoints.
    pub async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.store
            .delete_thread(thread_id)
            .await
            .map_err(|e| graphflow_core::GraphError::Internal(e.to_string()))?;
        self.checkpointer.delete_thread(thread_id).await?;
        Ok(())
    }
}

/// Build the initial state: fresh, or resumed from the checkpoint leaf.
async fn seed_state(
    checkpointer: &dyn CheckpointSaver,
    thread_id: &str,
    user_request: &str,
) -> Result<SupervisorState> {
    let latest = checkpointer
        .get_latest(&CheckpointConfig::new(thread_id))
        .await?;

    Ok(match latest {
        Some(checkpoint) => {
            let previous = SupervisorState::from_value(&checkpoint.state)?;
            SupervisorState {
                user_request: user_request.to_string(),
                conversation_summary: previous.conversation_summary,
                current_report_version: previous.current_report_version + 1,
                ..Default::default()
            }
        }
        None => SupervisorState {
            user_request: user_request.to_string(),
            ..Default::default()
        },
    })
}

/// Persist the turn's messages and reconcile the collected trace.
async fn finalize(
    store: &dyn MessageStore,
    locks: &ThreadLocks,
    settings: &Settings,
    thread_id: &str,
    state: &Value,
    collector: &TraceCollector,
) -> Result<()> {
    let state = SupervisorState::from_value(state)?;
    if state.final_report.is_empty() {
        return Err(graphflow_core::GraphError::Internal(
            "terminal state has no final report".to_string(),
        ));
    }

    let lock = locks.for_thread(thread_id).await;
    let _guard = lock.lock().await;

    let internal = |e: crate::store::StoreError| graphflow_core::GraphError::Internal(e.to_string());
    store.create_thread(thread_id, None).await.map_err(internal)?;
    store
        .append_message(thread_id, Role::User, &state.user_request)
        .await
        .map_err(internal)?;
    let assistant = store
        .append_message(thread_id, Role::Assistant, &state.final_report)
        .await
        .map_err(internal)?;
    collector
        .reconcile(store, &assistant.id)
        .await
        .map_err(internal)?;

    if let Some(dir) = &settings.state_log_dir {
        log_terminal_state(dir, thread_id, &state);
    }
    Ok(())
}

/// Best-effort debugging dump of the terminal state.
fn log_terminal_state(dir: &std::path::Path, thread_id: &str, state: &SupervisorState) {
    let write = || -> std::io::Result<()> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "{thread_id}-{}.json",
            chrono::Utc::now().timestamp_millis()
        ));
        let body = serde_json::to_vec_pretty(state).unwrap_or_default();
        std::fs::write(path, body)
    };
    if let Err(err) = write() {
        tracing::warn!(thread_id, error = %err, "state log write failed");
    }
}
