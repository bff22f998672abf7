//! End-to-end runs against stub drivers: full graph, real engine, real
//! stores, no network.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio_stream::StreamExt;

use augur::{Agent, GraphDeps, Settings, UrlDeduper};
use drivers::{
    ChatModel, Market, MarketCatalog, MarketEvent, PricePoint, SearchHit, SearchProvider, Tag,
};
use graphflow_checkpoint::{CheckpointConfig, CheckpointSaver, MemorySaver};
use graphflow_core::{Envelope, EventType};

use augur::store::{MemoryMessageStore, MessageStore};

/// Scripted chat model. Structured calls are dispatched on the schema
/// (decision vs queries vs tags vs rank vs approve); supervisor
/// decisions pop from a queue, defaulting to `finish`.
struct StubLlm {
    decisions: Mutex<VecDeque<Value>>,
    queries: Vec<String>,
    tag_names: Vec<String>,
    ranked: Vec<String>,
    approved: Vec<String>,
    answer: String,
    summary: String,
    prompts: Mutex<Vec<String>>,
}

impl StubLlm {
    fn new(decisions: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            decisions: Mutex::new(decisions.into()),
            queries: vec!["query one".to_string(), "query two".to_string()],
            tag_names: vec!["Politics".to_string()],
            ranked: vec!["will-it-happen".to_string()],
            approved: vec!["will-it-happen".to_string()],
            answer: "The answer is 4.".to_string(),
            summary: "The user asked a question and got an answer.".to_string(),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn research(topic: &str) -> Value {
        json!({"next_step": "research", "research_topic": topic, "reasoning": "needs sources"})
    }

    fn finish() -> Value {
        json!({"next_step": "finish", "reasoning": "enough context", "answer_format": "concise"})
    }

    fn clarify(question: &str) -> Value {
        json!({"next_step": "clarify", "research_topic": question, "reasoning": "ambiguous"})
    }

    fn prompts_seen(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for StubLlm {
    async fn complete(&self, prompt: &str) -> drivers::Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let text = if prompt.starts_with("Name this conversation") {
            "Stubbed thread name".to_string()
        } else if prompt.contains("Synthesize the search results") {
            "Synthesized findings with [source](https://example.com/a).".to_string()
        } else if prompt.contains("Update the running conversation summary") {
            self.summary.clone()
        } else if prompt.contains("live signal") {
            "Markets currently price this around 42%.".to_string()
        } else {
            self.answer.clone()
        };
        Ok(text)
    }

    async fn complete_structured(&self, prompt: &str, schema: &Value) -> drivers::Result<Value> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let props = &schema["properties"];
        if props.get("next_step").is_some() {
            let decision = self.decisions.lock().unwrap().pop_front();
            return Ok(decision.unwrap_or_else(StubLlm::finish));
        }
        if props.get("queries").is_some() {
            return Ok(json!({"queries": &self.queries}));
        }
        if props.get("selected_tags").is_some() {
            return Ok(json!({"selected_tags": &self.tag_names, "continue_search": false}));
        }
        if props.get("ranked_slugs").is_some() {
            return Ok(json!({"ranked_slugs": &self.ranked, "reasoning": "most relevant"}));
        }
        if props.get("approved_slugs").is_some() {
            return Ok(json!({"approved_slugs": &self.approved, "reasoning": "worth showing"}));
        }
        Ok(json!({}))
    }
}

/// Same hits for every query; duplicates across branches exercise the
/// per-run URL dedup.
struct StubSearch {
    hits: Vec<SearchHit>,
}

impl StubSearch {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            hits: vec![
                SearchHit {
                    url: "https://example.com/a".to_string(),
                    title: "Source A".to_string(),
                    content: "fact one".to_string(),
                },
                SearchHit {
                    url: "https://example.com/b".to_string(),
                    title: "Source B".to_string(),
                    content: "fact two".to_string(),
                },
            ],
        })
    }
}

#[async_trait]
impl SearchProvider for StubSearch {
    async fn search(&self, _query: &str, max_results: usize) -> drivers::Result<Vec<SearchHit>> {
        Ok(self.hits.iter().take(max_results).cloned().collect())
    }
}

struct StubCatalog;

#[async_trait]
impl MarketCatalog for StubCatalog {
    async fn fetch_tags(&self, offset: usize, _limit: usize) -> drivers::Result<Vec<Tag>> {
        if offset == 0 {
            Ok(vec![Tag {
                id: "7".to_string(),
                name: "Politics".to_string(),
            }])
        } else {
            Ok(Vec::new())
        }
    }

    async fn fetch_events_by_tag_id(&self, _tag_id: &str) -> drivers::Result<Vec<MarketEvent>> {
        let market: Market = serde_json::from_value(json!({
            "slug": "will-it-happen",
            "question": "Will it happen?",
            "clobTokenIds": "[\"tok-1\", \"tok-2\"]"
        }))
        .unwrap();
        Ok(vec![MarketEvent {
            title: "Big event".to_string(),
            slug: "big-event".to_string(),
            image: None,
            markets: vec![market],
        }])
    }

    async fn fetch_price_history(
        &self,
        _token_id: &str,
        _interval: &str,
        _fidelity: u32,
    ) -> drivers::Result<Vec<PricePoint>> {
        Ok(vec![PricePoint { t: 1, p: 0.42 }])
    }
}

struct Harness {
    agent: Agent,
    store: Arc<MemoryMessageStore>,
    checkpointer: Arc<MemorySaver>,
}

fn harness(llm: Arc<StubLlm>) -> Harness {
    let store = Arc::new(MemoryMessageStore::new());
    let checkpointer = Arc::new(MemorySaver::new());
    let agent = build_agent(llm, store.clone(), checkpointer.clone());
    Harness {
        agent,
        store,
        checkpointer,
    }
}

fn build_agent(
    llm: Arc<StubLlm>,
    store: Arc<MemoryMessageStore>,
    checkpointer: Arc<MemorySaver>,
) -> Agent {
    Agent::new(GraphDeps {
        llm: llm.clone(),
        name_llm: llm,
        search: StubSearch::new(),
        catalog: Arc::new(StubCatalog),
        store,
        checkpointer,
        url_dedup: UrlDeduper::new(),
        settings: Settings::default(),
    })
    .unwrap()
}

async fn run_to_end(agent: &Agent, message: &str, thread: Option<String>) -> Vec<Envelope> {
    let mut stream = agent.run(message, thread);
    let mut envelopes = Vec::new();
    while let Some(envelope) = stream.next().await {
        envelopes.push(envelope);
    }
    // Finalization runs after the stream closes; let it settle.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    envelopes
}

fn customs<'a>(envelopes: &'a [Envelope], event: &str) -> Vec<&'a Envelope> {
    envelopes
        .iter()
        .filter(|e| e.event_type == EventType::Custom && e.event == event)
        .collect()
}

fn thread_id_of(envelopes: &[Envelope]) -> String {
    envelopes
        .iter()
        .find(|e| e.event_type == EventType::System && e.event == "thread_id")
        .and_then(|e| e.payload["thread_id"].as_str())
        .expect("thread_id envelope")
        .to_string()
}

#[tokio::test]
async fn e1_direct_answer() {
    let started = chrono::Utc::now().timestamp_millis();
    let h = harness(StubLlm::new(vec![StubLlm::finish()]));
    let envelopes = run_to_end(&h.agent, "2+2", None).await;
    let ended = chrono::Utc::now().timestamp_millis();

    assert_eq!(envelopes[0].event, "thread_id");
    assert_eq!(customs(&envelopes, "thread_name").len(), 1);

    let decisions = customs(&envelopes, "supervisor_decision");
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].payload["decision"], "finish");

    let iteration_updates: Vec<&Envelope> = envelopes
        .iter()
        .filter(|e| e.event_type == EventType::StateUpdate && e.payload.get("iterations").is_some())
        .collect();
    assert_eq!(iteration_updates[0].payload["iterations"], 1);

    let report_update = envelopes
        .iter()
        .find(|e| e.event_type == EventType::StateUpdate && e.payload.get("final_report").is_some())
        .expect("final_report state update");
    assert!(report_update.payload["final_report"].as_str().unwrap().contains('4'));

    let last = envelopes.last().unwrap();
    assert_eq!(last.event_type, EventType::Complete);
    assert!(last.payload["response"].as_str().unwrap().contains('4'));

    // Envelope well-formedness: closed type set is enforced by the enum;
    // timestamps must sit inside the run window.
    for envelope in &envelopes {
        assert!(!envelope.node.is_empty());
        assert!(!envelope.event.is_empty());
        assert!(envelope.timestamp_ms >= started && envelope.timestamp_ms <= ended);
    }

    // Persisted: user + assistant message, with at least one trace row.
    let thread_id = thread_id_of(&envelopes);
    let history = h.store.get_history(&thread_id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].message.role, augur::Role::User);
    assert_eq!(history[1].message.role, augur::Role::Assistant);
    assert!(!history[1].trace.is_empty());
}

#[tokio::test]
async fn e2_single_research_flow() {
    let h = harness(StubLlm::new(vec![
        StubLlm::research("what obama did last week"),
        StubLlm::finish(),
    ]));
    let envelopes = run_to_end(&h.agent, "What did Obama do last week?", None).await;

    let decisions = customs(&envelopes, "supervisor_decision");
    assert_eq!(decisions.len(), 2);
    assert_eq!(decisions[0].payload["decision"], "research");

    assert_eq!(customs(&envelopes, "generated_queries").len(), 1);
    assert_eq!(customs(&envelopes, "search_start").len(), 2);

    // Both branches return the same two URLs; the parent forwards each
    // distinct URL exactly once.
    let urls: Vec<&str> = customs(&envelopes, "web_search_url")
        .iter()
        .map(|e| e.payload["url"].as_str().unwrap())
        .collect();
    assert_eq!(urls.len(), 2);
    assert!(urls.contains(&"https://example.com/a"));
    assert!(urls.contains(&"https://example.com/b"));

    assert_eq!(customs(&envelopes, "research_synthesis_done").len(), 1);
    assert_eq!(customs(&envelopes, "final_report_complete").len(), 1);
    assert_eq!(customs(&envelopes, "tag_selected").len(), 1);
    assert_eq!(customs(&envelopes, "market_approved").len(), 1);
    assert_eq!(customs(&envelopes, "market_research_complete").len(), 1);
    assert_eq!(envelopes.last().unwrap().event_type, EventType::Complete);

    // One research cycle -> one research note in the terminal state.
    let thread_id = thread_id_of(&envelopes);
    let latest = h
        .checkpointer
        .get_latest(&CheckpointConfig::new(&thread_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.state["research_notes"].as_array().unwrap().len(), 1);

    // Checkpoint lineage: each step chains onto the previous one.
    let lineage = h
        .checkpointer
        .list(&CheckpointConfig::new(&thread_id))
        .await
        .unwrap();
    assert!(lineage.len() >= 2);
    assert!(lineage[0].parent_id.is_none());
    for pair in lineage.windows(2) {
        assert_eq!(pair[1].parent_id.as_deref(), Some(pair[0].id.as_str()));
    }
}

#[tokio::test]
async fn e3_clarification() {
    let h = harness(StubLlm::new(vec![StubLlm::clarify("Which election do you mean?")]));
    let envelopes = run_to_end(&h.agent, "it", None).await;

    let last = envelopes.last().unwrap();
    assert_eq!(last.event_type, EventType::Complete);
    assert_eq!(last.payload["response"], "Which election do you mean?");

    assert!(customs(&envelopes, "generated_queries").is_empty());

    let thread_id = thread_id_of(&envelopes);
    let history = h.store.get_history(&thread_id).await.unwrap();
    assert_eq!(history[1].message.content, "Which election do you mean?");

    let latest = h
        .checkpointer
        .get_latest(&CheckpointConfig::new(&thread_id))
        .await
        .unwrap()
        .unwrap();
    assert!(latest.state["research_notes"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn e4_iteration_cap_short_circuit() {
    // A supervisor that never stops researching on its own.
    let always_research: Vec<Value> =
        (0..20).map(|i| StubLlm::research(&format!("topic {i}"))).collect();
    let h = harness(StubLlm::new(always_research));
    let envelopes = run_to_end(&h.agent, "endless question", None).await;

    let decisions = customs(&envelopes, "supervisor_decision");
    assert_eq!(decisions.len(), 10);
    assert_eq!(decisions.last().unwrap().payload["decision"], "finish");

    assert_eq!(customs(&envelopes, "final_report_complete").len(), 1);
    assert_eq!(envelopes.last().unwrap().event_type, EventType::Complete);
    assert!(envelopes.iter().all(|e| e.event_type != EventType::Error));
}

#[tokio::test]
async fn e5_resume_across_instances() {
    let store = Arc::new(MemoryMessageStore::new());
    let checkpointer = Arc::new(MemorySaver::new());

    let first_llm = StubLlm::new(vec![StubLlm::research("rust news"), StubLlm::finish()]);
    let first = build_agent(first_llm, store.clone(), checkpointer.clone());
    let envelopes = run_to_end(&first, "What is new in Rust?", None).await;
    let thread_id = thread_id_of(&envelopes);

    // Fresh engine instance over the same stores: a process restart.
    let second_llm = StubLlm::new(vec![StubLlm::finish()]);
    let second = build_agent(second_llm.clone(), store.clone(), checkpointer.clone());
    let followup = run_to_end(&second, "And the week before?", Some(thread_id.clone())).await;
    assert_eq!(followup.last().unwrap().event_type, EventType::Complete);

    // The resumed supervisor saw the summary, an empty history, and an
    // incremented report version.
    let supervisor_prompt = second_llm
        .prompts_seen()
        .into_iter()
        .find(|p| p.contains("Decide the next step"))
        .expect("supervisor prompt");
    assert!(supervisor_prompt.contains("The user asked a question and got an answer."));
    assert!(supervisor_prompt.contains("Recent messages:\n(empty)"));
    assert!(supervisor_prompt.contains("Report revision: 2"));

    let latest = checkpointer
        .get_latest(&CheckpointConfig::new(&thread_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.state["current_report_version"], 2);

    // Four messages now: two turns.
    let history = store.get_history(&thread_id).await.unwrap();
    assert_eq!(history.len(), 4);
    let indices: Vec<i64> = history.iter().map(|m| m.message.message_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn e5_resume_with_sqlite_backing() {
    use augur::store::SqliteMessageStore;
    use graphflow_checkpoint::SqliteSaver;
    use sqlx::sqlite::SqlitePoolOptions;

    let dir = tempfile::tempdir().unwrap();
    let dsn = format!("sqlite://{}?mode=rwc", dir.path().join("augur.db").display());

    let thread_id = {
        let pool = SqlitePoolOptions::new().max_connections(1).connect(&dsn).await.unwrap();
        let store = Arc::new(SqliteMessageStore::new(pool.clone()).await.unwrap());
        let checkpointer = Arc::new(SqliteSaver::new(pool).await.unwrap());
        let agent = Agent::new(GraphDeps {
            llm: StubLlm::new(vec![StubLlm::finish()]),
            name_llm: StubLlm::new(vec![]),
            search: StubSearch::new(),
            catalog: Arc::new(StubCatalog),
            store,
            checkpointer,
            url_dedup: UrlDeduper::new(),
            settings: Settings::default(),
        })
        .unwrap();
        let envelopes = run_to_end(&agent, "first question", None).await;
        thread_id_of(&envelopes)
    };

    // Everything from the first "process" is gone except the files.
    let pool = SqlitePoolOptions::new().max_connections(1).connect(&dsn).await.unwrap();
    let store = Arc::new(SqliteMessageStore::new(pool.clone()).await.unwrap());
    let checkpointer = Arc::new(SqliteSaver::new(pool).await.unwrap());
    let agent = Agent::new(GraphDeps {
        llm: StubLlm::new(vec![StubLlm::finish()]),
        name_llm: StubLlm::new(vec![]),
        search: StubSearch::new(),
        catalog: Arc::new(StubCatalog),
        store: store.clone(),
        checkpointer,
        url_dedup: UrlDeduper::new(),
        settings: Settings::default(),
    })
    .unwrap();

    let envelopes = run_to_end(&agent, "second question", Some(thread_id.clone())).await;
    assert_eq!(envelopes.last().unwrap().event_type, EventType::Complete);

    let history = store.get_history(&thread_id).await.unwrap();
    assert_eq!(history.len(), 4);
    let indices: Vec<i64> = history.iter().map(|m| m.message.message_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn empty_followup_is_refused() {
    let h = harness(StubLlm::new(vec![StubLlm::finish()]));
    let envelopes = run_to_end(&h.agent, "2+2", None).await;
    let thread_id = thread_id_of(&envelopes);

    let before = h
        .checkpointer
        .list(&CheckpointConfig::new(&thread_id))
        .await
        .unwrap()
        .len();

    let refused = run_to_end(&h.agent, "   ", Some(thread_id.clone())).await;
    assert_eq!(refused.len(), 1);
    assert_eq!(refused[0].event_type, EventType::System);

    let after = h
        .checkpointer
        .list(&CheckpointConfig::new(&thread_id))
        .await
        .unwrap()
        .len();
    assert_eq!(before, after);
    assert_eq!(h.store.get_history(&thread_id).await.unwrap().len(), 2);
}

/// A chat model that fails every structured call.
struct FailingLlm;

#[async_trait]
impl ChatModel for FailingLlm {
    async fn complete(&self, _prompt: &str) -> drivers::Result<String> {
        Ok("unused".to_string())
    }

    async fn complete_structured(&self, _prompt: &str, _schema: &Value) -> drivers::Result<Value> {
        Err(drivers::DriverError::InvalidRequest("schema rejected".to_string()))
    }
}

#[tokio::test]
async fn node_failure_surfaces_error_and_persists_nothing() {
    let store = Arc::new(MemoryMessageStore::new());
    let checkpointer = Arc::new(MemorySaver::new());
    let agent = Agent::new(GraphDeps {
        llm: Arc::new(FailingLlm),
        name_llm: Arc::new(FailingLlm),
        search: StubSearch::new(),
        catalog: Arc::new(StubCatalog),
        store: store.clone(),
        checkpointer,
        url_dedup: UrlDeduper::new(),
        settings: Settings::default(),
    })
    .unwrap();

    let envelopes = run_to_end(&agent, "anything", None).await;
    let thread_id = thread_id_of(&envelopes);

    // The failing node emitted its one custom/error, then the engine
    // appended the terminal error envelope.
    assert_eq!(customs(&envelopes, "error").len(), 1);
    assert_eq!(envelopes.last().unwrap().event_type, EventType::Error);
    assert!(envelopes.iter().all(|e| e.event_type != EventType::Complete));

    // No assistant message was persisted.
    assert!(store.get_history(&thread_id).await.unwrap().is_empty());
}
