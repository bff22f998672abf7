//! The execution engine.
//!
//! [`CompiledGraph::run`] drives a graph from its entry node to
//! termination on a spawned task and streams [`EngineOutput`]s through a
//! bounded channel: event envelopes as nodes emit them, an `Updates`
//! record after each applied node step, and a final `Done` carrying the
//! terminal state on success.
//!
//! Per step the engine: invokes the node with an immutable state view,
//! applies the returned partial update through the reducer table onto a
//! clone (so a failing reducer never leaves half-applied state), emits
//! the `Updates` record and an auto-derived `state_update` envelope for
//! the configured field set, persists a checkpoint chained onto the
//! previous one, and consults the node's outgoing edge for the next
//! target. A conditional router may fan out via [`Send`]s: branches run
//! concurrently on spawned tasks, but their updates are merged and
//! emitted strictly in branch-index order, which keeps the merge
//! deterministic regardless of completion timing.
//!
//! Cancellation is checked between nodes and before each branch spawn.
//! In-flight work runs to completion and its output is discarded; a
//! cancelled run emits neither `complete` nor `error`.
//!
//! [`Send`]: crate::send::Send

use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use graphflow_checkpoint::{Checkpoint, CheckpointConfig};

use crate::context::{CancelToken, NodeContext};
use crate::error::{GraphError, Result};
use crate::event::{EngineOutput, Envelope, EventSink};
use crate::graph::{CompiledGraph, NodeId, NodeSpec, Edge, END};
use crate::send::{RouteResult, Send as BranchSend};

/// Per-run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Thread the run is keyed under.
    pub thread_id: String,

    /// Checkpoint namespace; empty for the main graph, the subgraph
    /// name for nested runs.
    pub namespace: String,

    /// Cancellation signal carried by the request context.
    pub cancel: CancelToken,

    /// Event bus capacity. Sized for a run; the engine back-pressures
    /// node emission instead of dropping events.
    pub buffer: usize,
}

impl RunConfig {
    /// Config for a main-graph run on `thread_id`.
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            namespace: String::new(),
            cancel: CancelToken::never(),
            buffer: 256,
        }
    }

    /// Scope checkpoints to a subgraph namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Attach a cancellation token.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

enum Target {
    Node(NodeId),
    Fanout(Vec<BranchSend>),
    End,
}

impl CompiledGraph {
    /// Drive the graph to termination, streaming outputs.
    ///
    /// The returned stream yields envelopes and updates as they happen,
    /// then exactly one of: a `complete` envelope followed by
    /// [`EngineOutput::Done`] on success, an `error` envelope on
    /// failure, or nothing further on cancellation.
    pub fn run(&self, initial_state: Value, config: RunConfig) -> ReceiverStream<EngineOutput> {
        let (tx, rx) = mpsc::channel(config.buffer);
        let graph = self.clone();

        tokio::spawn(async move {
            let sink = EventSink::new(tx);
            match graph.drive(initial_state, &config, &sink).await {
                Ok(final_state) => {
                    let response = graph
                        .inner
                        .completion_field
                        .as_deref()
                        .and_then(|field| final_state.get(field))
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    sink.send(Envelope::complete(response)).await;
                    sink.send_output(EngineOutput::Done(final_state)).await;
                }
                Err(err) if err.is_cancelled() => {
                    tracing::debug!(thread_id = %config.thread_id, "run cancelled");
                }
                Err(err) => {
                    tracing::error!(thread_id = %config.thread_id, error = %err, "run failed");
                    sink.send(Envelope::error(err.envelope_message())).await;
                }
            }
        });

        ReceiverStream::new(rx)
    }

    async fn drive(&self, mut state: Value, config: &RunConfig, sink: &EventSink) -> Result<Value> {
        let ckpt_config =
            CheckpointConfig::new(&config.thread_id).with_namespace(&config.namespace);
        let mut parent_id = match &self.checkpointer {
            Some(saver) => saver.get_latest(&ckpt_config).await?.map(|c| c.id),
            None => None,
        };

        let mut visits: HashMap<NodeId, usize> = HashMap::new();
        let mut target = Target::Node(self.coerce_cap(self.inner.entry.clone(), &visits));

        loop {
            if config.cancel.is_cancelled() || sink.is_closed() {
                return Err(GraphError::Cancelled);
            }

            let completed = match target {
                Target::End => break,
                Target::Node(name) => {
                    *visits.entry(name.clone()).or_insert(0) += 1;
                    let update = self.invoke(&name, state.clone(), config, sink).await?;
                    self.apply_step(&name, vec![update], &mut state, sink).await?;
                    name
                }
                Target::Fanout(sends) => {
                    let node = sends
                        .first()
                        .map(|s| s.node().to_string())
                        .ok_or_else(|| GraphError::Internal("empty fan-out".to_string()))?;

                    let mut handles = Vec::with_capacity(sends.len());
                    for send in sends {
                        if config.cancel.is_cancelled() {
                            return Err(GraphError::Cancelled);
                        }
                        let (branch_node, branch_state) = send.into_parts();
                        *visits.entry(branch_node.clone()).or_insert(0) += 1;
                        let spec = self.spec(&branch_node)?.clone();
                        let ctx = self.node_context(&branch_node, config, sink);
                        handles.push(tokio::spawn(async move {
                            (spec.func)(ctx, branch_state).await
                        }));
                    }

                    // All branches complete before anything is merged;
                    // results are then applied in branch-index order.
                    let mut branch_updates = Vec::with_capacity(handles.len());
                    for handle in handles {
                        let update = handle
                            .await
                            .map_err(|e| GraphError::Internal(format!("branch task: {e}")))?;
                        branch_updates.push(update);
                    }
                    let branch_updates: Vec<Value> =
                        branch_updates.into_iter().collect::<Result<_>>()?;

                    self.apply_step(&node, branch_updates, &mut state, sink).await?;
                    node
                }
            };

            parent_id = self.persist(&ckpt_config, &state, parent_id).await?;
            target = self.route(&completed, &state, &visits)?;
        }

        Ok(state)
    }

    async fn invoke(
        &self,
        name: &str,
        state: Value,
        config: &RunConfig,
        sink: &EventSink,
    ) -> Result<Value> {
        tracing::debug!(node = %name, thread_id = %config.thread_id, "executing node");
        let spec = self.spec(name)?;
        let ctx = self.node_context(name, config, sink);
        (spec.func)(ctx, state).await
    }

    /// Apply one step's updates (one per branch for a fan-out) through
    /// the reducers, emit per-branch `Updates` in order, then at most one
    /// `state_update` envelope covering the configured fields touched.
    async fn apply_step(
        &self,
        node: &str,
        updates: Vec<Value>,
        state: &mut Value,
        sink: &EventSink,
    ) -> Result<()> {
        let mut touched: Vec<&str> = Vec::new();

        let mut next_state = state.clone();
        for update in &updates {
            self.inner.schema.apply(&mut next_state, update)?;
            if let Some(obj) = update.as_object() {
                for field in self.inner.state_update_fields.iter() {
                    if obj.contains_key(field) && !touched.contains(&field.as_str()) {
                        touched.push(field.as_str());
                    }
                }
            }
        }
        *state = next_state;

        for update in updates {
            sink.send_output(EngineOutput::Updates {
                node: node.to_string(),
                update,
            })
            .await;
        }

        if !touched.is_empty() {
            let mut snapshot = Map::new();
            for field in touched {
                snapshot.insert(field.to_string(), state[field].clone());
            }
            sink.send(Envelope::state_update(node, Value::Object(snapshot))).await;
        }

        Ok(())
    }

    async fn persist(
        &self,
        config: &CheckpointConfig,
        state: &Value,
        parent_id: Option<String>,
    ) -> Result<Option<String>> {
        match &self.checkpointer {
            Some(saver) => {
                let checkpoint = Checkpoint::new(state.clone(), parent_id);
                let id = checkpoint.id.clone();
                saver.put(config, checkpoint).await?;
                Ok(Some(id))
            }
            None => Ok(parent_id),
        }
    }

    fn route(&self, from: &str, state: &Value, visits: &HashMap<NodeId, usize>) -> Result<Target> {
        let edge = match self.inner.edges.get(from) {
            Some(edge) => edge,
            None => return Ok(Target::End),
        };

        let result = match edge {
            Edge::Direct(to) => RouteResult::Next(to.clone()),
            Edge::Conditional(router) => router(state),
        };

        match result {
            RouteResult::Next(node) if node == END => Ok(Target::End),
            RouteResult::Next(node) => {
                let node = self.coerce_cap(node, visits);
                if !self.inner.nodes.contains_key(&node) {
                    return Err(GraphError::InvalidGraph(format!(
                        "router returned unknown node '{node}'"
                    )));
                }
                Ok(Target::Node(node))
            }
            RouteResult::Sends(sends) if sends.is_empty() => {
                Err(GraphError::Internal("router returned an empty fan-out".to_string()))
            }
            RouteResult::Sends(sends) => {
                for send in &sends {
                    if !self.inner.nodes.contains_key(send.node()) {
                        return Err(GraphError::InvalidGraph(format!(
                            "fan-out targets unknown node '{}'",
                            send.node()
                        )));
                    }
                }
                Ok(Target::Fanout(sends))
            }
            RouteResult::End => Ok(Target::End),
        }
    }

    /// Coerce a routed target to its cap fallback once the re-entry
    /// bound is reached. Silent on purpose: the cap is a routing rule,
    /// not an error.
    fn coerce_cap(&self, node: NodeId, visits: &HashMap<NodeId, usize>) -> NodeId {
        if let Some(cap) = self.inner.visit_caps.get(&node) {
            let seen = visits.get(&node).copied().unwrap_or(0);
            if seen >= cap.cap {
                tracing::debug!(node = %node, cap = cap.cap, fallback = %cap.fallback,
                    "visit cap reached, rerouting");
                return cap.fallback.clone();
            }
        }
        node
    }

    fn spec(&self, name: &str) -> Result<&NodeSpec> {
        self.inner
            .nodes
            .get(name)
            .ok_or_else(|| GraphError::InvalidGraph(format!("unknown node '{name}'")))
    }

    fn node_context(&self, name: &str, config: &RunConfig, sink: &EventSink) -> NodeContext {
        NodeContext {
            node: name.to_string(),
            thread_id: config.thread_id.clone(),
            events: sink.clone(),
            cancel: config.cancel.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::cancel_pair;
    use crate::event::EventType;
    use crate::graph::StateGraph;
    use crate::state::{ConcatReducer, StateSchema};
    use graphflow_checkpoint::{CheckpointSaver, MemorySaver};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    async fn collect(mut stream: ReceiverStream<EngineOutput>) -> Vec<EngineOutput> {
        let mut outputs = Vec::new();
        while let Some(output) = stream.next().await {
            outputs.push(output);
        }
        outputs
    }

    fn envelopes(outputs: &[EngineOutput]) -> Vec<&Envelope> {
        outputs
            .iter()
            .filter_map(|o| match o {
                EngineOutput::Event(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    fn final_state(outputs: &[EngineOutput]) -> Option<&Value> {
        outputs.iter().find_map(|o| match o {
            EngineOutput::Done(state) => Some(state),
            _ => None,
        })
    }

    fn linear_graph() -> CompiledGraph {
        let mut schema = StateSchema::new();
        schema.add_field("log", Box::new(ConcatReducer));

        let mut graph = StateGraph::new(schema);
        graph.add_node("first", |_ctx, _state| async {
            Ok(json!({"log": ["first"], "answer": "partial"}))
        });
        graph.add_node("second", |_ctx, _state| async {
            Ok(json!({"log": ["second"], "answer": "done"}))
        });
        graph.set_entry("first");
        graph.add_edge("first", "second");
        graph.add_edge("second", END);
        graph.compile().unwrap()
    }

    #[tokio::test]
    async fn linear_run_applies_reducers_and_completes() {
        let outputs = collect(
            linear_graph().run(json!({"log": []}), RunConfig::new("t1")),
        )
        .await;

        let state = final_state(&outputs).expect("run should succeed");
        assert_eq!(state["log"], json!(["first", "second"]));
        assert_eq!(state["answer"], "done");

        let updates: Vec<&str> = outputs
            .iter()
            .filter_map(|o| match o {
                EngineOutput::Updates { node, .. } => Some(node.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(updates, vec!["first", "second"]);

        let last_envelope = envelopes(&outputs).last().cloned().cloned().unwrap();
        assert_eq!(last_envelope.event_type, EventType::Complete);
    }

    #[tokio::test]
    async fn state_update_envelope_covers_configured_fields_only() {
        let mut schema = StateSchema::new();
        schema.add_field("log", Box::new(ConcatReducer));
        let mut graph = StateGraph::new(schema);
        graph.add_node("only", |_ctx, _state| async {
            Ok(json!({"log": ["x"], "hidden": 42}))
        });
        graph.set_entry("only");
        graph.add_edge("only", END);
        graph.add_state_update_field("log");
        let compiled = graph.compile().unwrap();

        let outputs = collect(compiled.run(json!({}), RunConfig::new("t1"))).await;
        let snapshot = envelopes(&outputs)
            .into_iter()
            .find(|e| e.event_type == EventType::StateUpdate)
            .expect("state_update expected");
        assert_eq!(snapshot.payload, json!({"log": ["x"]}));
        assert!(snapshot.payload.get("hidden").is_none());
    }

    #[tokio::test]
    async fn fanout_merges_in_branch_index_order() {
        let mut schema = StateSchema::new();
        schema.add_field("results", Box::new(ConcatReducer));

        let mut graph = StateGraph::new(schema);
        graph.add_node("plan", |_ctx, _state| async { Ok(json!({})) });
        graph.add_node("work", |_ctx, state: Value| async move {
            let index = state["index"].as_u64().unwrap();
            // Later branches finish first; merge order must not care.
            tokio::time::sleep(Duration::from_millis(30 - 10 * index)).await;
            Ok(json!({"results": [format!("branch-{index}")]}))
        });
        graph.set_entry("plan");
        graph.add_conditional_edge("plan", |_state| {
            RouteResult::Sends(
                (0..3)
                    .map(|i| BranchSend::new("work", json!({"index": i})))
                    .collect(),
            )
        });
        graph.add_edge("work", END);
        let compiled = graph.compile().unwrap();

        let outputs = collect(compiled.run(json!({"results": []}), RunConfig::new("t1"))).await;
        let state = final_state(&outputs).expect("run should succeed");
        assert_eq!(
            state["results"],
            json!(["branch-0", "branch-1", "branch-2"])
        );

        // Per-branch updates surface after all branches, in branch order.
        let update_count = outputs
            .iter()
            .filter(|o| matches!(o, EngineOutput::Updates { node, .. } if node == "work"))
            .count();
        assert_eq!(update_count, 3);
    }

    #[tokio::test]
    async fn visit_cap_coerces_routing_to_fallback() {
        let mut graph = StateGraph::new(StateSchema::new());
        graph.add_node("loop", |_ctx, state: Value| async move {
            let n = state["n"].as_u64().unwrap_or(0);
            Ok(json!({"n": n + 1}))
        });
        graph.add_node("finish", |_ctx, _state| async { Ok(json!({"done": true})) });
        graph.set_entry("loop");
        graph.add_conditional_edge("loop", |_state| RouteResult::Next("loop".to_string()));
        graph.add_edge("finish", END);
        graph.add_visit_cap("loop", 3, "finish");
        let compiled = graph.compile().unwrap();

        let outputs = collect(compiled.run(json!({"n": 0}), RunConfig::new("t1"))).await;
        let state = final_state(&outputs).expect("run should succeed");
        assert_eq!(state["n"], 3);
        assert_eq!(state["done"], true);

        // The cap reroutes silently.
        assert!(envelopes(&outputs)
            .iter()
            .all(|e| e.event_type != EventType::Error));
    }

    #[tokio::test]
    async fn checkpoints_chain_parent_ids() {
        let saver = Arc::new(MemorySaver::new());
        let compiled = linear_graph().with_checkpointer(saver.clone());

        collect(compiled.run(json!({"log": []}), RunConfig::new("t1"))).await;

        let lineage = saver
            .list(&CheckpointConfig::new("t1"))
            .await
            .unwrap();
        assert_eq!(lineage.len(), 2);
        assert!(lineage[0].parent_id.is_none());
        assert_eq!(lineage[1].parent_id.as_deref(), Some(lineage[0].id.as_str()));
    }

    #[tokio::test]
    async fn resumed_run_chains_onto_existing_leaf() {
        let saver = Arc::new(MemorySaver::new());
        let compiled = linear_graph().with_checkpointer(saver.clone());

        collect(compiled.run(json!({"log": []}), RunConfig::new("t1"))).await;
        collect(compiled.run(json!({"log": []}), RunConfig::new("t1"))).await;

        let lineage = saver.list(&CheckpointConfig::new("t1")).await.unwrap();
        assert_eq!(lineage.len(), 4);
        assert_eq!(lineage[2].parent_id.as_deref(), Some(lineage[1].id.as_str()));
    }

    #[tokio::test]
    async fn failing_node_emits_error_envelope_and_no_done() {
        let mut graph = StateGraph::new(StateSchema::new());
        graph.add_node("boom", |_ctx, _state| async {
            Err(GraphError::NodeFailed {
                node: "boom".to_string(),
                message: "driver exploded".to_string(),
            })
        });
        graph.set_entry("boom");
        graph.add_edge("boom", END);
        let compiled = graph.compile().unwrap();

        let outputs = collect(compiled.run(json!({}), RunConfig::new("t1"))).await;
        assert!(final_state(&outputs).is_none());

        let last = envelopes(&outputs).last().cloned().cloned().unwrap();
        assert_eq!(last.event_type, EventType::Error);
        assert!(last.payload["error"].as_str().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn cancelled_run_emits_no_terminal_envelope() {
        let (handle, token) = cancel_pair();
        handle.cancel();

        let outputs = collect(
            linear_graph().run(json!({"log": []}), RunConfig::new("t1").with_cancel(token)),
        )
        .await;

        assert!(outputs.is_empty());
    }

    #[tokio::test]
    async fn completion_field_fills_response() {
        let mut graph = StateGraph::new(StateSchema::new());
        graph.add_node("answer", |_ctx, _state| async {
            Ok(json!({"final_report": "forty-two"}))
        });
        graph.set_entry("answer");
        graph.add_edge("answer", END);
        graph.set_completion_field("final_report");
        let compiled = graph.compile().unwrap();

        let outputs = collect(compiled.run(json!({}), RunConfig::new("t1"))).await;
        let last = envelopes(&outputs).last().cloned().cloned().unwrap();
        assert_eq!(last.event_type, EventType::Complete);
        assert_eq!(last.payload, json!({"response": "forty-two"}));
    }
}
