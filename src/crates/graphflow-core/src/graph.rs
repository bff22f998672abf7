//! Graph structure and the builder that compiles it.
//!
//! A graph is a set of named nodes plus, per node, at most one outgoing
//! [`Edge`]: either a direct transition or a conditional router that
//! inspects the current state and returns a [`RouteResult`]. The
//! [`StateGraph`] builder accumulates nodes, edges, the reducer
//! [`StateSchema`], the state-update field set, and per-node visit caps,
//! then validates everything into an executable [`CompiledGraph`].
//!
//! Layering is strict: reducers and state shapes are leaves, nodes
//! depend on them, graphs depend on nodes by name, and the engine
//! (`engine` module) drives compiled graphs. Nothing here calls back up.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use graphflow_checkpoint::CheckpointSaver;

use crate::context::NodeContext;
use crate::error::{GraphError, Result};
use crate::send::RouteResult;
use crate::state::StateSchema;

/// Node identifier, unique within a graph.
pub type NodeId = String;

/// Virtual entry marker.
pub const START: &str = "__start__";

/// Virtual terminal marker.
pub const END: &str = "__end__";

/// Boxed future returned by node executors.
pub type NodeFuture = BoxFuture<'static, Result<Value>>;

/// A node executor: immutable state view in, partial update out.
pub type NodeFn = Arc<dyn Fn(NodeContext, Value) -> NodeFuture + Send + Sync>;

/// A conditional router: pure function of current state.
pub type RouterFn = Arc<dyn Fn(&Value) -> RouteResult + Send + Sync>;

/// A named node and its executor.
#[derive(Clone)]
pub struct NodeSpec {
    /// Unique node name.
    pub name: NodeId,
    /// The executor invoked by the engine.
    pub func: NodeFn,
}

impl std::fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSpec").field("name", &self.name).finish()
    }
}

/// Outgoing transition of a node.
#[derive(Clone)]
pub enum Edge {
    /// Unconditional transition. `END` terminates the run.
    Direct(NodeId),
    /// Router consulted with the post-step state.
    Conditional(RouterFn),
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Edge::Direct(node) => f.debug_tuple("Direct").field(node).finish(),
            Edge::Conditional(_) => f.debug_tuple("Conditional").field(&"<router>").finish(),
        }
    }
}

/// Re-entry bound for one node.
#[derive(Debug, Clone)]
pub struct VisitCap {
    /// Maximum number of invocations within a single run.
    pub cap: usize,
    /// Node the router result is coerced to once the cap is reached.
    pub fallback: NodeId,
}

/// Builder for executable graphs.
pub struct StateGraph {
    nodes: HashMap<NodeId, NodeSpec>,
    edges: HashMap<NodeId, Edge>,
    entry: Option<NodeId>,
    schema: StateSchema,
    state_update_fields: Vec<String>,
    visit_caps: HashMap<NodeId, VisitCap>,
    completion_field: Option<String>,
}

impl StateGraph {
    /// Start a graph over the given reducer table.
    pub fn new(schema: StateSchema) -> Self {
        Self {
            nodes: HashMap::new(),
            edges: HashMap::new(),
            entry: None,
            schema,
            state_update_fields: Vec::new(),
            visit_caps: HashMap::new(),
            completion_field: None,
        }
    }

    /// Register a node executor under `name`.
    pub fn add_node<F, Fut>(&mut self, name: impl Into<NodeId>, func: F) -> &mut Self
    where
        F: Fn(NodeContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let name = name.into();
        let func: NodeFn = Arc::new(move |ctx, state| Box::pin(func(ctx, state)));
        self.nodes.insert(name.clone(), NodeSpec { name, func });
        self
    }

    /// Set the node execution starts at.
    pub fn set_entry(&mut self, name: impl Into<NodeId>) -> &mut Self {
        self.entry = Some(name.into());
        self
    }

    /// Add an unconditional edge. `to` may be [`END`].
    pub fn add_edge(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> &mut Self {
        self.edges.insert(from.into(), Edge::Direct(to.into()));
        self
    }

    /// Add a conditional edge with a router function.
    pub fn add_conditional_edge<R>(&mut self, from: impl Into<NodeId>, router: R) -> &mut Self
    where
        R: Fn(&Value) -> RouteResult + Send + Sync + 'static,
    {
        self.edges.insert(from.into(), Edge::Conditional(Arc::new(router)));
        self
    }

    /// Declare a field whose post-step value is streamed as a
    /// `state_update` envelope whenever a step touches it.
    pub fn add_state_update_field(&mut self, field: impl Into<String>) -> &mut Self {
        self.state_update_fields.push(field.into());
        self
    }

    /// Name the state field whose terminal value becomes the `response`
    /// payload of the `complete` envelope.
    pub fn set_completion_field(&mut self, field: impl Into<String>) -> &mut Self {
        self.completion_field = Some(field.into());
        self
    }

    /// Bound re-entries of `node`; once `cap` invocations have happened,
    /// any route to it is coerced to `fallback`.
    pub fn add_visit_cap(
        &mut self,
        node: impl Into<NodeId>,
        cap: usize,
        fallback: impl Into<NodeId>,
    ) -> &mut Self {
        self.visit_caps.insert(
            node.into(),
            VisitCap {
                cap,
                fallback: fallback.into(),
            },
        );
        self
    }

    /// Validate the structure and produce an executable graph.
    pub fn compile(self) -> Result<CompiledGraph> {
        let entry = self
            .entry
            .ok_or_else(|| GraphError::InvalidGraph("no entry node set".to_string()))?;
        if !self.nodes.contains_key(&entry) {
            return Err(GraphError::InvalidGraph(format!(
                "entry node '{entry}' is not registered"
            )));
        }

        for (from, edge) in &self.edges {
            if from != START && !self.nodes.contains_key(from) {
                return Err(GraphError::InvalidGraph(format!(
                    "edge source '{from}' is not registered"
                )));
            }
            if let Edge::Direct(to) = edge {
                if to != END && !self.nodes.contains_key(to) {
                    return Err(GraphError::InvalidGraph(format!(
                        "edge target '{to}' is not registered"
                    )));
                }
            }
        }

        for (node, cap) in &self.visit_caps {
            if !self.nodes.contains_key(node) {
                return Err(GraphError::InvalidGraph(format!(
                    "visit cap on unknown node '{node}'"
                )));
            }
            if !self.nodes.contains_key(&cap.fallback) {
                return Err(GraphError::InvalidGraph(format!(
                    "visit cap fallback '{}' is not registered",
                    cap.fallback
                )));
            }
        }

        Ok(CompiledGraph {
            inner: Arc::new(GraphInner {
                nodes: self.nodes,
                edges: self.edges,
                entry,
                schema: self.schema,
                state_update_fields: self.state_update_fields,
                visit_caps: self.visit_caps,
                completion_field: self.completion_field,
            }),
            checkpointer: None,
        })
    }
}

pub(crate) struct GraphInner {
    pub(crate) nodes: HashMap<NodeId, NodeSpec>,
    pub(crate) edges: HashMap<NodeId, Edge>,
    pub(crate) entry: NodeId,
    pub(crate) schema: StateSchema,
    pub(crate) state_update_fields: Vec<String>,
    pub(crate) visit_caps: HashMap<NodeId, VisitCap>,
    pub(crate) completion_field: Option<String>,
}

/// A validated, executable graph. Cheap to clone; runs share structure.
#[derive(Clone)]
pub struct CompiledGraph {
    pub(crate) inner: Arc<GraphInner>,
    pub(crate) checkpointer: Option<Arc<dyn CheckpointSaver>>,
}

impl CompiledGraph {
    /// Attach a checkpoint saver; every subsequent run checkpoints after
    /// each step.
    pub fn with_checkpointer(mut self, saver: Arc<dyn CheckpointSaver>) -> Self {
        self.checkpointer = Some(saver);
        self
    }

    /// Entry node name.
    pub fn entry(&self) -> &str {
        &self.inner.entry
    }

    /// Registered node names, for diagnostics.
    pub fn node_names(&self) -> Vec<&str> {
        self.inner.nodes.keys().map(String::as_str).collect()
    }
}
