//! Dynamic fan-out primitive.
//!
//! A conditional router normally names the next node. When it returns
//! [`RouteResult::Sends`], the engine instead schedules one parallel
//! branch of the target node *per* [`Send`], each branch receiving the
//! state carried by its `Send`. Branch results are merged through the
//! reducer table in branch-index order, which makes the merge
//! deterministic regardless of completion order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::NodeId;

/// One parallel branch: a target node plus the state that branch runs on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Send {
    node: NodeId,
    state: Value,
}

impl Send {
    /// Create a branch invocation of `node` with `state` as its input.
    pub fn new(node: impl Into<NodeId>, state: Value) -> Self {
        Self {
            node: node.into(),
            state,
        }
    }

    /// Target node name.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Branch input state.
    pub fn state(&self) -> &Value {
        &self.state
    }

    /// Decompose into `(node, state)`.
    pub fn into_parts(self) -> (NodeId, Value) {
        (self.node, self.state)
    }
}

/// What a conditional router resolved to.
#[derive(Debug, Clone)]
pub enum RouteResult {
    /// Continue with a single node.
    Next(NodeId),

    /// Fan out: one branch per `Send`, merged in branch-index order.
    Sends(Vec<Send>),

    /// The run is finished.
    End,
}

impl From<&str> for RouteResult {
    fn from(node: &str) -> Self {
        RouteResult::Next(node.to_string())
    }
}

impl From<String> for RouteResult {
    fn from(node: String) -> Self {
        RouteResult::Next(node)
    }
}

impl From<Vec<Send>> for RouteResult {
    fn from(sends: Vec<Send>) -> Self {
        RouteResult::Sends(sends)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn send_round_trips_parts() {
        let send = Send::new("perform_search", json!({"query": "rust"}));
        assert_eq!(send.node(), "perform_search");
        let (node, state) = send.into_parts();
        assert_eq!(node, "perform_search");
        assert_eq!(state, json!({"query": "rust"}));
    }

    #[test]
    fn route_result_conversions() {
        match RouteResult::from("supervisor") {
            RouteResult::Next(node) => assert_eq!(node, "supervisor"),
            other => panic!("unexpected route: {other:?}"),
        }

        let sends = vec![Send::new("a", json!({})), Send::new("b", json!({}))];
        match RouteResult::from(sends) {
            RouteResult::Sends(sends) => assert_eq!(sends.len(), 2),
            other => panic!("unexpected route: {other:?}"),
        }
    }
}
