//! # graphflow-core
//!
//! Typed state-machine execution engine for streaming agent workflows.
//!
//! A graph is a set of named async nodes connected by direct and
//! conditional edges. Graph state is a JSON object merged through an
//! explicit per-field reducer table; nodes return partial updates and
//! never touch state directly. The engine drives a compiled graph to
//! termination, checkpoints the state after every step, fans out
//! parallel branches through the [`Send`](send::Send) primitive with a
//! deterministic merge, and streams normalized event
//! [`Envelope`](event::Envelope)s plus per-node update records through
//! a bounded per-run bus.
//!
//! ## Module layering
//!
//! - [`state`] - reducers and the schema table (leaf)
//! - [`event`] - envelopes, the closed event-type sum, and the bus
//! - [`send`] - the fan-out primitive
//! - [`context`] - per-run services handed to nodes
//! - [`graph`] - structure, builder, validation
//! - [`engine`] - the run loop
//!
//! Checkpoint persistence lives in the `graphflow-checkpoint` crate and
//! is attached via [`CompiledGraph::with_checkpointer`].
//!
//! ## Example
//!
//! ```rust
//! use graphflow_core::engine::RunConfig;
//! use graphflow_core::event::EngineOutput;
//! use graphflow_core::graph::{StateGraph, END};
//! use graphflow_core::state::{ConcatReducer, StateSchema};
//! use serde_json::json;
//! use tokio_stream::StreamExt;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut schema = StateSchema::new();
//! schema.add_field("notes", Box::new(ConcatReducer));
//!
//! let mut graph = StateGraph::new(schema);
//! graph.add_node("gather", |_ctx, _state| async {
//!     Ok(json!({"notes": ["observed one thing"]}))
//! });
//! graph.set_entry("gather");
//! graph.add_edge("gather", END);
//!
//! let mut stream = graph.compile().unwrap().run(json!({"notes": []}), RunConfig::new("t1"));
//! while let Some(output) = stream.next().await {
//!     if let EngineOutput::Done(state) = output {
//!         assert_eq!(state["notes"], json!(["observed one thing"]));
//!     }
//! }
//! # }
//! ```

pub mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod graph;
pub mod send;
pub mod state;

pub use context::{cancel_pair, CancelHandle, CancelToken, NodeContext};
pub use engine::RunConfig;
pub use error::{GraphError, Result};
pub use event::{EngineOutput, Envelope, EventSink, EventType, TraceKind};
pub use graph::{CompiledGraph, NodeId, StateGraph, END, START};
pub use send::{RouteResult, Send};
pub use state::{ConcatReducer, OverwriteReducer, Reducer, StateSchema};
