//! State schema and reducer table.
//!
//! Graph state is a JSON object. Nodes never mutate it directly: they
//! return *partial updates*, and the engine merges each updated field
//! through the reducer registered for it in the [`StateSchema`]. The
//! default reducer replaces the old value; append-only fields register
//! [`ConcatReducer`]; fields with richer merge semantics (such as a
//! bounded conversation history) register a custom [`Reducer`]
//! implementation.
//!
//! This table is the single source of truth for merge behavior. Nodes
//! returning a concat-reduced field must return **new items only** -
//! returning the pre-existing contents would duplicate them, which is
//! exactly the resume bug the explicit table exists to prevent.
//!
//! # Example
//!
//! ```rust
//! use graphflow_core::state::{ConcatReducer, StateSchema};
//! use serde_json::json;
//!
//! let mut schema = StateSchema::new();
//! schema.add_field("research_notes", Box::new(ConcatReducer));
//!
//! let mut state = json!({"research_notes": ["note one"], "iterations": 1});
//! schema
//!     .apply(&mut state, &json!({"research_notes": ["note two"], "iterations": 2}))
//!     .unwrap();
//!
//! assert_eq!(state["research_notes"], json!(["note one", "note two"]));
//! assert_eq!(state["iterations"], json!(2));
//! ```

use serde_json::Value;
use std::collections::HashMap;

use crate::error::{GraphError, Result};

/// Deterministic merge function for one named state field.
pub trait Reducer: Send + Sync {
    /// Merge `update` into `current`. `current` is `Null` when the field
    /// has never been written.
    fn reduce(&self, current: &Value, update: &Value) -> Result<Value>;

    /// Human-readable name, used in error messages.
    fn name(&self) -> &str;
}

/// Last write wins. The default for fields without an explicit entry.
#[derive(Debug, Clone)]
pub struct OverwriteReducer;

impl Reducer for OverwriteReducer {
    fn reduce(&self, _current: &Value, update: &Value) -> Result<Value> {
        Ok(update.clone())
    }

    fn name(&self) -> &str {
        "overwrite"
    }
}

/// Append-only concatenation for list fields.
///
/// The update must be an array of new items; it is appended to the
/// current array (or becomes the array when the field is unset). Updates
/// from parallel branches are applied in branch-index order, so the
/// final list is the branch results concatenated deterministically.
#[derive(Debug, Clone)]
pub struct ConcatReducer;

impl Reducer for ConcatReducer {
    fn reduce(&self, current: &Value, update: &Value) -> Result<Value> {
        let additions = update.as_array().ok_or_else(|| GraphError::Reducer {
            field: String::new(),
            message: "concat update must be an array of new items".to_string(),
        })?;

        match current {
            Value::Array(existing) => {
                let mut merged = existing.clone();
                merged.extend_from_slice(additions);
                Ok(Value::Array(merged))
            }
            Value::Null => Ok(Value::Array(additions.clone())),
            _ => Err(GraphError::Reducer {
                field: String::new(),
                message: "concat target is not an array".to_string(),
            }),
        }
    }

    fn name(&self) -> &str {
        "concat"
    }
}

/// Field-name to reducer table for one graph's state.
#[derive(Default)]
pub struct StateSchema {
    fields: HashMap<String, Box<dyn Reducer>>,
}

impl StateSchema {
    /// Empty schema; every field falls back to overwrite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reducer for a field.
    pub fn add_field(&mut self, field: impl Into<String>, reducer: Box<dyn Reducer>) {
        self.fields.insert(field.into(), reducer);
    }

    /// Builder-style variant of [`add_field`](Self::add_field).
    pub fn with_field(mut self, field: impl Into<String>, reducer: Box<dyn Reducer>) -> Self {
        self.add_field(field, reducer);
        self
    }

    /// The reducer registered for `field`, if any.
    pub fn reducer(&self, field: &str) -> Option<&dyn Reducer> {
        self.fields.get(field).map(|r| r.as_ref())
    }

    /// Merge a partial update into `state`, field by field.
    ///
    /// Fields without a registered reducer are overwritten. The update is
    /// applied atomically from the caller's perspective: on error the
    /// state may be partially modified, so callers apply updates to a
    /// clone and swap on success (the engine does).
    pub fn apply(&self, state: &mut Value, update: &Value) -> Result<()> {
        let state_obj = state.as_object_mut().ok_or_else(|| {
            GraphError::Internal("graph state must be a JSON object".to_string())
        })?;
        let update_obj = update.as_object().ok_or_else(|| {
            GraphError::Internal("node update must be a JSON object".to_string())
        })?;

        for (field, update_value) in update_obj {
            let current = state_obj.get(field).cloned().unwrap_or(Value::Null);
            let merged = match self.reducer(field) {
                Some(reducer) => reducer.reduce(&current, update_value).map_err(|e| match e {
                    GraphError::Reducer { message, .. } => GraphError::Reducer {
                        field: field.clone(),
                        message,
                    },
                    other => other,
                })?,
                None => update_value.clone(),
            };
            state_obj.insert(field.clone(), merged);
        }

        Ok(())
    }
}
