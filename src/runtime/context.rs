//! Versioned execution context document.
//!
//! All execution state lives here and in the step rows, externalized to the
//! store so a delayed continuation needs no retained in-memory state. The
//! full workflow definition is snapshotted in at start; steps and delayed
//! continuations always execute against the snapshot, never the live
//! definition.

use crate::contact::ContactSnapshot;
use crate::workflow::types::WorkflowDefinition;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Mutable context document for one execution
///
/// Persisted as JSON on the execution row alongside a version counter.
/// Writes go through an optimistic compare-and-swap on that counter; step
/// outputs are append-only keyed by step id, so a retried write can re-apply
/// its output onto a fresh read without losing sibling updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub contact_id: String,
    /// Contact snapshot taken at execution start
    pub contact: Value,
    /// Definition snapshot taken at execution start
    pub definition: WorkflowDefinition,
    /// Trigger-supplied and free variables
    pub variables: Map<String, Value>,
    /// Per-step outputs, append-only keyed by step id
    pub step_outputs: HashMap<String, Value>,
    /// Mirrors the store's context_version for optimistic writes
    pub version: i64,
}

impl ExecutionContext {
    pub fn new(
        execution_id: &str,
        definition: WorkflowDefinition,
        contact: &ContactSnapshot,
        trigger_data: &Value,
    ) -> Self {
        let variables = match trigger_data {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("trigger_data".to_string(), other.clone());
                map
            }
        };

        Self {
            execution_id: execution_id.to_string(),
            workflow_id: definition.id.clone(),
            contact_id: contact.id.clone(),
            contact: contact.to_value(),
            definition,
            variables,
            step_outputs: HashMap::new(),
            version: 0,
        }
    }

    /// Record one step's output
    pub fn record_output(&mut self, step_id: &str, output: Value) {
        self.step_outputs.insert(step_id.to_string(), output);
    }

    /// JSON scope used by template substitution and condition evaluation.
    /// Paths like `contact.email`, `variables.source`, and
    /// `steps.<id>.tracking_id` resolve against this document.
    pub fn scope(&self) -> Value {
        json!({
            "contact": self.contact,
            "variables": Value::Object(self.variables.clone()),
            "steps": self.step_outputs,
            "workflow": {
                "id": self.definition.id,
                "name": self.definition.name,
                "complexity": self.definition.metadata.complexity,
            },
        })
    }
}

/// Resolve a dotted path against a JSON scope document
pub fn lookup_path(scope: &Value, path: &str) -> Option<Value> {
    let selector = format!("$.{path}");
    match jsonpath_lib::select(scope, &selector) {
        Ok(matches) => matches.first().map(|v| (*v).clone()),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_resolves_nested_paths() {
        let scope = json!({"contact": {"email": "a@b.c", "plan": {"tier": "pro"}}});
        assert_eq!(lookup_path(&scope, "contact.email"), Some(json!("a@b.c")));
        assert_eq!(lookup_path(&scope, "contact.plan.tier"), Some(json!("pro")));
        assert_eq!(lookup_path(&scope, "contact.missing"), None);
    }
}
