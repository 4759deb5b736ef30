//! Execution context: the immutable value carrying everything a handler
//! may read.
//!
//! A context holds workflow inputs (set at construction, immutable
//! thereafter), per-node outputs (written once per successful completion,
//! insertion-ordered), workflow variables (last write wins), and
//! cross-branch shared memory (like variables, but namespaced and stamped
//! with the writing node for audit).
//!
//! Every mutating operation returns a *new* context. Internally the value
//! is `Arc`-shared and stored JSON trees sit behind their own `Arc`s, so a
//! store clones pointers rather than data; externally holders see a plain
//! value type that is safe to snapshot into concurrently running handlers.
//!
//! Loop and parallel frames are deliberately not part of the context —
//! they are passed to the resolver as parameters so nested iterations
//! cannot alias each other.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{FlowError, Result};

/// What to do when a size cap would be exceeded by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Fail the store; the scheduler marks the node failed with a
    /// `context_overflow` error.
    #[default]
    Reject,
    /// Drop the oldest node outputs (FIFO) until the store fits. Pruned
    /// node ids stay queryable so the scheduler knows they are gone.
    PruneOldest,
}

/// Optional size caps on the context.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextLimits {
    /// Cap on a single node output's serialized size.
    pub max_output_bytes: Option<usize>,
    /// Cap on the summed serialized size of all node outputs.
    pub max_total_bytes: Option<usize>,
    /// Cap on the number of stored node outputs.
    pub max_node_outputs: Option<usize>,
    pub overflow_policy: OverflowPolicy,
}

/// A shared-memory entry, annotated with the node that last wrote it.
#[derive(Debug, Clone)]
pub struct SharedEntry {
    pub value: Arc<Value>,
    pub writer_node_id: String,
    pub written_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct Inner {
    inputs: Arc<HashMap<String, Value>>,
    node_outputs: Vec<(String, Arc<Value>)>,
    output_index: HashMap<String, usize>,
    output_bytes: HashMap<String, usize>,
    total_bytes: usize,
    variables: HashMap<String, Arc<Value>>,
    shared: HashMap<String, SharedEntry>,
    pruned: Vec<String>,
    limits: ContextLimits,
}

/// The immutable execution context. Cloning is cheap (a pointer).
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    inner: Arc<Inner>,
}

impl ExecutionContext {
    /// Create a context from workflow-level inputs.
    pub fn new(inputs: HashMap<String, Value>) -> Self {
        Self {
            inner: Arc::new(Inner {
                inputs: Arc::new(inputs),
                ..Inner::default()
            }),
        }
    }

    /// Attach size caps. Intended for construction time, before any
    /// outputs are stored.
    pub fn with_limits(self, limits: ContextLimits) -> Self {
        let mut inner = (*self.inner).clone();
        inner.limits = limits;
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn input(&self, key: &str) -> Option<&Value> {
        self.inner.inputs.get(key)
    }

    pub fn inputs(&self) -> &HashMap<String, Value> {
        &self.inner.inputs
    }

    pub fn node_output(&self, node_id: &str) -> Option<&Value> {
        let index = *self.inner.output_index.get(node_id)?;
        Some(self.inner.node_outputs[index].1.as_ref())
    }

    /// Stored node outputs in insertion (handler completion) order.
    pub fn node_outputs(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.inner
            .node_outputs
            .iter()
            .map(|(id, value)| (id.as_str(), value.as_ref()))
    }

    pub fn variable(&self, key: &str) -> Option<&Value> {
        self.inner.variables.get(key).map(Arc::as_ref)
    }

    pub fn shared(&self, key: &str) -> Option<&SharedEntry> {
        self.inner.shared.get(key)
    }

    pub fn shared_value(&self, key: &str) -> Option<&Value> {
        self.inner.shared.get(key).map(|entry| entry.value.as_ref())
    }

    /// Node ids whose outputs were pruned by [`OverflowPolicy::PruneOldest`].
    pub fn pruned_node_ids(&self) -> &[String] {
        &self.inner.pruned
    }

    /// Store a node's output, returning the updated context.
    ///
    /// Writes once per node id; a second store for the same id replaces the
    /// value in its original slot (the scheduler only re-stores on retry
    /// after a prior failure). Fails with `context_overflow` when a size
    /// cap is exceeded under [`OverflowPolicy::Reject`].
    pub fn store_node_output(&self, node_id: &str, value: Value) -> Result<Self> {
        let size = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);
        let limits = self.inner.limits;

        if let Some(cap) = limits.max_output_bytes {
            if size > cap {
                return Err(FlowError::context_overflow(
                    node_id,
                    format!("output size {} exceeds per-output cap {}", size, cap),
                ));
            }
        }

        let mut inner = (*self.inner).clone();
        let value = Arc::new(value);

        if let Some(&index) = inner.output_index.get(node_id) {
            let previous = inner.output_bytes.insert(node_id.to_string(), size);
            inner.total_bytes = inner.total_bytes - previous.unwrap_or(0) + size;
            inner.node_outputs[index].1 = value;
        } else {
            inner.node_outputs.push((node_id.to_string(), value));
            inner
                .output_index
                .insert(node_id.to_string(), inner.node_outputs.len() - 1);
            inner.output_bytes.insert(node_id.to_string(), size);
            inner.total_bytes += size;
        }

        let over_count = limits
            .max_node_outputs
            .map(|cap| inner.node_outputs.len() > cap)
            .unwrap_or(false);
        let over_total = limits
            .max_total_bytes
            .map(|cap| inner.total_bytes > cap)
            .unwrap_or(false);

        if over_count || over_total {
            match limits.overflow_policy {
                OverflowPolicy::Reject => {
                    return Err(FlowError::context_overflow(
                        node_id,
                        "context size cap exceeded".to_string(),
                    ));
                }
                OverflowPolicy::PruneOldest => prune_until_fits(&mut inner, node_id),
            }
        }

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Set a workflow variable. Last write wins.
    pub fn set_variable(&self, key: &str, value: Value) -> Self {
        let mut inner = (*self.inner).clone();
        inner.variables.insert(key.to_string(), Arc::new(value));
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Write shared memory, recording the writer for audit.
    pub fn set_shared_memory(&self, key: &str, value: Value, writer_node_id: &str) -> Self {
        let mut inner = (*self.inner).clone();
        inner.shared.insert(
            key.to_string(),
            SharedEntry {
                value: Arc::new(value),
                writer_node_id: writer_node_id.to_string(),
                written_at: Utc::now(),
            },
        );
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Flat projection of the current node-output map, the read-only view
    /// handed to handlers.
    pub fn execution_view(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (id, value) in self.node_outputs() {
            map.insert(id.to_string(), value.clone());
        }
        Value::Object(map)
    }

    /// Merge the stored outputs of the given output nodes into the final
    /// output mapping.
    ///
    /// Each output node stores `{name → value}` pairs; pairs are merged in
    /// `output_node_ids` order with later entries overwriting earlier ones.
    /// Idempotent over the same context.
    pub fn build_final_outputs(&self, output_node_ids: &[String]) -> serde_json::Map<String, Value> {
        let mut merged = serde_json::Map::new();
        for id in output_node_ids {
            if let Some(Value::Object(pairs)) = self.node_output(id) {
                for (name, value) in pairs {
                    merged.insert(name.clone(), value.clone());
                }
            }
        }
        merged
    }
}

/// Drop oldest outputs until both count and byte caps are satisfied. The
/// just-stored `keep` entry is never pruned.
fn prune_until_fits(inner: &mut Inner, keep: &str) {
    let count_cap = inner.limits.max_node_outputs.unwrap_or(usize::MAX);
    let byte_cap = inner.limits.max_total_bytes.unwrap_or(usize::MAX);

    while inner.node_outputs.len() > count_cap || inner.total_bytes > byte_cap {
        let position = inner
            .node_outputs
            .iter()
            .position(|(id, _)| id != keep);
        match position {
            Some(index) => {
                let (id, _) = inner.node_outputs.remove(index);
                let size = inner.output_bytes.remove(&id).unwrap_or(0);
                inner.total_bytes -= size;
                tracing::debug!(node = %id, freed_bytes = size, "pruned node output");
                inner.pruned.push(id);
            }
            None => break,
        }
    }

    inner.output_index.clear();
    for (index, (id, _)) in inner.node_outputs.iter().enumerate() {
        inner.output_index.insert(id.clone(), index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs() -> HashMap<String, Value> {
        HashMap::from([("entityId".to_string(), json!("user-123"))])
    }

    #[test]
    fn inputs_are_immutable_and_visible() {
        let ctx = ExecutionContext::new(inputs());
        assert_eq!(ctx.input("entityId"), Some(&json!("user-123")));
        assert_eq!(ctx.input("missing"), None);
    }

    #[test]
    fn stores_are_persistent_updates() {
        let base = ExecutionContext::new(inputs());
        let updated = base.store_node_output("a", json!({"x": 1})).unwrap();

        // The original context is untouched.
        assert!(base.node_output("a").is_none());
        assert_eq!(updated.node_output("a"), Some(&json!({"x": 1})));
    }

    #[test]
    fn node_outputs_preserve_insertion_order() {
        let ctx = ExecutionContext::new(HashMap::new())
            .store_node_output("z", json!(1))
            .unwrap()
            .store_node_output("a", json!(2))
            .unwrap()
            .store_node_output("m", json!(3))
            .unwrap();
        let order: Vec<&str> = ctx.node_outputs().map(|(id, _)| id).collect();
        assert_eq!(order, vec!["z", "a", "m"]);
    }

    #[test]
    fn restore_keeps_slot_and_replaces_value() {
        let ctx = ExecutionContext::new(HashMap::new())
            .store_node_output("a", json!(1))
            .unwrap()
            .store_node_output("b", json!(2))
            .unwrap()
            .store_node_output("a", json!(99))
            .unwrap();
        let outputs: Vec<(&str, &Value)> = ctx.node_outputs().collect();
        assert_eq!(outputs[0], ("a", &json!(99)));
        assert_eq!(outputs[1], ("b", &json!(2)));
    }

    #[test]
    fn variables_last_write_wins() {
        let ctx = ExecutionContext::new(HashMap::new())
            .set_variable("k", json!(1))
            .set_variable("k", json!(2));
        assert_eq!(ctx.variable("k"), Some(&json!(2)));
    }

    #[test]
    fn shared_memory_records_writer() {
        let ctx = ExecutionContext::new(HashMap::new()).set_shared_memory(
            "seen",
            json!([1]),
            "crawler",
        );
        let entry = ctx.shared("seen").unwrap();
        assert_eq!(entry.writer_node_id, "crawler");
        assert_eq!(entry.value.as_ref(), &json!([1]));
    }

    #[test]
    fn reject_policy_fails_store_on_count_cap() {
        let limits = ContextLimits {
            max_node_outputs: Some(2),
            overflow_policy: OverflowPolicy::Reject,
            ..ContextLimits::default()
        };
        let ctx = ExecutionContext::new(HashMap::new())
            .with_limits(limits)
            .store_node_output("a", json!(1))
            .unwrap()
            .store_node_output("b", json!(2))
            .unwrap();
        let err = ctx.store_node_output("c", json!(3)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ContextOverflow);
        // The failed store left the context usable.
        assert_eq!(ctx.node_outputs().count(), 2);
    }

    #[test]
    fn prune_policy_drops_oldest_and_tracks_ids() {
        let limits = ContextLimits {
            max_node_outputs: Some(2),
            overflow_policy: OverflowPolicy::PruneOldest,
            ..ContextLimits::default()
        };
        let ctx = ExecutionContext::new(HashMap::new())
            .with_limits(limits)
            .store_node_output("a", json!(1))
            .unwrap()
            .store_node_output("b", json!(2))
            .unwrap()
            .store_node_output("c", json!(3))
            .unwrap();
        let order: Vec<&str> = ctx.node_outputs().map(|(id, _)| id).collect();
        assert_eq!(order, vec!["b", "c"]);
        assert_eq!(ctx.pruned_node_ids(), &["a".to_string()]);
        assert!(ctx.node_output("a").is_none());
        assert_eq!(ctx.node_output("b"), Some(&json!(2)));
    }

    #[test]
    fn oversized_single_output_always_rejected() {
        let limits = ContextLimits {
            max_output_bytes: Some(8),
            overflow_policy: OverflowPolicy::PruneOldest,
            ..ContextLimits::default()
        };
        let ctx = ExecutionContext::new(HashMap::new()).with_limits(limits);
        let err = ctx
            .store_node_output("big", json!({"payload": "0123456789abcdef"}))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ContextOverflow);
    }

    #[test]
    fn final_outputs_merge_in_declared_order() {
        let ctx = ExecutionContext::new(HashMap::new())
            .store_node_output("out1", json!({"name": "first", "only1": 1}))
            .unwrap()
            .store_node_output("out2", json!({"name": "second", "only2": 2}))
            .unwrap();
        let ids = vec!["out1".to_string(), "out2".to_string()];
        let merged = ctx.build_final_outputs(&ids);
        assert_eq!(merged.get("name"), Some(&json!("second")));
        assert_eq!(merged.get("only1"), Some(&json!(1)));
        assert_eq!(merged.get("only2"), Some(&json!(2)));

        // Idempotent over the same context.
        assert_eq!(merged, ctx.build_final_outputs(&ids));
    }

    #[test]
    fn final_outputs_skip_missing_and_non_object() {
        let ctx = ExecutionContext::new(HashMap::new())
            .store_node_output("scalar", json!(42))
            .unwrap();
        let ids = vec!["scalar".to_string(), "absent".to_string()];
        assert!(ctx.build_final_outputs(&ids).is_empty());
    }

    #[test]
    fn execution_view_projects_outputs() {
        let ctx = ExecutionContext::new(inputs())
            .store_node_output("a", json!({"x": 1}))
            .unwrap();
        let view = ctx.execution_view();
        assert_eq!(view["a"], json!({"x": 1}));
        assert!(view.get("entityId").is_none());
    }
}
