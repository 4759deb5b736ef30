//! Input / trigger nodes.

use async_trait::async_trait;
use flowgraph_core::{HandlerInput, HandlerOutput, NodeHandler, Result};
use serde_json::{json, Value};

/// Surfaces a workflow's entry values as the node output.
///
/// The node config carries a `values` object whose templates (typically
/// referencing workflow inputs, e.g. `"{{entityId}}"`) were resolved by
/// the dispatcher; this handler just projects them. `defaults` entries
/// fill any value that interpolation left as an unresolved hole.
pub struct InputHandler {
    types: Vec<String>,
}

impl InputHandler {
    pub fn new() -> Self {
        Self {
            types: vec!["input".to_string(), "trigger".to_string()],
        }
    }
}

impl Default for InputHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn is_unresolved_hole(value: &Value) -> bool {
    matches!(value, Value::String(s) if s.starts_with("{{") && s.ends_with("}}"))
}

#[async_trait]
impl NodeHandler for InputHandler {
    fn name(&self) -> &str {
        "builtin-input"
    }

    fn supported_node_types(&self) -> &[String] {
        &self.types
    }

    async fn execute(&self, input: HandlerInput) -> Result<HandlerOutput> {
        let mut result = match input.node_config.get("values") {
            Some(Value::Object(values)) => values.clone(),
            _ => serde_json::Map::new(),
        };

        if let Some(Value::Object(defaults)) = input.node_config.get("defaults") {
            for (key, fallback) in defaults {
                let needs_default = match result.get(key) {
                    None => true,
                    Some(value) => is_unresolved_hole(value),
                };
                if needs_default {
                    result.insert(key.clone(), fallback.clone());
                }
            }
        }

        tracing::debug!(node = %input.execution.node_id, keys = result.len(), "input node surfaced values");
        Ok(HandlerOutput::ok(json!(result)))
    }
}
