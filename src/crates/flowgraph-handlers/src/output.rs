//! Output nodes.

use async_trait::async_trait;
use flowgraph_core::{HandlerInput, HandlerOutput, NodeHandler, Result, Signals};
use serde_json::{json, Value};

/// Projects the node's configured `{name → value}` pairs as its stored
/// output; the orchestrator merges these into the workflow's final output
/// mapping.
///
/// A `terminal: true` config flag raises the `is_terminal` signal so the
/// rest of the graph is short-circuited once this output lands (the
/// workflow-level `terminate_on_reach` set does the same without touching
/// node configs).
pub struct OutputHandler {
    types: Vec<String>,
}

impl OutputHandler {
    pub fn new() -> Self {
        Self {
            types: vec!["output".to_string()],
        }
    }
}

impl Default for OutputHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeHandler for OutputHandler {
    fn name(&self) -> &str {
        "builtin-output"
    }

    fn supported_node_types(&self) -> &[String] {
        &self.types
    }

    async fn execute(&self, input: HandlerInput) -> Result<HandlerOutput> {
        let values = match input.node_config.get("values") {
            Some(Value::Object(values)) => values.clone(),
            _ => serde_json::Map::new(),
        };
        let terminal = input
            .node_config
            .get("terminal")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let signals = Signals {
            is_terminal: terminal,
            ..Signals::default()
        };
        Ok(HandlerOutput::ok(json!(values)).with_signals(signals))
    }
}
