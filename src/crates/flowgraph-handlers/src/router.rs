//! Router nodes.

use async_trait::async_trait;
use flowgraph_core::resolver;
use flowgraph_core::{HandlerInput, HandlerOutput, NodeHandler, Result};
use serde_json::{json, Value};

/// Evaluates route conditions in order and reports the first match.
///
/// Config shape:
///
/// ```json
/// {
///   "routes": [
///     {"id": "p1", "when": "{{ticket.priority == 'p1'}}"},
///     {"id": "p2", "when": "{{ticket.priority == 'p2'}}"}
///   ],
///   "default": "p3"
/// }
/// ```
///
/// By the time this handler runs, each `when` template has been resolved
/// to a concrete value ("true", "false", a number, an unfilled hole, …).
/// The output's `selectedRoute` field is what conditional edges match
/// their `source_handle` against; the scheduler dead-ends every
/// non-selected branch.
pub struct RouterHandler {
    types: Vec<String>,
}

impl RouterHandler {
    pub fn new() -> Self {
        Self {
            types: vec!["router".to_string()],
        }
    }
}

impl Default for RouterHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Truthiness of an already-interpolated condition value. Strings are
/// parsed back to JSON when possible so "false" and "0" stay falsy; an
/// unfilled `{{…}}` hole never matches.
fn condition_matches(value: &Value) -> bool {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.contains("{{") {
                return false;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(parsed) => resolver::is_truthy(&parsed),
                Err(_) => !trimmed.is_empty(),
            }
        }
        other => resolver::is_truthy(other),
    }
}

#[async_trait]
impl NodeHandler for RouterHandler {
    fn name(&self) -> &str {
        "builtin-router"
    }

    fn supported_node_types(&self) -> &[String] {
        &self.types
    }

    async fn execute(&self, input: HandlerInput) -> Result<HandlerOutput> {
        let routes = match input.node_config.get("routes") {
            Some(Value::Array(routes)) => routes.clone(),
            _ => Vec::new(),
        };

        let mut evaluated = Vec::new();
        let mut selected: Option<String> = None;
        for route in &routes {
            let id = route.get("id").and_then(Value::as_str).unwrap_or_default();
            let matched = selected.is_none()
                && route.get("when").map(condition_matches).unwrap_or(false);
            evaluated.push(json!({"id": id, "matched": matched}));
            if matched && !id.is_empty() {
                selected = Some(id.to_string());
            }
        }

        let selected = selected.or_else(|| {
            input
                .node_config
                .get("default")
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        match selected {
            Some(route) => {
                tracing::debug!(node = %input.execution.node_id, route = %route, "router matched");
                Ok(HandlerOutput::ok(json!({
                    "selectedRoute": route,
                    "evaluated": evaluated,
                })))
            }
            None => Ok(HandlerOutput::failure(
                "no route condition matched and no default route configured",
            )),
        }
    }
}
