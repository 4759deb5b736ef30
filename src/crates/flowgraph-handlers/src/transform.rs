//! Transform nodes: structural JSON operations.

use async_trait::async_trait;
use flowgraph_core::{FlowError, HandlerInput, HandlerOutput, NodeHandler, Result};
use serde_json::{json, Value};

/// Structural transforms over already-interpolated config.
///
/// Operations:
///
/// - `template` (default): the `template` value is the output. Because
///   interpolation stringifies non-string values as compact JSON, string
///   leaves that parse as JSON are revived into structured values.
/// - `pick`: select `fields` from the `source` object.
/// - `merge`: shallow-merge the `sources` objects left to right.
///
/// Non-object results are wrapped as `{"value": …}` so the stored node
/// output is always an object.
pub struct TransformHandler {
    types: Vec<String>,
}

impl TransformHandler {
    pub fn new() -> Self {
        Self {
            types: vec!["transform".to_string()],
        }
    }
}

impl Default for TransformHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Revive interpolated strings: a string leaf that parses as JSON becomes
/// the parsed value, recursively. Plain strings stay strings.
fn revive(value: &Value) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                serde_json::from_str(trimmed).unwrap_or_else(|_| value.clone())
            } else {
                value.clone()
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(revive).collect()),
        Value::Object(map) => {
            Value::Object(map.iter().map(|(k, v)| (k.clone(), revive(v))).collect())
        }
        other => other.clone(),
    }
}

fn as_object(value: &Value, what: &str) -> Result<serde_json::Map<String, Value>> {
    match revive(value) {
        Value::Object(map) => Ok(map),
        other => Err(FlowError::validation(format!(
            "{} must be an object, got {}",
            what,
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn wrap(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        other => json!({"value": other}),
    }
}

#[async_trait]
impl NodeHandler for TransformHandler {
    fn name(&self) -> &str {
        "builtin-transform"
    }

    fn supported_node_types(&self) -> &[String] {
        &self.types
    }

    async fn execute(&self, input: HandlerInput) -> Result<HandlerOutput> {
        let operation = input
            .node_config
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or("template");

        let result = match operation {
            "template" => {
                let template = input.node_config.get("template").cloned().unwrap_or(json!({}));
                wrap(revive(&template))
            }
            "pick" => {
                let source = input.node_config.get("source").cloned().unwrap_or(json!({}));
                let source = as_object(&source, "pick source")?;
                let fields = match input.node_config.get("fields") {
                    Some(Value::Array(fields)) => fields.clone(),
                    _ => Vec::new(),
                };
                let mut picked = serde_json::Map::new();
                for field in fields {
                    if let Some(name) = field.as_str() {
                        if let Some(value) = source.get(name) {
                            picked.insert(name.to_string(), value.clone());
                        }
                    }
                }
                Value::Object(picked)
            }
            "merge" => {
                let sources = match input.node_config.get("sources") {
                    Some(Value::Array(sources)) => sources.clone(),
                    _ => Vec::new(),
                };
                let mut merged = serde_json::Map::new();
                for source in &sources {
                    for (key, value) in as_object(source, "merge source")? {
                        merged.insert(key, value);
                    }
                }
                Value::Object(merged)
            }
            other => {
                return Err(FlowError::validation(format!(
                    "unknown transform operation '{}'",
                    other
                )))
            }
        };

        Ok(HandlerOutput::ok(result))
    }
}
