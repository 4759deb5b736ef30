//! Built-in structural node handlers.
//!
//! These cover the node types the engine itself gives meaning to —
//! surfacing inputs, projecting outputs, routing, and structural JSON
//! transforms. Everything else (HTTP, database, LLM, integrations) lives
//! in external handler crates behind the same
//! [`NodeHandler`](flowgraph_core::NodeHandler) contract.
//!
//! Handlers here never touch the resolver: the dispatcher interpolates
//! every string leaf of a node's config before invocation, so a config
//! like `{"values": {"user": "{{fetch.body}}"}}` arrives fully resolved.

mod input;
mod output;
mod router;
mod transform;

pub use input::InputHandler;
pub use output::OutputHandler;
pub use router::RouterHandler;
pub use transform::TransformHandler;

use flowgraph_core::HandlerRegistry;
use std::sync::Arc;

/// A registry preloaded with all built-in handlers.
pub fn builtin_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(InputHandler::new()));
    registry.register(Arc::new(OutputHandler::new()));
    registry.register(Arc::new(RouterHandler::new()));
    registry.register(Arc::new(TransformHandler::new()));
    registry
}

#[cfg(test)]
pub(crate) mod testutil {
    use flowgraph_core::{ExecutionMeta, HandlerInput};
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    /// A handler input with the given (pre-interpolated) config.
    pub(crate) fn input_for(node_type: &str, config: Value) -> HandlerInput {
        HandlerInput {
            node_type: node_type.to_string(),
            node_config: config,
            context: json!({}),
            execution: ExecutionMeta {
                execution_id: "exec-test".to_string(),
                node_id: "node-under-test".to_string(),
                node_name: "node-under-test".to_string(),
                attempt: 1,
                loop_frame: None,
                parallel_frame: None,
                cancel: CancellationToken::new(),
            },
        }
    }
}
