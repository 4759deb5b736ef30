//! Node dispatch: the uniform call shape between the orchestrator and
//! arbitrary handlers.
//!
//! A handler is any [`NodeHandler`] registered against one or more node
//! type strings. The dispatcher selects the unique handler for a node's
//! type, interpolates every string leaf of the node config against the
//! current context, invokes the handler (retrying retryable failures under
//! the configured [`RetryPolicy`]), and normalises whatever comes back
//! into the engine's error taxonomy.
//!
//! Handlers receive an already-resolved config and a read-only context
//! projection; they never call the resolver themselves. That keeps them
//! hermetic and trivially testable.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::context::ExecutionContext;
use crate::error::{FlowError, Result};
use crate::resolver::{self, LoopFrame, ParallelFrame};
use crate::retry::RetryPolicy;
use crate::workflow::NodeDescriptor;

/// Execution metadata handed to a handler alongside its config.
#[derive(Debug, Clone)]
pub struct ExecutionMeta {
    pub execution_id: String,
    pub node_id: String,
    pub node_name: String,
    /// 1-indexed attempt number; increments on dispatcher retries.
    pub attempt: u32,
    pub loop_frame: Option<LoopFrame>,
    pub parallel_frame: Option<ParallelFrame>,
    /// Cooperative cancellation signal for long-running handler work.
    pub cancel: CancellationToken,
}

/// Input to a handler invocation.
#[derive(Debug, Clone)]
pub struct HandlerInput {
    pub node_type: String,
    /// Node config with every string leaf interpolated.
    pub node_config: Value,
    /// Read-only projection of the current node-output map.
    pub context: Value,
    pub execution: ExecutionMeta,
}

/// Side effects a handler asks the orchestrator to apply on completion.
#[derive(Debug, Clone, Default)]
pub struct Signals {
    /// Stop dispatching: the workflow short-circuits after this node.
    pub is_terminal: bool,
    /// Skip this node's immediate dependents.
    pub skip_downstream: bool,
    pub emitted_variables: HashMap<String, Value>,
    pub emitted_shared: HashMap<String, Value>,
}

/// Token accounting reported by LLM-backed handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Measurements reported by a handler invocation.
#[derive(Debug, Clone, Default)]
pub struct HandlerMetrics {
    pub duration_ms: u64,
    pub token_usage: Option<TokenUsage>,
}

/// Result of a handler invocation.
#[derive(Debug, Clone)]
pub struct HandlerOutput {
    /// JSON object stored as the node's output.
    pub result: Value,
    pub signals: Signals,
    pub metrics: HandlerMetrics,
    pub success: bool,
    pub error: Option<String>,
}

impl HandlerOutput {
    /// A successful output with no signals.
    pub fn ok(result: Value) -> Self {
        Self {
            result,
            signals: Signals::default(),
            metrics: HandlerMetrics::default(),
            success: true,
            error: None,
        }
    }

    /// A soft failure the dispatcher will normalise to a handler error.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            result: Value::Null,
            signals: Signals::default(),
            metrics: HandlerMetrics::default(),
            success: false,
            error: Some(error.into()),
        }
    }

    pub fn with_signals(mut self, signals: Signals) -> Self {
        self.signals = signals;
        self
    }

    pub fn with_metrics(mut self, metrics: HandlerMetrics) -> Self {
        self.metrics = metrics;
        self
    }
}

/// The handler contract. Implementations perform a node's actual work
/// (HTTP, SQL, LLM, …) behind this uniform interface.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    fn name(&self) -> &str;

    fn supported_node_types(&self) -> &[String];

    fn can_handle(&self, node_type: &str) -> bool {
        self.supported_node_types().iter().any(|t| t == node_type)
    }

    /// Perform the node's work. Called at most once per
    /// `(execution id, node id, attempt)` tuple.
    async fn execute(&self, input: HandlerInput) -> Result<HandlerOutput>;
}

impl std::fmt::Debug for dyn NodeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandler").field("name", &self.name()).finish()
    }
}

/// Registry of handlers, resolved by node type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn NodeHandler>) {
        self.handlers.push(handler);
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Select the unique handler for a node type. Zero or ambiguous
    /// matches fail fast with a `no_handler` error.
    pub fn resolve(&self, node_type: &str) -> Result<Arc<dyn NodeHandler>> {
        let mut matches = self
            .handlers
            .iter()
            .filter(|h| h.can_handle(node_type))
            .collect::<Vec<_>>();
        match matches.len() {
            1 => Ok(Arc::clone(matches.remove(0))),
            0 => Err(FlowError::no_handler(node_type, "no handler registered")),
            n => {
                let names: Vec<&str> = matches.iter().map(|h| h.name()).collect();
                Err(FlowError::no_handler(
                    node_type,
                    format!("{} handlers match ({})", n, names.join(", ")),
                ))
            }
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.handlers.iter().map(|h| h.name()).collect();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &names)
            .finish()
    }
}

/// Deep-walk a config value, interpolating every string leaf. Arrays and
/// nested maps are traversed; non-string leaves pass through unchanged.
pub fn interpolate_config(
    ctx: &ExecutionContext,
    config: &Value,
    loop_frame: Option<&LoopFrame>,
    parallel_frame: Option<&ParallelFrame>,
) -> Value {
    match config {
        Value::String(template) => {
            Value::String(resolver::interpolate(ctx, template, loop_frame, parallel_frame))
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| interpolate_config(ctx, item, loop_frame, parallel_frame))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    (
                        key.clone(),
                        interpolate_config(ctx, value, loop_frame, parallel_frame),
                    )
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Dispatches nodes to handlers with config interpolation, retries, and
/// error normalisation.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: HandlerRegistry,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Dispatch one node: resolve the handler, interpolate its config, and
    /// invoke it, retrying retryable failures until the policy is
    /// exhausted.
    pub async fn dispatch(
        &self,
        node: &NodeDescriptor,
        ctx: &ExecutionContext,
        execution_id: &str,
        loop_frame: Option<LoopFrame>,
        parallel_frame: Option<ParallelFrame>,
        cancel: CancellationToken,
    ) -> Result<HandlerOutput> {
        let handler = self.registry.resolve(&node.node_type)?;
        let node_config = interpolate_config(
            ctx,
            &node.config,
            loop_frame.as_ref(),
            parallel_frame.as_ref(),
        );
        let context = ctx.execution_view();

        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error: Option<FlowError> = None;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(FlowError::cancelled(Some(node.id.clone())));
            }

            tracing::debug!(
                node = %node.id,
                node_type = %node.node_type,
                handler = %handler.name(),
                attempt,
                max_attempts,
                "dispatching node"
            );

            let input = HandlerInput {
                node_type: node.node_type.clone(),
                node_config: node_config.clone(),
                context: context.clone(),
                execution: ExecutionMeta {
                    execution_id: execution_id.to_string(),
                    node_id: node.id.clone(),
                    node_name: node.name.clone(),
                    attempt,
                    loop_frame: loop_frame.clone(),
                    parallel_frame: parallel_frame.clone(),
                    cancel: cancel.clone(),
                },
            };

            let outcome = match handler.execute(input).await {
                Ok(output) if output.success => {
                    if attempt > 1 {
                        tracing::info!(node = %node.id, attempts = attempt, "node succeeded after retry");
                    }
                    return Ok(output);
                }
                Ok(output) => {
                    let message = output
                        .error
                        .unwrap_or_else(|| "handler reported failure".to_string());
                    FlowError::handler(&node.id, message)
                }
                Err(err) => err,
            };

            let retryable = outcome.kind().is_retryable() && attempt < max_attempts;
            if retryable {
                let delay = self.retry.delay_for(attempt);
                tracing::warn!(
                    node = %node.id,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %outcome,
                    "node failed, retrying after delay"
                );
                last_error = Some(outcome);
                tokio::time::sleep(delay).await;
            } else {
                tracing::error!(node = %node.id, attempt, error = %outcome, "node failed");
                return Err(outcome);
            }
        }

        Err(last_error.unwrap_or_else(|| FlowError::handler(&node.id, "retry budget exhausted")))
    }
}
