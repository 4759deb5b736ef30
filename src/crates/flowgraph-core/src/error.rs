//! Error types for workflow execution.
//!
//! Every failure the engine can surface is a [`FlowError`]; the coarse
//! classification a caller needs for retry and reporting decisions is the
//! [`ErrorKind`] attached to each variant. Handlers return `FlowError` too,
//! so the dispatcher can normalise arbitrary handler failures into the same
//! taxonomy before they reach the scheduler.
//!
//! # Error taxonomy
//!
//! ```text
//! FlowError                      ErrorKind
//! ├── Validation              →  Validation
//! ├── Interpolation           →  Interpolation
//! ├── Handler                 →  HandlerRuntime
//! ├── Timeout                 →  Timeout
//! ├── RateLimited             →  RateLimited
//! ├── Cancelled               →  Cancelled
//! ├── ContextOverflow         →  ContextOverflow
//! ├── NoHandler               →  NoHandler
//! ├── Deadlock                →  Deadlock
//! └── Serialization           →  HandlerRuntime
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience result type using [`FlowError`].
pub type Result<T> = std::result::Result<T, FlowError>;

/// Coarse error classification used in execution reports and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Workflow or node config failed structural checks.
    Validation,
    /// An expression or template could not be evaluated.
    Interpolation,
    /// Wrapped failure from a handler's underlying work.
    HandlerRuntime,
    /// A handler exceeded its deadline.
    Timeout,
    /// A downstream dependency signalled rate limiting.
    RateLimited,
    /// The workflow or a node was cancelled.
    Cancelled,
    /// The context rejected a node output because a size cap was exceeded.
    ContextOverflow,
    /// No unique handler is registered for a node type.
    NoHandler,
    /// The scheduler cannot progress but the workflow is not complete.
    Deadlock,
}

impl ErrorKind {
    /// Whether a dispatch failure of this kind may be retried under a
    /// configured retry policy.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::RateLimited | ErrorKind::HandlerRuntime
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Interpolation => "interpolation",
            ErrorKind::HandlerRuntime => "handler_runtime",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ContextOverflow => "context_overflow",
            ErrorKind::NoHandler => "no_handler",
            ErrorKind::Deadlock => "deadlock",
        };
        f.write_str(s)
    }
}

/// Error type for all engine operations.
#[derive(Error, Debug)]
pub enum FlowError {
    /// Workflow structure or node config is invalid.
    #[error("workflow validation failed: {0}")]
    Validation(String),

    /// An expression could not be evaluated. Most resolver failures degrade
    /// to `null` instead; this variant is reserved for callers that demand a
    /// value.
    #[error("expression '{expression}' could not be evaluated: {reason}")]
    Interpolation { expression: String, reason: String },

    /// A handler reported failure for a node.
    #[error("node '{node}' execution failed: {message}")]
    Handler { node: String, message: String },

    /// A handler exceeded its deadline.
    #[error("node '{node}' timed out after {duration_ms}ms")]
    Timeout { node: String, duration_ms: u64 },

    /// A downstream dependency rate-limited the handler.
    #[error("node '{node}' was rate limited: {message}")]
    RateLimited { node: String, message: String },

    /// The workflow, or a single node, was cancelled.
    #[error("execution cancelled{}", node.as_ref().map(|n| format!(" at node '{}'", n)).unwrap_or_default())]
    Cancelled { node: Option<String> },

    /// The context store rejected a node output.
    #[error("context store rejected output of node '{node}': {reason}")]
    ContextOverflow { node: String, reason: String },

    /// Zero or more than one handler matched a node type.
    #[error("no handler for node type '{node_type}': {detail}")]
    NoHandler { node_type: String, detail: String },

    /// The scheduler is stuck: nothing ready, nothing executing, workflow
    /// incomplete.
    #[error("scheduler cannot progress: {0}")]
    Deadlock(String),

    /// JSON serialization failed while marshalling values.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    /// Classify this error into the report taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::Validation(_) => ErrorKind::Validation,
            FlowError::Interpolation { .. } => ErrorKind::Interpolation,
            FlowError::Handler { .. } => ErrorKind::HandlerRuntime,
            FlowError::Timeout { .. } => ErrorKind::Timeout,
            FlowError::RateLimited { .. } => ErrorKind::RateLimited,
            FlowError::Cancelled { .. } => ErrorKind::Cancelled,
            FlowError::ContextOverflow { .. } => ErrorKind::ContextOverflow,
            FlowError::NoHandler { .. } => ErrorKind::NoHandler,
            FlowError::Deadlock(_) => ErrorKind::Deadlock,
            FlowError::Serialization(_) => ErrorKind::HandlerRuntime,
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a handler-runtime error with node context.
    pub fn handler(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error with node context.
    pub fn timeout(node: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            node: node.into(),
            duration_ms,
        }
    }

    /// Create a cancellation error, optionally scoped to a node.
    pub fn cancelled(node: Option<String>) -> Self {
        Self::Cancelled { node }
    }

    /// Create a no-handler error.
    pub fn no_handler(node_type: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::NoHandler {
            node_type: node_type.into(),
            detail: detail.into(),
        }
    }

    /// Create a context-overflow error.
    pub fn context_overflow(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ContextOverflow {
            node: node.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_classification() {
        assert_eq!(
            FlowError::validation("bad").kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            FlowError::handler("n1", "boom").kind(),
            ErrorKind::HandlerRuntime
        );
        assert_eq!(FlowError::timeout("n1", 5000).kind(), ErrorKind::Timeout);
        assert_eq!(
            FlowError::no_handler("llm", "no handler registered").kind(),
            ErrorKind::NoHandler
        );
        assert_eq!(FlowError::cancelled(None).kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::HandlerRuntime.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::NoHandler.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn display_includes_node_context() {
        let err = FlowError::handler("Insert", "duplicate key");
        assert_eq!(
            err.to_string(),
            "node 'Insert' execution failed: duplicate key"
        );

        let err = FlowError::cancelled(Some("HTTP".to_string()));
        assert_eq!(err.to_string(), "execution cancelled at node 'HTTP'");

        let err = FlowError::cancelled(None);
        assert_eq!(err.to_string(), "execution cancelled");
    }

    #[test]
    fn kind_serializes_snake_case() {
        let s = serde_json::to_string(&ErrorKind::ContextOverflow).unwrap();
        assert_eq!(s, "\"context_overflow\"");
    }
}
