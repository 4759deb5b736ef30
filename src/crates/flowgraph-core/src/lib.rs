//! # flowgraph-core — DAG workflow execution engine
//!
//! The execution core of an agentic automation platform. Workflows are
//! directed acyclic graphs of typed nodes (inputs, HTTP calls, LLM calls,
//! transforms, routers, loops, outputs); the engine accepts a compiled
//! workflow plus runtime inputs and drives the graph to completion,
//! producing a final output mapping.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  WorkflowExecutor                        │
//! │  ready set → concurrent dispatch → context update → loop │
//! └───────┬───────────────────┬──────────────────┬───────────┘
//!         ▼                   ▼                  ▼
//!  ┌────────────┐      ┌────────────┐    ┌───────────────┐
//!  │ Scheduler  │      │ Dispatcher │    │ Execution     │
//!  │ lifecycle, │      │ registry,  │    │ Context       │
//!  │ edge       │      │ config     │    │ inputs,       │
//!  │ handles,   │      │ interp.,   │    │ outputs,      │
//!  │ failures   │      │ retries    │    │ vars, shared  │
//!  └────────────┘      └─────┬──────┘    └───────┬───────┘
//!                            ▼                   ▲
//!                     ┌────────────┐      ┌──────┴───────┐
//!                     │  Handlers  │      │   Resolver   │
//!                     │ (external) │      │ {{ … }} ,    │
//!                     └────────────┘      │ expressions  │
//!                                         └──────────────┘
//! ```
//!
//! - [`workflow`] — the compiled-workflow data model and builder.
//! - [`resolver`] — the `{{ … }}` expression sublanguage node configs use
//!   to reference upstream outputs, inputs, variables, and frames.
//! - [`context`] — the immutable execution context snapshot.
//! - [`scheduler`] — the ready-queue scheduler: per-node lifecycle,
//!   edge-handle semantics, failure propagation, concurrency caps.
//! - [`dispatch`] — the uniform handler interface and registry.
//! - [`executor`] — the orchestrator loop and execution result.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use flowgraph_core::{HandlerRegistry, WorkflowBuilder, WorkflowExecutor};
//! use serde_json::json;
//! use std::collections::HashMap;
//!
//! let workflow = WorkflowBuilder::new()
//!     .add_node("fetch", "http", json!({"url": "/users/{{entityId}}"}))
//!     .add_node("out", "output", json!({"values": {"user": "{{fetch.body}}"}}))
//!     .add_edge("fetch", "out")
//!     .outputs(["out"])
//!     .max_concurrent(4)
//!     .build()?;
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register(my_http_handler);
//! registry.register(my_output_handler);
//!
//! let executor = WorkflowExecutor::new(registry);
//! let result = executor
//!     .execute(&workflow, HashMap::from([("entityId".into(), json!("user-123"))]))
//!     .await?;
//! assert!(result.success);
//! ```

pub mod context;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod workflow;

// Re-export main types
pub use context::{ContextLimits, ExecutionContext, OverflowPolicy, SharedEntry};
pub use dispatch::{
    Dispatcher, ExecutionMeta, HandlerInput, HandlerMetrics, HandlerOutput, HandlerRegistry,
    NodeHandler, Signals, TokenUsage,
};
pub use error::{ErrorKind, FlowError, Result};
pub use executor::{
    event_channel, ExecutionEvent, ExecutionResult, ExecutorConfig, WorkflowExecutor,
};
pub use resolver::{interpolate, resolve, LoopFrame, ParallelFrame, Resolved, ValueSource};
pub use retry::RetryPolicy;
pub use scheduler::{CompletionFlags, NodeFailure, NodeState, Scheduler};
pub use workflow::{
    CompiledWorkflow, EdgeDescriptor, FrameKind, HandleType, LoopContext, NodeDescriptor,
    WorkflowBuilder,
};
