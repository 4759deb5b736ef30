//! Integration tests for complete workflow executions.
//!
//! These exercise the scheduler, dispatcher, context, and resolver
//! together through the public executor API, using scripted mock handlers.

use async_trait::async_trait;
use flowgraph_core::{
    CompiledWorkflow, ExecutionEvent, ExecutorConfig, FlowError, HandlerInput, HandlerOutput,
    HandlerRegistry, NodeHandler, Signals, WorkflowBuilder, WorkflowExecutor,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Scripted handler: canned per-node results, optional per-node failures,
/// optional fixed delay, and a high-water mark of concurrent executions.
#[derive(Default)]
struct ScriptedHandler {
    types: Vec<String>,
    responses: HashMap<String, Value>,
    failures: HashMap<String, String>,
    delay: Option<Duration>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl ScriptedHandler {
    fn for_types(types: &[&str]) -> Self {
        Self {
            types: types.iter().map(|t| t.to_string()).collect(),
            ..Self::default()
        }
    }

    fn respond(mut self, node_id: &str, value: Value) -> Self {
        self.responses.insert(node_id.to_string(), value);
        self
    }

    fn fail(mut self, node_id: &str, message: &str) -> Self {
        self.failures.insert(node_id.to_string(), message.to_string());
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl NodeHandler for ScriptedHandler {
    fn name(&self) -> &str {
        "scripted"
    }
    fn supported_node_types(&self) -> &[String] {
        &self.types
    }
    async fn execute(&self, input: HandlerInput) -> flowgraph_core::Result<HandlerOutput> {
        let current = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if let Some(message) = self.failures.get(&input.execution.node_id) {
            return Ok(HandlerOutput::failure(message.clone()));
        }
        let result = self
            .responses
            .get(&input.execution.node_id)
            .cloned()
            .unwrap_or_else(|| json!({}));
        Ok(HandlerOutput::ok(result))
    }
}

fn registry_of(handler: ScriptedHandler) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(handler));
    registry
}

/// Scenario: linear pipeline Input → HTTP → Transform → Output.
#[tokio::test]
async fn linear_pipeline_runs_in_order() {
    let workflow = WorkflowBuilder::new()
        .add_node("Input", "input", json!({}))
        .add_node("HTTP", "http", json!({}))
        .add_node("Transform", "transform", json!({}))
        .add_node("Output", "output", json!({}))
        .add_edge("Input", "HTTP")
        .add_edge("HTTP", "Transform")
        .add_edge("Transform", "Output")
        .outputs(["Output"])
        .max_concurrent(4)
        .build()
        .unwrap();

    let handler = ScriptedHandler::for_types(&["input", "http", "transform", "output"])
        .respond("Input", json!({"entityId": "user-123"}))
        .respond("HTTP", json!({"statusCode": 200, "body": {"data": {"name": "John"}}}))
        .respond("Transform", json!({"enrichedData": {"name": "John"}}))
        .respond("Output", json!({"enrichedEntity": {"name": "John"}}));

    let executor = WorkflowExecutor::new(registry_of(handler));
    let result = executor
        .execute(
            &workflow,
            HashMap::from([("entityId".to_string(), json!("user-123"))]),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(
        result.execution_order,
        vec!["Input", "HTTP", "Transform", "Output"]
    );
    assert_eq!(
        Value::Object(result.outputs),
        json!({"enrichedEntity": {"name": "John"}})
    );
    assert!(result.failed_nodes.is_empty());
    assert!(result.durations.contains_key("HTTP"));
}

/// Scenario: parallel fan-out/fan-in. The three middle nodes may land in
/// any order, but all of them before the merge.
#[tokio::test]
async fn parallel_fan_in_completes_before_merge() {
    let workflow = WorkflowBuilder::new()
        .add_node("Input", "input", json!({}))
        .add_node("CRM", "http", json!({}))
        .add_node("ERP", "http", json!({}))
        .add_node("Analytics", "http", json!({}))
        .add_node("Merge", "transform", json!({}))
        .add_node("Output", "output", json!({}))
        .add_edge("Input", "CRM")
        .add_edge("Input", "ERP")
        .add_edge("Input", "Analytics")
        .add_edge("CRM", "Merge")
        .add_edge("ERP", "Merge")
        .add_edge("Analytics", "Merge")
        .add_edge("Merge", "Output")
        .outputs(["Output"])
        .max_concurrent(10)
        .build()
        .unwrap();

    let handler = ScriptedHandler::for_types(&["input", "http", "transform", "output"])
        .with_delay(Duration::from_millis(10));
    let executor = WorkflowExecutor::new(registry_of(handler));
    let result = executor.execute(&workflow, HashMap::new()).await.unwrap();

    assert!(result.success);
    let order = &result.execution_order;
    assert_eq!(order.len(), 6);
    assert_eq!(order.first().unwrap(), "Input");
    assert_eq!(order.last().unwrap(), "Output");
    let merge_pos = order.iter().position(|id| id == "Merge").unwrap();
    for branch in ["CRM", "ERP", "Analytics"] {
        let pos = order.iter().position(|id| id == branch).unwrap();
        assert!(pos < merge_pos, "{} must complete before Merge", branch);
    }
}

/// Scenario: a router selects route "p1"; the other branches are skipped
/// and their downstream never runs.
#[tokio::test]
async fn router_selects_priority_route() {
    let workflow = WorkflowBuilder::new()
        .add_node("Router", "router", json!({}))
        .add_node("P1", "http", json!({}))
        .add_node("P2", "http", json!({}))
        .add_node("P3", "http", json!({}))
        .add_node("P1Done", "transform", json!({}))
        .add_node("P2Done", "transform", json!({}))
        .add_conditional_edge("Router", "P1", "p1")
        .add_conditional_edge("Router", "P2", "p2")
        .add_conditional_edge("Router", "P3", "p3")
        .add_edge("P1", "P1Done")
        .add_edge("P2", "P2Done")
        .max_concurrent(4)
        .build()
        .unwrap();

    let handler = ScriptedHandler::for_types(&["router", "http", "transform"])
        .respond("Router", json!({"selectedRoute": "p1"}));
    let executor = WorkflowExecutor::new(registry_of(handler));
    let result = executor.execute(&workflow, HashMap::new()).await.unwrap();

    let order = &result.execution_order;
    assert!(order.contains(&"P1".to_string()));
    assert!(order.contains(&"P1Done".to_string()));
    assert!(!order.contains(&"P2".to_string()));
    assert!(!order.contains(&"P3".to_string()));
    assert!(!order.contains(&"P2Done".to_string()));
}

/// Scenario: fail-fast. A failing insert skips everything downstream and
/// the result is unsuccessful.
#[tokio::test]
async fn failure_skips_downstream_and_fails_workflow() {
    let workflow = WorkflowBuilder::new()
        .add_node("Input", "input", json!({}))
        .add_node("Insert", "database", json!({}))
        .add_node("Query", "database", json!({}))
        .add_node("Update", "database", json!({}))
        .add_edge("Input", "Insert")
        .add_edge("Insert", "Query")
        .add_edge("Query", "Update")
        .build()
        .unwrap();

    let handler = ScriptedHandler::for_types(&["input", "database"])
        .fail("Insert", "duplicate key value violates unique constraint");
    let executor = WorkflowExecutor::new(registry_of(handler));
    let result = executor.execute(&workflow, HashMap::new()).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.failed_nodes.len(), 1);
    assert_eq!(result.failed_nodes[0].node_id, "Insert");
    assert!(result.failed_nodes[0]
        .error
        .contains("duplicate key value violates unique constraint"));
    assert!(result.execution_order.contains(&"Input".to_string()));
    assert!(result.execution_order.contains(&"Insert".to_string()));
    assert!(!result.execution_order.contains(&"Query".to_string()));
    assert!(!result.execution_order.contains(&"Update".to_string()));
}

/// Scenario: the concurrency cap bounds in-flight handlers, and cap = 1
/// yields the deterministic sequential order.
#[tokio::test]
async fn concurrency_cap_is_observed() {
    let delay = Duration::from_millis(30);
    let mut builder = WorkflowBuilder::new();
    for i in 0..10 {
        builder = builder.add_node(format!("Node_{}", i), "http", json!({}));
    }
    let workflow = builder.max_concurrent(3).build().unwrap();

    let handler = ScriptedHandler::for_types(&["http"]).with_delay(delay);
    let max_active = handler.max_active.clone();
    let executor = WorkflowExecutor::new(registry_of(handler));

    let started = Instant::now();
    let result = executor.execute(&workflow, HashMap::new()).await.unwrap();
    let elapsed = started.elapsed();

    assert!(result.success);
    assert_eq!(result.execution_order.len(), 10);
    assert!(
        max_active.load(Ordering::SeqCst) <= 3,
        "executing set exceeded the cap: {}",
        max_active.load(Ordering::SeqCst)
    );
    // ceil(10 / 3) = 4 waves of at least `delay` each.
    assert!(
        elapsed >= delay * 4,
        "finished too fast for cap 3: {:?}",
        elapsed
    );
}

#[tokio::test]
async fn sequential_cap_yields_deterministic_order() {
    let mut builder = WorkflowBuilder::new();
    for i in 0..10 {
        builder = builder.add_node(format!("Node_{}", i), "http", json!({}));
    }
    // Zero coerces to one: strictly sequential.
    let workflow = builder.max_concurrent(0).build().unwrap();

    let handler = ScriptedHandler::for_types(&["http"]);
    let max_active = handler.max_active.clone();
    let executor = WorkflowExecutor::new(registry_of(handler));
    let result = executor.execute(&workflow, HashMap::new()).await.unwrap();

    assert_eq!(max_active.load(Ordering::SeqCst), 1);
    let expected: Vec<String> = (0..10).map(|i| format!("Node_{}", i)).collect();
    assert_eq!(result.execution_order, expected);
}

/// Determinism: identical handler behaviour gives identical order and
/// outputs across runs.
#[tokio::test]
async fn repeated_runs_are_deterministic() {
    let build = || {
        WorkflowBuilder::new()
            .add_node("A", "input", json!({}))
            .add_node("B", "transform", json!({}))
            .add_node("C", "transform", json!({}))
            .add_node("Out", "output", json!({}))
            .add_edge("A", "B")
            .add_edge("A", "C")
            .add_edge("B", "Out")
            .add_edge("C", "Out")
            .outputs(["Out"])
            .max_concurrent(1)
            .build()
            .unwrap()
    };
    let run = |workflow: CompiledWorkflow| async move {
        let handler = ScriptedHandler::for_types(&["input", "transform", "output"])
            .respond("Out", json!({"answer": 42}));
        WorkflowExecutor::new(registry_of(handler))
            .execute(&workflow, HashMap::new())
            .await
            .unwrap()
    };

    let first = run(build()).await;
    let second = run(build()).await;
    assert_eq!(first.execution_order, second.execution_order);
    assert_eq!(first.outputs, second.outputs);
}

/// Dispatcher interpolation feeds resolved configs to handlers; emitted
/// variables from one node are visible to later nodes' templates.
#[tokio::test]
async fn emitted_variables_flow_into_downstream_configs() {
    struct Emitter {
        types: Vec<String>,
    }
    #[async_trait]
    impl NodeHandler for Emitter {
        fn name(&self) -> &str {
            "emitter"
        }
        fn supported_node_types(&self) -> &[String] {
            &self.types
        }
        async fn execute(&self, _input: HandlerInput) -> flowgraph_core::Result<HandlerOutput> {
            let mut signals = Signals::default();
            signals
                .emitted_variables
                .insert("greeting".to_string(), json!("hello"));
            signals
                .emitted_shared
                .insert("audit".to_string(), json!({"step": 1}));
            Ok(HandlerOutput::ok(json!({"emitted": true})).with_signals(signals))
        }
    }

    struct Echo {
        types: Vec<String>,
    }
    #[async_trait]
    impl NodeHandler for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn supported_node_types(&self) -> &[String] {
            &self.types
        }
        async fn execute(&self, input: HandlerInput) -> flowgraph_core::Result<HandlerOutput> {
            Ok(HandlerOutput::ok(input.node_config))
        }
    }

    let workflow = WorkflowBuilder::new()
        .add_node("emit", "emitter", json!({}))
        .add_node(
            "render",
            "echo",
            json!({"message": "{{greeting}} world", "audit": "{{shared.audit.step}}"}),
        )
        .add_edge("emit", "render")
        .outputs(["render"])
        .build()
        .unwrap();

    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(Emitter {
        types: vec!["emitter".to_string()],
    }));
    registry.register(Arc::new(Echo {
        types: vec!["echo".to_string()],
    }));

    let result = WorkflowExecutor::new(registry)
        .execute(&workflow, HashMap::new())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.outputs.get("message"), Some(&json!("hello world")));
    assert_eq!(result.outputs.get("audit"), Some(&json!("1")));
}

/// A tolerated failure routes into the error branch instead of killing
/// the workflow.
#[tokio::test]
async fn tolerated_failure_takes_error_branch() {
    let workflow = WorkflowBuilder::new()
        .add_node("Fetch", "http", json!({"tolerateFailure": true}))
        .add_node("Happy", "transform", json!({}))
        .add_node("Rescue", "transform", json!({}))
        .add_edge("Fetch", "Happy")
        .add_error_edge("Fetch", "Rescue")
        .outputs(["Rescue"])
        .build()
        .unwrap();

    let handler = ScriptedHandler::for_types(&["http", "transform"])
        .fail("Fetch", "upstream 503")
        .respond("Rescue", json!({"recovered": true}));
    let result = WorkflowExecutor::new(registry_of(handler))
        .execute(&workflow, HashMap::new())
        .await
        .unwrap();

    assert!(result.execution_order.contains(&"Rescue".to_string()));
    assert!(!result.execution_order.contains(&"Happy".to_string()));
    assert_eq!(result.outputs.get("recovered"), Some(&json!(true)));
    // The failure is still reported.
    assert_eq!(result.failed_nodes[0].node_id, "Fetch");
}

/// `terminate_on_reach` short-circuits the rest of the graph once the
/// flagged output completes.
#[tokio::test]
async fn terminal_output_short_circuits() {
    let workflow = WorkflowBuilder::new()
        .add_node("A", "input", json!({}))
        .add_node("Fast", "output", json!({}))
        .add_node("Slow", "http", json!({}))
        .add_node("SlowOut", "output", json!({}))
        .add_edge("A", "Fast")
        .add_edge("A", "Slow")
        .add_edge("Slow", "SlowOut")
        .outputs(["Fast", "SlowOut"])
        .terminate_on_reach("Fast")
        .max_concurrent(1)
        .build()
        .unwrap();

    let handler = ScriptedHandler::for_types(&["input", "http", "output"])
        .respond("Fast", json!({"answer": "early"}));
    let result = WorkflowExecutor::new(registry_of(handler))
        .execute(&workflow, HashMap::new())
        .await
        .unwrap();

    assert!(result.success, "terminal completion counts as success");
    assert_eq!(result.outputs.get("answer"), Some(&json!("early")));
    assert!(!result.execution_order.contains(&"Slow".to_string()));
    assert!(!result.execution_order.contains(&"SlowOut".to_string()));
}

/// Unknown node types fail dispatch with `no_handler` and propagate like
/// any other failure.
#[tokio::test]
async fn unknown_node_type_fails_dispatch() {
    let workflow = WorkflowBuilder::new()
        .add_node("A", "input", json!({}))
        .add_node("Weird", "hologram", json!({}))
        .add_edge("A", "Weird")
        .build()
        .unwrap();

    let handler = ScriptedHandler::for_types(&["input"]);
    let result = WorkflowExecutor::new(registry_of(handler))
        .execute(&workflow, HashMap::new())
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.failed_nodes[0].node_id, "Weird");
    assert_eq!(
        result.failed_nodes[0].kind,
        flowgraph_core::ErrorKind::NoHandler
    );
}

/// A cyclic workflow is rejected before anything runs.
#[tokio::test]
async fn cyclic_workflow_is_rejected() {
    let mut workflow = WorkflowBuilder::new()
        .add_node("A", "input", json!({}))
        .add_node("B", "transform", json!({}))
        .add_edge("A", "B")
        .build()
        .unwrap();
    workflow.nodes.get_mut("A").unwrap().dependencies.push("B".to_string());
    workflow.nodes.get_mut("B").unwrap().dependents.push("A".to_string());

    let handler = ScriptedHandler::for_types(&["input", "transform"]);
    let err = WorkflowExecutor::new(registry_of(handler))
        .execute(&workflow, HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Validation(_)));
}

/// A deadline cancels the workflow: in-flight handlers get the grace
/// period, unstarted nodes are skipped, and the result is marked
/// cancelled.
#[tokio::test]
async fn deadline_cancels_uncooperative_handlers() {
    let workflow = WorkflowBuilder::new()
        .add_node("Slow", "http", json!({}))
        .add_node("Never", "transform", json!({}))
        .add_edge("Slow", "Never")
        .build()
        .unwrap();

    let handler =
        ScriptedHandler::for_types(&["http", "transform"]).with_delay(Duration::from_secs(30));
    let config = ExecutorConfig {
        deadline: Some(Duration::from_millis(50)),
        grace_period: Duration::from_millis(50),
        ..ExecutorConfig::default()
    };
    let executor = WorkflowExecutor::with_config(registry_of(handler), config);

    let started = Instant::now();
    let result = executor.execute(&workflow, HashMap::new()).await.unwrap();

    assert!(result.cancelled);
    assert!(!result.success);
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "cancellation must not wait for the handler"
    );
    assert!(result
        .failed_nodes
        .iter()
        .any(|f| f.node_id == "Slow" && f.kind == flowgraph_core::ErrorKind::Cancelled));
    assert!(!result.execution_order.contains(&"Never".to_string()));
}

/// Cooperative handlers observe the cancel token and settle inside the
/// grace period.
#[tokio::test]
async fn deadline_cancels_cooperative_handlers() {
    struct Cooperative {
        types: Vec<String>,
    }
    #[async_trait]
    impl NodeHandler for Cooperative {
        fn name(&self) -> &str {
            "cooperative"
        }
        fn supported_node_types(&self) -> &[String] {
            &self.types
        }
        async fn execute(&self, input: HandlerInput) -> flowgraph_core::Result<HandlerOutput> {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(30)) => {
                    Ok(HandlerOutput::ok(json!({})))
                }
                _ = input.execution.cancel.cancelled() => {
                    Err(FlowError::cancelled(Some(input.execution.node_id.clone())))
                }
            }
        }
    }

    let workflow = WorkflowBuilder::new()
        .add_node("Slow", "http", json!({}))
        .build()
        .unwrap();
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(Cooperative {
        types: vec!["http".to_string()],
    }));
    let config = ExecutorConfig {
        deadline: Some(Duration::from_millis(50)),
        grace_period: Duration::from_secs(5),
        ..ExecutorConfig::default()
    };
    let started = Instant::now();
    let result = WorkflowExecutor::with_config(registry, config)
        .execute(&workflow, HashMap::new())
        .await
        .unwrap();

    assert!(result.cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(
        result.failed_nodes[0].kind,
        flowgraph_core::ErrorKind::Cancelled
    );
}

/// Event streaming surfaces the execution lifecycle in order.
#[tokio::test]
async fn events_stream_lifecycle() {
    let workflow = WorkflowBuilder::new()
        .add_node("A", "input", json!({}))
        .add_node("B", "transform", json!({}))
        .add_edge("A", "B")
        .outputs(["B"])
        .build()
        .unwrap();

    let handler = ScriptedHandler::for_types(&["input", "transform"]);
    let (tx, mut rx) = tokio::sync::mpsc::channel(32);
    let executor = WorkflowExecutor::new(registry_of(handler));
    let result = executor
        .execute_with_events(&workflow, HashMap::new(), tx)
        .await
        .unwrap();
    assert!(result.success);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(events.first(), Some(ExecutionEvent::Started { .. })));
    assert!(matches!(
        events.last(),
        Some(ExecutionEvent::Finished { success: true, .. })
    ));
    let started_nodes = events
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::NodeStarted { .. }))
        .count();
    let finished_nodes = events
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::NodeFinished { .. }))
        .count();
    assert_eq!(started_nodes, 2);
    assert_eq!(finished_nodes, 2);
}

/// Duplicated output ids merge deterministically in declaration order.
#[tokio::test]
async fn final_outputs_merge_in_output_order() {
    let workflow = WorkflowBuilder::new()
        .add_node("A", "output", json!({}))
        .add_node("B", "output", json!({}))
        .outputs(["A", "B"])
        .max_concurrent(2)
        .build()
        .unwrap();

    let handler = ScriptedHandler::for_types(&["output"])
        .respond("A", json!({"name": "from-a", "a": 1}))
        .respond("B", json!({"name": "from-b", "b": 2}));
    let result = WorkflowExecutor::new(registry_of(handler))
        .execute(&workflow, HashMap::new())
        .await
        .unwrap();

    assert_eq!(result.outputs.get("name"), Some(&json!("from-b")));
    assert_eq!(result.outputs.get("a"), Some(&json!(1)));
    assert_eq!(result.outputs.get("b"), Some(&json!(2)));
}
