//! Workflow executor: the outer control loop.
//!
//! [`WorkflowExecutor`] turns the scheduler and dispatcher into a workflow
//! execution:
//!
//! 1. Ask the scheduler for ready nodes, bounded by the concurrency cap.
//! 2. Dispatch the batch concurrently on a [`JoinSet`].
//! 3. On each completion, update the context, apply handler signals, and
//!    report the verdict back to the scheduler.
//! 4. Repeat until the scheduler is quiescent.
//!
//! State transitions are serialised in this loop; only handler calls run
//! concurrently, and the handler call is the only suspension point the
//! orchestrator observes. `node_outputs` insertion order equals handler
//! completion order, which fixes pruning order and final-output merges.
//!
//! A workflow-level deadline cancels cooperatively: dispatching stops, the
//! shared [`CancellationToken`] fires, and in-flight handlers get a grace
//! period to settle before being aborted.

use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::context::{ContextLimits, ExecutionContext};
use crate::dispatch::{Dispatcher, HandlerOutput, HandlerRegistry};
use crate::error::{ErrorKind, Result};
use crate::resolver::{LoopFrame, ParallelFrame};
use crate::retry::RetryPolicy;
use crate::scheduler::{CompletionFlags, NodeFailure, NodeState, Scheduler};
use crate::workflow::{CompiledWorkflow, FrameKind, LoopContext};

/// Executor tuning knobs.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub retry: RetryPolicy,
    pub limits: ContextLimits,
    /// Workflow-level cancel deadline. `None` runs to completion.
    pub deadline: Option<Duration>,
    /// How long in-flight handlers get to settle after cancellation.
    pub grace_period: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            limits: ContextLimits::default(),
            deadline: None,
            grace_period: Duration::from_secs(5),
        }
    }
}

/// Progress events streamed during execution.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    Started { execution_id: String },
    NodeStarted { node_id: String },
    NodeFinished { node_id: String, duration_ms: u64 },
    NodeFailed { node_id: String, error: String },
    Cancelled { execution_id: String },
    Finished { execution_id: String, success: bool },
}

/// The outcome of one workflow execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub success: bool,
    /// Merged output-node pairs, deterministic per the declared output
    /// order.
    pub outputs: serde_json::Map<String, Value>,
    /// Node ids in handler-completion order; failed nodes are included,
    /// skipped nodes are not.
    pub execution_order: Vec<String>,
    pub failed_nodes: Vec<NodeFailure>,
    pub durations: HashMap<String, u64>,
    pub cancelled: bool,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

/// A buffered event channel plus the stream side, for callers that want
/// `Stream` semantics over [`ExecutionEvent`]s.
pub fn event_channel(
    buffer: usize,
) -> (mpsc::Sender<ExecutionEvent>, ReceiverStream<ExecutionEvent>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (tx, ReceiverStream::new(rx))
}

struct TaskOutcome {
    node_id: String,
    outcome: Result<HandlerOutput>,
    duration_ms: u64,
}

struct RunState {
    ctx: ExecutionContext,
    scheduler: Scheduler,
    execution_order: Vec<String>,
    durations: HashMap<String, u64>,
}

/// Drives compiled workflows to completion against a handler registry.
#[derive(Debug, Clone)]
pub struct WorkflowExecutor {
    dispatcher: Dispatcher,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self::with_config(registry, ExecutorConfig::default())
    }

    pub fn with_config(registry: HandlerRegistry, config: ExecutorConfig) -> Self {
        Self {
            dispatcher: Dispatcher::new(registry).with_retry(config.retry.clone()),
            config,
        }
    }

    /// Execute a workflow without event streaming.
    pub async fn execute(
        &self,
        workflow: &CompiledWorkflow,
        inputs: HashMap<String, Value>,
    ) -> Result<ExecutionResult> {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        self.execute_with_events(workflow, inputs, tx).await
    }

    /// Execute a workflow, streaming [`ExecutionEvent`]s as they occur.
    /// Send failures (receiver dropped) are ignored.
    pub async fn execute_with_events(
        &self,
        workflow: &CompiledWorkflow,
        inputs: HashMap<String, Value>,
        events: mpsc::Sender<ExecutionEvent>,
    ) -> Result<ExecutionResult> {
        let execution_id = uuid::Uuid::new_v4().to_string();
        let started_at = chrono::Utc::now();
        let started = Instant::now();

        tracing::info!(
            execution_id = %execution_id,
            nodes = workflow.nodes.len(),
            cap = workflow.concurrency_cap(),
            "starting workflow execution"
        );
        let _ = events
            .send(ExecutionEvent::Started {
                execution_id: execution_id.clone(),
            })
            .await;

        let mut state = RunState {
            ctx: ExecutionContext::new(inputs).with_limits(self.config.limits),
            scheduler: Scheduler::new(workflow)?,
            execution_order: Vec::new(),
            durations: HashMap::new(),
        };

        let cancel = CancellationToken::new();
        let cap = workflow.concurrency_cap();
        let mut join_set: JoinSet<TaskOutcome> = JoinSet::new();
        let mut task_nodes: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut in_flight = 0usize;
        let mut cancelled = false;

        while !state.scheduler.is_execution_complete() {
            // Admission: fill the available slots with ready nodes.
            if !cancelled {
                let slots = cap.saturating_sub(in_flight);
                if slots > 0 {
                    let batch = state.scheduler.ready_nodes(slots);
                    if !batch.is_empty() {
                        state.scheduler.mark_executing(&batch)?;
                        for node_id in &batch {
                            let node = workflow.node(node_id)?.clone();
                            let (loop_frame, parallel_frame) =
                                frames_for(workflow, &state.ctx, node_id);
                            let dispatcher = self.dispatcher.clone();
                            let ctx = state.ctx.clone();
                            let exec_id = execution_id.clone();
                            let token = cancel.clone();

                            let _ = events
                                .send(ExecutionEvent::NodeStarted {
                                    node_id: node_id.clone(),
                                })
                                .await;

                            let handle = join_set.spawn(async move {
                                let dispatch_started = Instant::now();
                                let outcome = dispatcher
                                    .dispatch(
                                        &node,
                                        &ctx,
                                        &exec_id,
                                        loop_frame,
                                        parallel_frame,
                                        token,
                                    )
                                    .await;
                                TaskOutcome {
                                    node_id: node.id,
                                    outcome,
                                    duration_ms: dispatch_started.elapsed().as_millis() as u64,
                                }
                            });
                            task_nodes.insert(handle.id(), node_id.clone());
                            in_flight += 1;
                        }
                    }
                }
            }

            if in_flight == 0 {
                if cancelled {
                    state.scheduler.skip_unstarted();
                    break;
                }
                if state.scheduler.is_execution_complete() {
                    break;
                }
                // Nothing ready, nothing running, workflow incomplete.
                if let Some(failure) = state.scheduler.record_deadlock() {
                    tracing::error!(execution_id = %execution_id, error = %failure.error, "deadlock");
                    let _ = events
                        .send(ExecutionEvent::NodeFailed {
                            node_id: failure.node_id.clone(),
                            error: failure.error.clone(),
                        })
                        .await;
                }
                break;
            }

            // Await the next completion, bounded by the remaining deadline.
            let joined = match remaining_deadline(started, self.config.deadline) {
                Some(remaining) => {
                    match tokio::time::timeout(remaining, join_set.join_next()).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            // Deadline reached: stop dispatching, signal
                            // in-flight handlers, give them the grace
                            // period, then abort what remains.
                            cancelled = true;
                            cancel.cancel();
                            tracing::warn!(execution_id = %execution_id, "deadline reached, cancelling");
                            let _ = events
                                .send(ExecutionEvent::Cancelled {
                                    execution_id: execution_id.clone(),
                                })
                                .await;

                            while in_flight > 0 {
                                match tokio::time::timeout(
                                    self.config.grace_period,
                                    join_set.join_next(),
                                )
                                .await
                                {
                                    Ok(Some(Ok(task))) => {
                                        in_flight -= 1;
                                        handle_completion(&mut state, workflow, &events, task)
                                            .await?;
                                    }
                                    Ok(Some(Err(join_err))) => {
                                        in_flight -= 1;
                                        handle_join_error(
                                            &mut state,
                                            &mut task_nodes,
                                            &events,
                                            join_err,
                                        )
                                        .await?;
                                    }
                                    Ok(None) => {
                                        in_flight = 0;
                                    }
                                    Err(_) => {
                                        tracing::warn!(
                                            execution_id = %execution_id,
                                            "grace period expired, aborting in-flight handlers"
                                        );
                                        join_set.abort_all();
                                        for node_id in state.scheduler.executing_nodes() {
                                            state.scheduler.force_fail_executing(
                                                &node_id,
                                                "cancelled: grace period expired",
                                                ErrorKind::Cancelled,
                                            );
                                        }
                                        in_flight = 0;
                                    }
                                }
                            }
                            state.scheduler.skip_unstarted();
                            break;
                        }
                    }
                }
                None => join_set.join_next().await,
            };

            match joined {
                Some(Ok(task)) => {
                    in_flight -= 1;
                    task_nodes.retain(|_, id| id != &task.node_id);
                    handle_completion(&mut state, workflow, &events, task).await?;
                }
                Some(Err(join_err)) => {
                    in_flight -= 1;
                    handle_join_error(&mut state, &mut task_nodes, &events, join_err).await?;
                }
                None => {}
            }
        }

        let failed_nodes = state.scheduler.failures().to_vec();
        let success = !cancelled
            && compute_success(workflow, &state.scheduler, &failed_nodes);
        let outputs = state.ctx.build_final_outputs(&workflow.output_node_ids);

        tracing::info!(
            execution_id = %execution_id,
            success,
            cancelled,
            executed = state.execution_order.len(),
            failed = failed_nodes.len(),
            "workflow execution finished"
        );
        let _ = events
            .send(ExecutionEvent::Finished {
                execution_id: execution_id.clone(),
                success,
            })
            .await;

        Ok(ExecutionResult {
            execution_id,
            success,
            outputs,
            execution_order: state.execution_order,
            failed_nodes,
            durations: state.durations,
            cancelled,
            started_at,
            finished_at: chrono::Utc::now(),
        })
    }
}

/// Apply one handler completion: store the output, apply signals serially,
/// and report the verdict to the scheduler.
async fn handle_completion(
    state: &mut RunState,
    workflow: &CompiledWorkflow,
    events: &mpsc::Sender<ExecutionEvent>,
    task: TaskOutcome,
) -> Result<()> {
    let TaskOutcome {
        node_id,
        outcome,
        duration_ms,
    } = task;
    state.durations.insert(node_id.clone(), duration_ms);
    state.execution_order.push(node_id.clone());

    let output = match outcome {
        Ok(output) => output,
        Err(err) => {
            state
                .scheduler
                .mark_failed(&node_id, &err.to_string(), err.kind())?;
            let _ = events
                .send(ExecutionEvent::NodeFailed {
                    node_id,
                    error: err.to_string(),
                })
                .await;
            return Ok(());
        }
    };

    match state.ctx.store_node_output(&node_id, output.result.clone()) {
        Ok(next) => state.ctx = next,
        Err(err) => {
            state
                .scheduler
                .mark_failed(&node_id, &err.to_string(), err.kind())?;
            let _ = events
                .send(ExecutionEvent::NodeFailed {
                    node_id,
                    error: err.to_string(),
                })
                .await;
            return Ok(());
        }
    }

    // Emissions are applied here, serially, in completion order; the
    // later completion wins on key collisions. Sorted per output for a
    // deterministic order within one node.
    let mut variables: Vec<_> = output.signals.emitted_variables.iter().collect();
    variables.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in variables {
        state.ctx = state.ctx.set_variable(key, value.clone());
    }
    let mut shared: Vec<_> = output.signals.emitted_shared.iter().collect();
    shared.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in shared {
        state.ctx = state.ctx.set_shared_memory(key, value.clone(), &node_id);
    }

    let flags = CompletionFlags {
        terminal: output.signals.is_terminal || workflow.terminate_on_reach.contains(&node_id),
        skip_downstream: output.signals.skip_downstream,
    };
    state
        .scheduler
        .mark_completed(&node_id, &output.result, flags)?;

    let _ = events
        .send(ExecutionEvent::NodeFinished {
            node_id,
            duration_ms,
        })
        .await;
    Ok(())
}

/// A join error means the handler task panicked or was aborted.
async fn handle_join_error(
    state: &mut RunState,
    task_nodes: &mut HashMap<tokio::task::Id, String>,
    events: &mpsc::Sender<ExecutionEvent>,
    join_err: tokio::task::JoinError,
) -> Result<()> {
    let node_id = match task_nodes.remove(&join_err.id()) {
        Some(id) => id,
        None => return Ok(()),
    };
    if join_err.is_cancelled() {
        // Aborted tasks were already force-failed by the cancel path.
        return Ok(());
    }
    let message = "handler panicked".to_string();
    state.execution_order.push(node_id.clone());
    state
        .scheduler
        .mark_failed(&node_id, &message, ErrorKind::HandlerRuntime)?;
    let _ = events
        .send(ExecutionEvent::NodeFailed {
            node_id,
            error: message,
        })
        .await;
    Ok(())
}

fn remaining_deadline(started: Instant, deadline: Option<Duration>) -> Option<Duration> {
    deadline.map(|d| d.checked_sub(started.elapsed()).unwrap_or(Duration::ZERO))
}

/// Success iff no output node failed and every output node completed — or,
/// once a terminal signal fired, at least one did. With no outputs
/// declared, success means no recorded failures.
fn compute_success(
    workflow: &CompiledWorkflow,
    scheduler: &Scheduler,
    failures: &[NodeFailure],
) -> bool {
    if workflow.output_node_ids.is_empty() {
        return failures.is_empty();
    }
    let states: Vec<Option<NodeState>> = workflow
        .output_node_ids
        .iter()
        .map(|id| scheduler.state(id))
        .collect();
    if states.iter().any(|s| *s == Some(NodeState::Failed)) {
        return false;
    }
    if scheduler.terminal_fired() {
        states.iter().any(|s| *s == Some(NodeState::Completed))
    } else {
        states.iter().all(|s| *s == Some(NodeState::Completed))
    }
}

/// Build the loop/parallel frame for a body node from its owning loop
/// node's stored output. With nested bodies the deepest owning loop wins;
/// no frame is produced until the loop node has an output.
fn frames_for(
    workflow: &CompiledWorkflow,
    ctx: &ExecutionContext,
    node_id: &str,
) -> (Option<LoopFrame>, Option<ParallelFrame>) {
    let mut owners: Vec<&LoopContext> = workflow
        .loop_contexts
        .values()
        .filter(|lc| lc.body_node_ids.iter().any(|body| body == node_id))
        .collect();
    owners.sort_by_key(|lc| {
        let depth = workflow
            .nodes
            .get(&lc.loop_node_id)
            .map(|n| n.depth)
            .unwrap_or(0);
        (std::cmp::Reverse(depth), lc.loop_node_id.clone())
    });

    for owner in owners {
        let Some(output) = ctx.node_output(&owner.loop_node_id) else {
            continue;
        };
        match owner.kind {
            FrameKind::Loop => {
                if let Ok(frame) = serde_json::from_value::<LoopFrame>(output.clone()) {
                    return (Some(frame), None);
                }
            }
            FrameKind::Parallel => {
                if let Ok(frame) = serde_json::from_value::<ParallelFrame>(output.clone()) {
                    return (None, Some(frame));
                }
            }
        }
    }
    (None, None)
}
