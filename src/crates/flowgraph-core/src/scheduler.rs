//! Ready-queue scheduler.
//!
//! Tracks one lifecycle state per node and derives the set of nodes that
//! are executable *now*, honouring edge-handle semantics and failure
//! propagation. The scheduler is a pure in-memory state machine: every
//! operation is a non-blocking computation, and the orchestrator is the
//! only writer.
//!
//! # State machine
//!
//! ```text
//! pending ──► ready ──► executing ──► completed
//!    │          │           └───────► failed
//!    └──────────┴──────────────────►  skipped
//! ```
//!
//! - `pending → ready` once every dependency is resolved and at least one
//!   incoming edge is satisfied (fan-in joins tolerate skipped branches).
//! - `pending/ready → skipped` when every incoming edge is dead (the
//!   source was skipped or a router selected another route), or
//!   immediately when any predecessor failed without `tolerateFailure` —
//!   untolerated failures are fatal and carry forward through joins.
//! - A node transitions to `ready` at most once; retries are modelled as
//!   fresh attempts inside `executing`.
//!
//! # Edge handles
//!
//! A `default` edge is satisfied by the source completing. A `conditional`
//! edge is satisfied only when the source's output selected the matching
//! route (its `selectedRoute` field equals the edge's `source_handle`). An
//! `error` edge is satisfied only when the source failed *and* the source
//! tolerates failure — the failed node is then treated as satisfied for
//! scheduling so the error branch can inspect it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::error::{ErrorKind, FlowError, Result};
use crate::workflow::{CompiledWorkflow, HandleType};

/// Lifecycle state of a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Ready,
    Executing,
    Completed,
    Failed,
    Skipped,
}

impl NodeState {
    /// Whether this state is final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Completed | NodeState::Failed | NodeState::Skipped
        )
    }
}

/// A recorded node failure, in observation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node_id: String,
    pub error: String,
    pub kind: ErrorKind,
}

/// Completion signals the scheduler acts on.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionFlags {
    /// Short-circuit: every node not yet completed or failed is skipped.
    pub terminal: bool,
    /// Skip the immediate dependents of the completing node.
    pub skip_downstream: bool,
}

#[derive(Debug, Clone)]
struct IncomingEdge {
    source: String,
    handle_type: HandleType,
    source_handle: Option<String>,
}

enum EdgeStatus {
    Satisfied,
    /// Can never be satisfied, but does not poison the target: fan-in
    /// joins proceed on their surviving branches.
    Dead,
    /// An untolerated upstream failure: the target is skipped no matter
    /// what its other edges say, carrying the failure forward.
    Fatal,
    Unresolved,
}

/// Scheduler state over one workflow execution.
#[derive(Debug)]
pub struct Scheduler {
    states: HashMap<String, NodeState>,
    depths: HashMap<String, u32>,
    dependents: HashMap<String, Vec<String>>,
    incoming: HashMap<String, Vec<IncomingEdge>>,
    tolerate: HashSet<String>,
    selected_routes: HashMap<String, String>,
    failures: Vec<NodeFailure>,
    terminal_fired: bool,
}

impl Scheduler {
    /// Initialize scheduler state: dependency-free nodes become ready,
    /// everything else pending. Rejects structurally invalid workflows,
    /// including cyclic dependency relations.
    pub fn new(workflow: &CompiledWorkflow) -> Result<Self> {
        workflow.validate()?;

        let mut incoming: HashMap<String, Vec<IncomingEdge>> = HashMap::new();
        for edge in workflow.edges.values() {
            incoming.entry(edge.target.clone()).or_default().push(IncomingEdge {
                source: edge.source.clone(),
                handle_type: edge.handle_type,
                source_handle: edge.source_handle.clone(),
            });
        }
        // Dependencies without an explicit edge behave as default edges.
        for node in workflow.nodes.values() {
            let edges = incoming.entry(node.id.clone()).or_default();
            for dep in &node.dependencies {
                if !edges.iter().any(|e| &e.source == dep) {
                    edges.push(IncomingEdge {
                        source: dep.clone(),
                        handle_type: HandleType::Default,
                        source_handle: None,
                    });
                }
            }
        }

        let mut scheduler = Self {
            states: workflow
                .nodes
                .keys()
                .map(|id| (id.clone(), NodeState::Pending))
                .collect(),
            depths: workflow
                .nodes
                .values()
                .map(|n| (n.id.clone(), n.depth))
                .collect(),
            dependents: workflow
                .nodes
                .values()
                .map(|n| (n.id.clone(), n.dependents.clone()))
                .collect(),
            incoming,
            tolerate: workflow
                .nodes
                .values()
                .filter(|n| n.tolerates_failure())
                .map(|n| n.id.clone())
                .collect(),
            selected_routes: HashMap::new(),
            failures: Vec::new(),
            terminal_fired: false,
        };
        scheduler.refresh();
        Ok(scheduler)
    }

    pub fn state(&self, node_id: &str) -> Option<NodeState> {
        self.states.get(node_id).copied()
    }

    pub fn failures(&self) -> &[NodeFailure] {
        &self.failures
    }

    pub fn terminal_fired(&self) -> bool {
        self.terminal_fired
    }

    pub fn executing_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| **s == NodeState::Executing)
            .count()
    }

    /// Up to `available_slots` ready nodes, ordered by `(depth, id)` for
    /// reproducible batches.
    pub fn ready_nodes(&self, available_slots: usize) -> Vec<String> {
        let mut ready: Vec<&String> = self
            .states
            .iter()
            .filter(|(_, state)| **state == NodeState::Ready)
            .map(|(id, _)| id)
            .collect();
        ready.sort_by_key(|id| (self.depths.get(*id).copied().unwrap_or(0), (*id).clone()));
        ready
            .into_iter()
            .take(available_slots)
            .cloned()
            .collect()
    }

    /// Admit a batch picked from [`ready_nodes`](Self::ready_nodes).
    pub fn mark_executing(&mut self, node_ids: &[String]) -> Result<()> {
        for id in node_ids {
            match self.states.get_mut(id) {
                Some(state @ NodeState::Ready) => *state = NodeState::Executing,
                Some(state) => {
                    return Err(FlowError::validation(format!(
                        "node '{}' cannot start from state {:?}",
                        id, state
                    )))
                }
                None => {
                    return Err(FlowError::validation(format!(
                        "unknown node '{}'",
                        id
                    )))
                }
            }
        }
        Ok(())
    }

    /// Record a successful completion and recompute downstream readiness.
    ///
    /// The output's `selectedRoute` field (if any) drives conditional edge
    /// satisfaction. Terminal completions skip every node that is not yet
    /// completed or failed; in-flight nodes are left to settle.
    pub fn mark_completed(
        &mut self,
        node_id: &str,
        output: &Value,
        flags: CompletionFlags,
    ) -> Result<()> {
        match self.states.get_mut(node_id) {
            Some(state @ NodeState::Executing) => *state = NodeState::Completed,
            Some(state) => {
                return Err(FlowError::validation(format!(
                    "node '{}' cannot complete from state {:?}",
                    node_id, state
                )))
            }
            None => {
                return Err(FlowError::validation(format!("unknown node '{}'", node_id)))
            }
        }

        if let Some(route) = output.get("selectedRoute").and_then(Value::as_str) {
            tracing::debug!(node = %node_id, route = %route, "route selected");
            self.selected_routes
                .insert(node_id.to_string(), route.to_string());
        }

        if flags.skip_downstream {
            let dependents = self.dependents.get(node_id).cloned().unwrap_or_default();
            for dependent in dependents {
                self.skip_if_unstarted(&dependent);
            }
        }

        if flags.terminal {
            tracing::info!(node = %node_id, "terminal signal, short-circuiting remaining nodes");
            self.terminal_fired = true;
            let ids: Vec<String> = self.states.keys().cloned().collect();
            for id in ids {
                self.skip_if_unstarted(&id);
            }
        }

        self.refresh();
        Ok(())
    }

    /// Record a failure and propagate it: dependents whose every inbound
    /// edge is now dead are skipped; error-handled dependents of a
    /// tolerated failure become ready.
    pub fn mark_failed(&mut self, node_id: &str, error: &str, kind: ErrorKind) -> Result<()> {
        match self.states.get_mut(node_id) {
            Some(state @ NodeState::Executing) => *state = NodeState::Failed,
            Some(state) => {
                return Err(FlowError::validation(format!(
                    "node '{}' cannot fail from state {:?}",
                    node_id, state
                )))
            }
            None => {
                return Err(FlowError::validation(format!("unknown node '{}'", node_id)))
            }
        }
        tracing::warn!(node = %node_id, kind = %kind, error = %error, "node failed");
        self.failures.push(NodeFailure {
            node_id: node_id.to_string(),
            error: error.to_string(),
            kind,
        });
        self.refresh();
        Ok(())
    }

    /// Quiescence: no node is pending, ready, or executing.
    pub fn is_execution_complete(&self) -> bool {
        self.states.values().all(|state| state.is_terminal())
    }

    /// Nodes not yet in a terminal state, sorted by id.
    pub fn unfinished_nodes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .states
            .iter()
            .filter(|(_, state)| !state.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Record a deadlock: the workflow is incomplete but nothing is ready
    /// or executing. Every stuck node is skipped and a single deadlock
    /// failure is recorded against the first of them.
    pub fn record_deadlock(&mut self) -> Option<NodeFailure> {
        let stuck = self.unfinished_nodes();
        let first = stuck.first()?.clone();
        let failure = NodeFailure {
            node_id: first,
            error: format!(
                "deadlock: nodes [{}] can never become ready",
                stuck.join(", ")
            ),
            kind: ErrorKind::Deadlock,
        };
        for id in &stuck {
            self.skip_if_unstarted(id);
        }
        self.failures.push(failure.clone());
        Some(failure)
    }

    /// Skip everything that has not started; used on cancellation.
    pub fn skip_unstarted(&mut self) {
        let ids: Vec<String> = self.states.keys().cloned().collect();
        for id in ids {
            self.skip_if_unstarted(&id);
        }
    }

    /// Nodes currently in flight.
    pub fn executing_nodes(&self) -> Vec<String> {
        self.states
            .iter()
            .filter(|(_, state)| **state == NodeState::Executing)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Force an in-flight node into the failed state without a handler
    /// verdict; used when cancellation outlives the grace period.
    pub fn force_fail_executing(&mut self, node_id: &str, error: &str, kind: ErrorKind) {
        if let Some(state) = self.states.get_mut(node_id) {
            if *state == NodeState::Executing {
                *state = NodeState::Failed;
                self.failures.push(NodeFailure {
                    node_id: node_id.to_string(),
                    error: error.to_string(),
                    kind,
                });
            }
        }
    }

    fn skip_if_unstarted(&mut self, node_id: &str) {
        if let Some(state) = self.states.get_mut(node_id) {
            if matches!(state, NodeState::Pending | NodeState::Ready) {
                *state = NodeState::Skipped;
            }
        }
    }

    fn edge_status(&self, edge: &IncomingEdge) -> EdgeStatus {
        let source_state = match self.states.get(&edge.source) {
            Some(state) => *state,
            None => return EdgeStatus::Dead,
        };
        match source_state {
            NodeState::Pending | NodeState::Ready | NodeState::Executing => {
                EdgeStatus::Unresolved
            }
            NodeState::Completed => match edge.handle_type {
                HandleType::Default => EdgeStatus::Satisfied,
                HandleType::Conditional => {
                    let selected = self.selected_routes.get(&edge.source);
                    match (selected, &edge.source_handle) {
                        (Some(route), Some(handle)) if route == handle => EdgeStatus::Satisfied,
                        _ => EdgeStatus::Dead,
                    }
                }
                HandleType::Error => EdgeStatus::Dead,
            },
            NodeState::Failed => {
                if self.tolerate.contains(&edge.source) {
                    // Tolerated: the error branch runs, happy-path edges
                    // merely die.
                    if edge.handle_type == HandleType::Error {
                        EdgeStatus::Satisfied
                    } else {
                        EdgeStatus::Dead
                    }
                } else {
                    EdgeStatus::Fatal
                }
            }
            NodeState::Skipped => EdgeStatus::Dead,
        }
    }

    /// Recompute readiness to a fixpoint. Promotion happens only out of
    /// `pending`, so a node becomes ready at most once.
    fn refresh(&mut self) {
        loop {
            let mut changes: Vec<(String, NodeState)> = Vec::new();
            for (id, state) in &self.states {
                if *state != NodeState::Pending {
                    continue;
                }
                let edges = match self.incoming.get(id) {
                    Some(edges) if !edges.is_empty() => edges,
                    _ => {
                        changes.push((id.clone(), NodeState::Ready));
                        continue;
                    }
                };
                let mut any_unresolved = false;
                let mut any_satisfied = false;
                let mut any_fatal = false;
                for edge in edges {
                    match self.edge_status(edge) {
                        EdgeStatus::Unresolved => any_unresolved = true,
                        EdgeStatus::Satisfied => any_satisfied = true,
                        EdgeStatus::Fatal => any_fatal = true,
                        EdgeStatus::Dead => {}
                    }
                }
                // A fatal edge skips the node immediately, before the
                // rest of its dependencies even resolve.
                if any_fatal {
                    changes.push((id.clone(), NodeState::Skipped));
                } else if any_unresolved {
                    continue;
                } else if any_satisfied {
                    changes.push((id.clone(), NodeState::Ready));
                } else {
                    changes.push((id.clone(), NodeState::Skipped));
                }
            }
            if changes.is_empty() {
                break;
            }
            for (id, state) in changes {
                tracing::trace!(node = %id, state = ?state, "state transition");
                self.states.insert(id, state);
            }
        }
    }
}
