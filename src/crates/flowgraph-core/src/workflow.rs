//! Compiled workflow data model.
//!
//! A [`CompiledWorkflow`] is the input to the engine: a directed acyclic
//! graph of typed nodes produced by an out-of-scope builder UI or compiler.
//! The model is JSON-compatible end to end — node configs stay as raw
//! [`serde_json::Value`]s, and schema validation of configs is a handler
//! concern. The engine only checks structure: every referenced id exists
//! and the dependency relation is acyclic.
//!
//! [`WorkflowBuilder`] assembles workflows in code (mainly for tests and
//! embedders); it derives `dependencies`/`dependents` from the edge list
//! and fills node depths from the computed topological layering.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{FlowError, Result};

/// How an edge's satisfaction is decided by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum HandleType {
    /// Satisfied when the source node completes successfully.
    #[default]
    Default,
    /// Satisfied when the source's output selects the matching route.
    Conditional,
    /// Satisfied when the source failed and its failure is tolerated.
    Error,
}

/// A node in the compiled workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub name: String,
    /// Arbitrary handler config. String leaves are interpolated by the
    /// dispatcher before the handler sees them.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Topological depth hint used for deterministic ready ordering.
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub dependents: Vec<String>,
}

impl NodeDescriptor {
    /// Whether this node's failure is tolerated (error-handled dependents
    /// may still run). Read from the `tolerateFailure` config flag.
    pub fn tolerates_failure(&self) -> bool {
        self.config
            .get("tolerateFailure")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

/// An edge between two nodes, carrying handle semantics for routers and
/// error branches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDescriptor {
    pub source: String,
    pub target: String,
    /// For conditional edges, the route id the source must select.
    #[serde(default)]
    pub source_handle: Option<String>,
    #[serde(default)]
    pub target_handle: Option<String>,
    #[serde(default)]
    pub handle_type: HandleType,
}

/// Which frame kind a loop context provides to its body nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum FrameKind {
    #[default]
    Loop,
    Parallel,
}

/// Declares a loop (or parallel) node and the body nodes that receive its
/// iteration frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopContext {
    pub loop_node_id: String,
    #[serde(default)]
    pub body_node_ids: Vec<String>,
    #[serde(default)]
    pub kind: FrameKind,
}

fn default_concurrency() -> i64 {
    1
}

/// A compiled workflow: the unit of execution accepted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledWorkflow {
    pub nodes: HashMap<String, NodeDescriptor>,
    #[serde(default)]
    pub edges: HashMap<String, EdgeDescriptor>,
    /// Advisory topological layering. The scheduler stays correct when this
    /// is absent or stale; [`CompiledWorkflow::compute_execution_levels`]
    /// recomputes it from the dependency lists.
    #[serde(default)]
    pub execution_levels: Option<Vec<Vec<String>>>,
    #[serde(default)]
    pub trigger_node_id: Option<String>,
    #[serde(default)]
    pub output_node_ids: Vec<String>,
    #[serde(default)]
    pub loop_contexts: HashMap<String, LoopContext>,
    /// Maximum handler calls in flight. Zero or negative behaves as 1.
    #[serde(default = "default_concurrency")]
    pub max_concurrent_nodes: i64,
    /// Output nodes whose completion short-circuits the rest of the graph.
    /// Explicit by design: termination is never inferred from node type.
    #[serde(default)]
    pub terminate_on_reach: HashSet<String>,
}

impl CompiledWorkflow {
    /// The effective concurrency cap: `max(1, max_concurrent_nodes)`.
    pub fn concurrency_cap(&self) -> usize {
        self.max_concurrent_nodes.max(1) as usize
    }

    /// Look up a node, failing with a validation error when absent.
    pub fn node(&self, id: &str) -> Result<&NodeDescriptor> {
        self.nodes
            .get(id)
            .ok_or_else(|| FlowError::validation(format!("node '{}' does not exist", id)))
    }

    /// Validate graph structure: every referenced id exists, and the
    /// dependency relation is acyclic.
    pub fn validate(&self) -> Result<()> {
        for (id, node) in &self.nodes {
            if node.id != *id {
                return Err(FlowError::validation(format!(
                    "node map key '{}' does not match node id '{}'",
                    id, node.id
                )));
            }
            for dep in node.dependencies.iter().chain(node.dependents.iter()) {
                if !self.nodes.contains_key(dep) {
                    return Err(FlowError::validation(format!(
                        "node '{}' references missing node '{}'",
                        id, dep
                    )));
                }
            }
        }
        for (edge_id, edge) in &self.edges {
            if !self.nodes.contains_key(&edge.source) {
                return Err(FlowError::validation(format!(
                    "edge '{}' source '{}' does not exist",
                    edge_id, edge.source
                )));
            }
            if !self.nodes.contains_key(&edge.target) {
                return Err(FlowError::validation(format!(
                    "edge '{}' target '{}' does not exist",
                    edge_id, edge.target
                )));
            }
        }
        if let Some(trigger) = &self.trigger_node_id {
            self.node(trigger)?;
        }
        for output in &self.output_node_ids {
            self.node(output)?;
        }
        for ctx in self.loop_contexts.values() {
            self.node(&ctx.loop_node_id)?;
            for body in &ctx.body_node_ids {
                self.node(body)?;
            }
        }

        // Kahn layering doubles as the cycle check.
        self.compute_execution_levels().map(|_| ())
    }

    /// Compute the topological layering from the dependency lists.
    ///
    /// Layer *k* contains every node whose dependencies all lie in layers
    /// < *k*. Layers are sorted by id for reproducible output. Fails with a
    /// validation error when the dependency relation is cyclic.
    pub fn compute_execution_levels(&self) -> Result<Vec<Vec<String>>> {
        let mut remaining: HashMap<&str, usize> = self
            .nodes
            .values()
            .map(|n| (n.id.as_str(), n.dependencies.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in self.nodes.values() {
            for dep in &node.dependencies {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(node.id.as_str());
            }
        }

        let mut current: Vec<&str> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        current.sort_unstable();

        let mut levels = Vec::new();
        let mut placed = 0usize;
        while !current.is_empty() {
            placed += current.len();
            let mut next: Vec<&str> = Vec::new();
            for id in &current {
                if let Some(downstream) = dependents.get(id) {
                    for dependent in downstream {
                        if let Some(count) = remaining.get_mut(dependent) {
                            if *count > 0 {
                                *count -= 1;
                                if *count == 0 {
                                    next.push(dependent);
                                }
                            }
                        }
                    }
                }
            }
            next.sort_unstable();
            levels.push(current.iter().map(|s| s.to_string()).collect());
            current = next;
        }

        if placed != self.nodes.len() {
            return Err(FlowError::validation(
                "workflow dependency relation contains a cycle".to_string(),
            ));
        }
        Ok(levels)
    }

    /// The execution levels, recomputed when the stored hint is absent.
    pub fn effective_execution_levels(&self) -> Result<Vec<Vec<String>>> {
        match &self.execution_levels {
            Some(levels) => Ok(levels.clone()),
            None => self.compute_execution_levels(),
        }
    }
}

/// Builder for assembling [`CompiledWorkflow`]s in code.
///
/// Dependencies, dependents, depths, and execution levels are derived at
/// [`build`](Self::build); callers only declare nodes and edges.
#[derive(Debug, Default)]
pub struct WorkflowBuilder {
    nodes: Vec<NodeDescriptor>,
    edges: Vec<EdgeDescriptor>,
    trigger_node_id: Option<String>,
    output_node_ids: Vec<String>,
    loop_contexts: HashMap<String, LoopContext>,
    max_concurrent_nodes: i64,
    terminate_on_reach: HashSet<String>,
}

impl WorkflowBuilder {
    pub fn new() -> Self {
        Self {
            max_concurrent_nodes: 1,
            ..Default::default()
        }
    }

    /// Add a node. The id doubles as the display name unless
    /// [`add_named_node`](Self::add_named_node) is used.
    pub fn add_node(
        mut self,
        id: impl Into<String>,
        node_type: impl Into<String>,
        config: serde_json::Value,
    ) -> Self {
        let id = id.into();
        self.nodes.push(NodeDescriptor {
            name: id.clone(),
            id,
            node_type: node_type.into(),
            config,
            depth: 0,
            dependencies: Vec::new(),
            dependents: Vec::new(),
        });
        self
    }

    pub fn add_named_node(
        mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        node_type: impl Into<String>,
        config: serde_json::Value,
    ) -> Self {
        self.nodes.push(NodeDescriptor {
            id: id.into(),
            name: name.into(),
            node_type: node_type.into(),
            config,
            depth: 0,
            dependencies: Vec::new(),
            dependents: Vec::new(),
        });
        self
    }

    /// Add a default (happy-path) edge.
    pub fn add_edge(self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.push_edge(source.into(), target.into(), None, HandleType::Default)
    }

    /// Add a conditional edge satisfied when `source` selects `route`.
    pub fn add_conditional_edge(
        self,
        source: impl Into<String>,
        target: impl Into<String>,
        route: impl Into<String>,
    ) -> Self {
        self.push_edge(
            source.into(),
            target.into(),
            Some(route.into()),
            HandleType::Conditional,
        )
    }

    /// Add an error-handled edge satisfied when `source` fails tolerably.
    pub fn add_error_edge(self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.push_edge(source.into(), target.into(), None, HandleType::Error)
    }

    fn push_edge(
        mut self,
        source: String,
        target: String,
        source_handle: Option<String>,
        handle_type: HandleType,
    ) -> Self {
        self.edges.push(EdgeDescriptor {
            source,
            target,
            source_handle,
            target_handle: None,
            handle_type,
        });
        self
    }

    pub fn trigger(mut self, id: impl Into<String>) -> Self {
        self.trigger_node_id = Some(id.into());
        self
    }

    pub fn outputs(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.output_node_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_concurrent(mut self, cap: i64) -> Self {
        self.max_concurrent_nodes = cap;
        self
    }

    pub fn terminate_on_reach(mut self, id: impl Into<String>) -> Self {
        self.terminate_on_reach.insert(id.into());
        self
    }

    pub fn loop_context(
        mut self,
        loop_node_id: impl Into<String>,
        kind: FrameKind,
        body: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let loop_node_id = loop_node_id.into();
        self.loop_contexts.insert(
            loop_node_id.clone(),
            LoopContext {
                loop_node_id,
                body_node_ids: body.into_iter().map(Into::into).collect(),
                kind,
            },
        );
        self
    }

    /// Derive graph indexes and produce a validated workflow.
    pub fn build(self) -> Result<CompiledWorkflow> {
        let mut nodes: HashMap<String, NodeDescriptor> = HashMap::new();
        for node in self.nodes {
            let id = node.id.clone();
            if nodes.insert(id.clone(), node).is_some() {
                return Err(FlowError::validation(format!("duplicate node id '{}'", id)));
            }
        }

        let mut edges = HashMap::new();
        for (idx, edge) in self.edges.into_iter().enumerate() {
            let source = nodes.get_mut(&edge.source).ok_or_else(|| {
                FlowError::validation(format!("edge source '{}' does not exist", edge.source))
            })?;
            if !source.dependents.contains(&edge.target) {
                source.dependents.push(edge.target.clone());
            }
            let target = nodes.get_mut(&edge.target).ok_or_else(|| {
                FlowError::validation(format!("edge target '{}' does not exist", edge.target))
            })?;
            if !target.dependencies.contains(&edge.source) {
                target.dependencies.push(edge.source.clone());
            }
            edges.insert(format!("e{}", idx), edge);
        }

        let mut workflow = CompiledWorkflow {
            nodes,
            edges,
            execution_levels: None,
            trigger_node_id: self.trigger_node_id,
            output_node_ids: self.output_node_ids,
            loop_contexts: self.loop_contexts,
            max_concurrent_nodes: self.max_concurrent_nodes,
            terminate_on_reach: self.terminate_on_reach,
        };

        let levels = workflow.compute_execution_levels()?;
        for (depth, level) in levels.iter().enumerate() {
            for id in level {
                if let Some(node) = workflow.nodes.get_mut(id) {
                    node.depth = depth as u32;
                }
            }
        }
        workflow.execution_levels = Some(levels);
        workflow.validate()?;
        Ok(workflow)
    }
}

/// Breadth-first reachability over dependents, used by embedders to slice
/// workflows for partial execution.
pub fn downstream_of(workflow: &CompiledWorkflow, start: &str) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(start);
    while let Some(id) = queue.pop_front() {
        if let Some(node) = workflow.nodes.get(id) {
            for dep in &node.dependents {
                if seen.insert(dep.clone()) {
                    queue.push_back(dep.as_str());
                }
            }
        }
    }
    seen
}
