//! Workflow definition and validation
//!
//! A workflow is an immutable description: nodes, edges, an entry point
//! and the initial state. Validation happens once at build time; a built
//! workflow is shared by all of its runs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use uuid::Uuid;

use super::edge::Edge;
use super::node::NodeDef;
use super::state::StatePatch;
use crate::error::EngineError;

/// An immutable workflow description
///
/// Built through [`WorkflowBuilder`]; construction validates the graph
/// (existing endpoints, unique names, no cycles outside loop edges).
#[derive(Debug)]
pub struct Workflow {
    /// Workflow identity (fresh per build)
    pub id: Uuid,

    /// Workflow name
    pub name: String,

    /// Version label
    pub version: String,

    /// Initial shared state
    pub initial_state: StatePatch,

    /// Entry node name
    pub entry_point: String,

    nodes: HashMap<String, NodeDef>,
    edges: Vec<Edge>,
}

impl Workflow {
    /// Start building a workflow
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    /// Look up a node by name
    pub fn node(&self, name: &str) -> Option<&NodeDef> {
        self.nodes.get(name)
    }

    /// All node names
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Edges in insertion order
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Edges whose source is the given node, in insertion order
    pub fn edges_from<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Edge> {
        self.edges.iter().filter(move |e| e.from_node() == node)
    }
}

/// Builder for [`Workflow`]
///
/// # Example
///
/// ```
/// use windlass_core::model::{Edge, NodeDef, NodeOutput, Workflow};
///
/// let workflow = Workflow::builder("pipeline")
///     .add_node(NodeDef::function("a", |_| async { Ok(NodeOutput::empty()) }))
///     .add_node(NodeDef::function("b", |_| async { Ok(NodeOutput::empty()) }))
///     .add_edge(Edge::sequential("a", "b"))
///     .entry_point("a")
///     .build()
///     .unwrap();
///
/// assert_eq!(workflow.node_count(), 2);
/// ```
pub struct WorkflowBuilder {
    name: String,
    version: String,
    initial_state: StatePatch,
    nodes: Vec<NodeDef>,
    edges: Vec<Edge>,
    entry_point: Option<String>,
}

impl WorkflowBuilder {
    /// Create a builder
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "1".to_string(),
            initial_state: StatePatch::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            entry_point: None,
        }
    }

    /// Set the version label
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the initial state from a JSON object
    ///
    /// Non-object values are ignored; workflow state is a flat record.
    pub fn initial_state(mut self, value: serde_json::Value) -> Self {
        if let serde_json::Value::Object(fields) = value {
            self.initial_state = fields;
        }
        self
    }

    /// Add a node
    pub fn add_node(mut self, node: NodeDef) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add an edge
    pub fn add_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Set the entry node
    pub fn entry_point(mut self, name: impl Into<String>) -> Self {
        self.entry_point = Some(name.into());
        self
    }

    /// Validate and build the workflow
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for a missing/unknown entry
    /// point, duplicate node names, dangling edge endpoints, or a cycle
    /// formed by non-loop edges.
    pub fn build(self) -> Result<Arc<Workflow>, EngineError> {
        let entry_point = self
            .entry_point
            .ok_or_else(|| EngineError::validation("no entry point set"))?;

        let mut nodes = HashMap::with_capacity(self.nodes.len());
        for node in self.nodes {
            if nodes.contains_key(&node.name) {
                return Err(EngineError::Validation(format!(
                    "duplicate node: {}",
                    node.name
                )));
            }
            nodes.insert(node.name.clone(), node);
        }

        if nodes.is_empty() {
            return Err(EngineError::validation("workflow has no nodes"));
        }
        if !nodes.contains_key(&entry_point) {
            return Err(EngineError::Validation(format!(
                "entry point references missing node: {entry_point}"
            )));
        }

        for edge in &self.edges {
            if !nodes.contains_key(edge.from_node()) {
                return Err(EngineError::Validation(format!(
                    "edge references missing node: {}",
                    edge.from_node()
                )));
            }
            for target in edge.possible_targets() {
                if !nodes.contains_key(target) {
                    return Err(EngineError::Validation(format!(
                        "edge references missing node: {target}"
                    )));
                }
            }
        }

        detect_cycles(&nodes, &self.edges)?;

        Ok(Arc::new(Workflow {
            id: Uuid::now_v7(),
            name: self.name,
            version: self.version,
            initial_state: self.initial_state,
            entry_point,
            nodes,
            edges: self.edges,
        }))
    }
}

/// Reject cycles formed by non-loop edges
///
/// Loop edges are the only sanctioned cycles; everything else must be a
/// DAG. Depth-first search with a recursion stack over the non-loop edge
/// set.
fn detect_cycles(
    nodes: &HashMap<String, NodeDef>,
    edges: &[Edge],
) -> Result<(), EngineError> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges.iter().filter(|e| !e.is_loop()) {
        adjacency
            .entry(edge.from_node())
            .or_default()
            .extend(edge.possible_targets());
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut in_stack: HashSet<&str> = HashSet::new();

    fn visit<'a>(
        node: &'a str,
        adjacency: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        in_stack: &mut HashSet<&'a str>,
    ) -> Result<(), EngineError> {
        if in_stack.contains(node) {
            return Err(EngineError::Validation(format!(
                "cycle through node {node} (only loop edges may form cycles)"
            )));
        }
        if !visited.insert(node) {
            return Ok(());
        }
        in_stack.insert(node);
        if let Some(targets) = adjacency.get(node) {
            for target in targets {
                visit(target, adjacency, visited, in_stack)?;
            }
        }
        in_stack.remove(node);
        Ok(())
    }

    for node in nodes.keys() {
        visit(node.as_str(), &adjacency, &mut visited, &mut in_stack)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeOutput, RunState};
    use serde_json::json;

    fn noop(name: &str) -> NodeDef {
        NodeDef::function(name, |_| async { Ok(NodeOutput::empty()) })
    }

    #[test]
    fn test_build_valid_workflow() {
        let workflow = Workflow::builder("pipeline")
            .version("2")
            .initial_state(json!({"count": 0}))
            .add_node(noop("a"))
            .add_node(noop("b"))
            .add_edge(Edge::sequential("a", "b"))
            .entry_point("a")
            .build()
            .unwrap();

        assert_eq!(workflow.name, "pipeline");
        assert_eq!(workflow.version, "2");
        assert_eq!(workflow.entry_point, "a");
        assert!(workflow.node("a").is_some());
        assert_eq!(workflow.edges_from("a").count(), 1);
    }

    #[test]
    fn test_missing_entry_point() {
        let result = Workflow::builder("w").add_node(noop("a")).build();
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_entry_point_must_exist() {
        let result = Workflow::builder("w")
            .add_node(noop("a"))
            .entry_point("ghost")
            .build();
        assert!(matches!(result, Err(EngineError::Validation(msg)) if msg.contains("ghost")));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let result = Workflow::builder("w")
            .add_node(noop("a"))
            .add_node(noop("a"))
            .entry_point("a")
            .build();
        assert!(matches!(result, Err(EngineError::Validation(msg)) if msg.contains("duplicate")));
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let result = Workflow::builder("w")
            .add_node(noop("a"))
            .add_edge(Edge::sequential("a", "missing"))
            .entry_point("a")
            .build();
        assert!(matches!(result, Err(EngineError::Validation(msg)) if msg.contains("missing")));
    }

    #[test]
    fn test_cycle_outside_loop_rejected() {
        let result = Workflow::builder("w")
            .add_node(noop("a"))
            .add_node(noop("b"))
            .add_edge(Edge::sequential("a", "b"))
            .add_edge(Edge::sequential("b", "a"))
            .entry_point("a")
            .build();
        assert!(matches!(result, Err(EngineError::Validation(msg)) if msg.contains("cycle")));
    }

    #[test]
    fn test_loop_edge_cycle_allowed() {
        let workflow = Workflow::builder("w")
            .add_node(noop("head"))
            .add_node(noop("body"))
            .add_node(noop("done"))
            .add_edge(Edge::looping(
                "head",
                "body",
                |s: &RunState| s.get_i64("i").unwrap_or(0) < 3,
                10,
                Some("done".to_string()),
            ))
            .entry_point("head")
            .build();
        assert!(workflow.is_ok());
    }

    #[test]
    fn test_parallel_fan_out_is_acyclic() {
        let workflow = Workflow::builder("w")
            .add_node(noop("a"))
            .add_node(noop("b"))
            .add_node(noop("c"))
            .add_node(noop("d"))
            .add_edge(Edge::parallel("a", ["b", "c"]))
            .add_edge(Edge::sequential("b", "d"))
            .add_edge(Edge::sequential("c", "d"))
            .entry_point("a")
            .build();
        assert!(workflow.is_ok());
    }
}
