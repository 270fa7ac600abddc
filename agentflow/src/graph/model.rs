//! The execution graph and its structural validation.

use super::edge::Edge;
use super::levels::compute_levels;
use super::node::Node;
use crate::errors::{EngineError, GraphValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Values supplied by the caller for unwired input slots, keyed by node id
/// and slot name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunInputs {
    values: HashMap<String, HashMap<String, Value>>,
}

impl RunInputs {
    /// Creates empty run inputs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Supplies a value for `node.slot`.
    #[must_use]
    pub fn with(mut self, node_id: impl Into<String>, slot: impl Into<String>, value: Value) -> Self {
        self.set(node_id, slot, value);
        self
    }

    /// Supplies a value for `node.slot`.
    pub fn set(&mut self, node_id: impl Into<String>, slot: impl Into<String>, value: Value) {
        self.values
            .entry(node_id.into())
            .or_default()
            .insert(slot.into(), value);
    }

    /// Looks up a supplied value.
    #[must_use]
    pub fn get(&self, node_id: &str, slot: &str) -> Option<&Value> {
        self.values.get(node_id).and_then(|slots| slots.get(slot))
    }

    /// All values supplied for a node.
    #[must_use]
    pub fn for_node(&self, node_id: &str) -> Option<&HashMap<String, Value>> {
        self.values.get(node_id)
    }
}

/// The node and edge set for one run.
///
/// Construction does not validate; call [`ExecutionGraph::validate`] (the
/// scheduler always does) before relying on acyclicity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "GraphDocument", into = "GraphDocument")]
pub struct ExecutionGraph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    index: HashMap<String, usize>,
}

/// Serialized form of a graph, as persisted by the editor.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GraphDocument {
    nodes: Vec<Node>,
    #[serde(default)]
    edges: Vec<Edge>,
}

impl From<GraphDocument> for ExecutionGraph {
    fn from(doc: GraphDocument) -> Self {
        Self::new(doc.nodes, doc.edges)
    }
}

impl From<ExecutionGraph> for GraphDocument {
    fn from(graph: ExecutionGraph) -> Self {
        Self {
            nodes: graph.nodes,
            edges: graph.edges,
        }
    }
}

impl ExecutionGraph {
    /// Creates a graph from nodes and edges.
    #[must_use]
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        Self { nodes, edges, index }
    }

    /// Parses a graph from its JSON document form.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(json)?)
    }

    /// All nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// All edges in declaration order.
    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).and_then(|&i| self.nodes.get(i))
    }

    /// Edges leaving `id`, in declaration order. The position of an edge in
    /// this list is the consumer index of its target.
    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == id)
    }

    /// Edges entering `id`, in declaration order.
    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.target == id)
    }

    /// Number of consumers of the node's output.
    #[must_use]
    pub fn fan_out(&self, id: &str) -> usize {
        self.outgoing(id).count()
    }

    /// Distinct direct predecessors of `id`.
    #[must_use]
    pub fn predecessors<'a>(&'a self, id: &'a str) -> Vec<&'a str> {
        let mut seen = HashSet::new();
        self.incoming(id)
            .filter(|e| seen.insert(e.source.as_str()))
            .map(|e| e.source.as_str())
            .collect()
    }

    /// Distinct direct successors of `id`.
    #[must_use]
    pub fn successors<'a>(&'a self, id: &'a str) -> Vec<&'a str> {
        let mut seen = HashSet::new();
        self.outgoing(id)
            .filter(|e| seen.insert(e.target.as_str()))
            .map(|e| e.target.as_str())
            .collect()
    }

    /// Validates structure, acyclicity and required input wiring.
    ///
    /// Returns the topological levels on success.
    ///
    /// # Errors
    ///
    /// Returns a precondition error ([`EngineError::Validation`] or
    /// [`EngineError::CycleDetected`]) describing the first problem found.
    pub fn validate(&self, inputs: &RunInputs) -> Result<Vec<Vec<String>>, EngineError> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(GraphValidationError::duplicate_node(&node.id).into());
            }
        }

        for edge in &self.edges {
            let label = edge.to_string();
            let source = self
                .node(&edge.source)
                .ok_or_else(|| GraphValidationError::unknown_node(&label, &edge.source))?;
            let target = self
                .node(&edge.target)
                .ok_or_else(|| GraphValidationError::unknown_node(&label, &edge.target))?;
            if source.output(&edge.source_slot).is_none() {
                return Err(
                    GraphValidationError::unknown_slot(&source.id, &edge.source_slot, "output").into(),
                );
            }
            if target.input(&edge.target_slot).is_none() {
                return Err(
                    GraphValidationError::unknown_slot(&target.id, &edge.target_slot, "input").into(),
                );
            }
        }

        let levels = compute_levels(self)?;

        for node in &self.nodes {
            for slot in node.inputs.iter().filter(|s| s.required) {
                let wired = self.incoming(&node.id).any(|e| e.target_slot == slot.name);
                if !wired && inputs.get(&node.id, &slot.name).is_none() {
                    return Err(GraphValidationError::missing_input(&node.id, &slot.name).into());
                }
            }
        }

        Ok(levels)
    }
}
