//! Access to the live workflow document, for staleness validation.

use crate::errors::EngineError;
use crate::graph::{ExecutionGraph, Node};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

/// Reads the current declaration and resolved inputs of a node.
///
/// Implemented by the editor layer; the engine only reads.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkflowStateProvider: Send + Sync {
    /// The node's current declaration, or `None` if it was removed.
    async fn get_node(&self, node_id: &str) -> Result<Option<Node>, EngineError>;

    /// The node's current resolved value inputs, keyed by slot.
    async fn get_node_inputs(&self, node_id: &str) -> Result<HashMap<String, Value>, EngineError>;
}

/// A provider over an in-memory snapshot of nodes and inputs.
#[derive(Debug, Default)]
pub struct StaticStateProvider {
    nodes: RwLock<HashMap<String, Node>>,
    inputs: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl StaticStateProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider holding every node of `graph` with the given inputs.
    #[must_use]
    pub fn from_graph(graph: &ExecutionGraph, inputs: HashMap<String, HashMap<String, Value>>) -> Self {
        let nodes = graph
            .nodes()
            .iter()
            .map(|node| (node.id.clone(), node.clone()))
            .collect();
        Self {
            nodes: RwLock::new(nodes),
            inputs: RwLock::new(inputs),
        }
    }

    /// Inserts or replaces a node.
    pub fn set_node(&self, node: Node) {
        self.nodes.write().insert(node.id.clone(), node);
    }

    /// Removes a node.
    pub fn remove_node(&self, node_id: &str) {
        self.nodes.write().remove(node_id);
        self.inputs.write().remove(node_id);
    }

    /// Replaces a node's resolved inputs.
    pub fn set_inputs(&self, node_id: impl Into<String>, inputs: HashMap<String, Value>) {
        self.inputs.write().insert(node_id.into(), inputs);
    }
}

#[async_trait]
impl WorkflowStateProvider for StaticStateProvider {
    async fn get_node(&self, node_id: &str) -> Result<Option<Node>, EngineError> {
        Ok(self.nodes.read().get(node_id).cloned())
    }

    async fn get_node_inputs(&self, node_id: &str) -> Result<HashMap<String, Value>, EngineError> {
        Ok(self.inputs.read().get(node_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticStateProvider::new();
        provider.set_node(Node::new("writer", "llm"));
        provider.set_inputs("writer", HashMap::from([("topic".to_string(), json!("rust"))]));

        assert!(provider.get_node("writer").await.unwrap().is_some());
        assert_eq!(provider.get_node_inputs("writer").await.unwrap()["topic"], "rust");

        provider.remove_node("writer");
        assert!(provider.get_node("writer").await.unwrap().is_none());
        assert!(provider.get_node_inputs("writer").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mock_provider() {
        let mut provider = MockWorkflowStateProvider::new();
        provider.expect_get_node().returning(|_| Ok(None));
        assert!(provider.get_node("gone").await.unwrap().is_none());
    }
}
