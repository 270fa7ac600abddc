//! Node declarations.

use crate::scheduler::retry::RetryConfig;
use crate::utils::content_hash;
use serde::{Deserialize, Serialize};

/// A declared input or output slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDecl {
    /// Slot name, unique per direction within a node.
    pub name: String,
    /// Type tag (`"string"`, `"object"`, `"any"`, ...).
    #[serde(default = "default_type_tag")]
    pub type_tag: String,
    /// Whether the slot must be wired or supplied as a run input.
    #[serde(default)]
    pub required: bool,
}

fn default_type_tag() -> String {
    "any".to_string()
}

impl SlotDecl {
    /// A required slot of any type.
    #[must_use]
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_tag: default_type_tag(),
            required: true,
        }
    }

    /// An optional slot of any type.
    #[must_use]
    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_tag: default_type_tag(),
            required: false,
        }
    }

    /// Sets the type tag.
    #[must_use]
    pub fn with_type(mut self, type_tag: impl Into<String>) -> Self {
        self.type_tag = type_tag.into();
        self
    }
}

/// Execution configuration of a node.
///
/// Only the timeout, retry and streaming hints are interpreted by the
/// engine. Everything else is opaque and forwarded to the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Agent type used for invocation and strategy hints.
    #[serde(default)]
    pub agent_type: String,
    /// Per-node timeout override in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Per-node retry override.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// Explicit streaming preference.
    #[serde(default)]
    pub streaming: Option<bool>,
    /// Estimated size of the node's output, used for fan-out decisions.
    #[serde(default)]
    pub estimated_output_bytes: Option<u64>,
    /// Opaque agent parameters.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl NodeConfig {
    /// Creates a config for the given agent type.
    #[must_use]
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            ..Self::default()
        }
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Sets the retry override.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Sets the streaming preference.
    #[must_use]
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = Some(streaming);
        self
    }

    /// Sets the estimated output size.
    #[must_use]
    pub fn with_estimated_output_bytes(mut self, bytes: u64) -> Self {
        self.estimated_output_bytes = Some(bytes);
        self
    }

    /// Adds an opaque parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// A node of the execution graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique id within the graph.
    pub id: String,
    /// Declared input slots.
    #[serde(default)]
    pub inputs: Vec<SlotDecl>,
    /// Declared output slots.
    #[serde(default)]
    pub outputs: Vec<SlotDecl>,
    /// Execution configuration.
    #[serde(default)]
    pub config: NodeConfig,
}

impl Node {
    /// Creates a node with a single optional `output` slot.
    #[must_use]
    pub fn new(id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inputs: Vec::new(),
            outputs: vec![SlotDecl::optional("output")],
            config: NodeConfig::new(agent_type),
        }
    }

    /// Adds an input slot.
    #[must_use]
    pub fn with_input(mut self, slot: SlotDecl) -> Self {
        self.inputs.push(slot);
        self
    }

    /// Replaces the output slots.
    #[must_use]
    pub fn with_outputs(mut self, slots: Vec<SlotDecl>) -> Self {
        self.outputs = slots;
        self
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Looks up an input slot.
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&SlotDecl> {
        self.inputs.iter().find(|s| s.name == name)
    }

    /// Looks up an output slot.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&SlotDecl> {
        self.outputs.iter().find(|s| s.name == name)
    }

    /// Content hash of the node's configuration and declared slots.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized.
    pub fn config_version(&self) -> Result<String, serde_json::Error> {
        content_hash(&serde_json::json!({
            "config": self.config,
            "inputs": self.inputs,
            "outputs": self.outputs,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_builder() {
        let node = Node::new("summarize", "llm")
            .with_input(SlotDecl::required("text").with_type("string"))
            .with_config(NodeConfig::new("llm").with_timeout_ms(500).with_streaming(true));

        assert_eq!(node.input("text").map(|s| s.required), Some(true));
        assert!(node.output("output").is_some());
        assert_eq!(node.config.timeout_ms, Some(500));
    }

    #[test]
    fn test_config_version_changes_with_params() {
        let a = Node::new("n", "llm");
        let b = Node::new("n", "llm")
            .with_config(NodeConfig::new("llm").with_param("prompt", json!("be brief")));

        assert_eq!(a.config_version().unwrap(), a.clone().config_version().unwrap());
        assert_ne!(a.config_version().unwrap(), b.config_version().unwrap());
    }

    #[test]
    fn test_node_deserialize_defaults() {
        let node: Node = serde_json::from_value(json!({
            "id": "fetch",
            "inputs": [{"name": "url", "required": true}],
            "config": {"agent_type": "http"}
        }))
        .unwrap();

        assert_eq!(node.inputs[0].type_tag, "any");
        assert!(node.outputs.is_empty());
        assert_eq!(node.config.agent_type, "http");
    }
}
