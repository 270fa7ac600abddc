//! Per-run execution state.

use crate::core::{ArtifactReference, NodeStatus};
use crate::errors::ErrorKind;
use crate::graph::ExecutionGraph;
use crate::streaming::StreamingStrategy;
use crate::utils::{millis_between, now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Where a node's output lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeOutput {
    /// Small output kept in the state itself.
    Inline {
        /// The value.
        value: Value,
    },
    /// Output stored in the artifact store.
    Artifact {
        /// Where to find it.
        reference: ArtifactReference,
    },
    /// Output handed to consumers as a stream.
    Stream {
        /// The stream handle id.
        stream_id: Uuid,
    },
}

impl NodeOutput {
    /// The inline value, if the output is inline.
    #[must_use]
    pub fn inline_value(&self) -> Option<&Value> {
        match self {
            Self::Inline { value } => Some(value),
            _ => None,
        }
    }

    /// The stream id, if the output is a stream.
    #[must_use]
    pub fn stream_id(&self) -> Option<Uuid> {
        match self {
            Self::Stream { stream_id } => Some(*stream_id),
            _ => None,
        }
    }
}

/// State of one node within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionState {
    /// Node id.
    pub node_id: String,
    /// Current status.
    pub status: NodeStatus,
    /// Level the node was scheduled in.
    #[serde(default)]
    pub level: Option<usize>,
    /// When the first attempt started.
    #[serde(default)]
    pub started_at: Option<Timestamp>,
    /// When the node became terminal.
    #[serde(default)]
    pub finished_at: Option<Timestamp>,
    /// Resolved inputs, by slot. Streamed inputs appear as `{"$stream": id}`.
    #[serde(default)]
    pub input_snapshot: HashMap<String, Value>,
    /// The output or a reference to it.
    #[serde(default)]
    pub output: Option<NodeOutput>,
    /// Terminal error message.
    #[serde(default)]
    pub error: Option<String>,
    /// Kind of the terminal error.
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    /// Attempts after the first.
    #[serde(default)]
    pub retry_count: u32,
    /// Delivery strategy chosen for the output.
    #[serde(default)]
    pub strategy: Option<StreamingStrategy>,
}

impl NodeExecutionState {
    /// A pending node.
    #[must_use]
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Pending,
            level: None,
            started_at: None,
            finished_at: None,
            input_snapshot: HashMap::new(),
            output: None,
            error: None,
            error_kind: None,
            retry_count: 0,
            strategy: None,
        }
    }

    /// Marks the node running.
    pub fn start(&mut self, level: usize) {
        self.status = NodeStatus::Running;
        self.level = Some(level);
        self.started_at = Some(now_utc());
    }

    /// Marks the node successful.
    pub fn succeed(&mut self, output: NodeOutput) {
        self.finish(NodeStatus::Success);
        self.output = Some(output);
        self.error = None;
        self.error_kind = None;
    }

    /// Marks the node failed.
    pub fn fail(&mut self, error: impl Into<String>, kind: ErrorKind) {
        self.finish(NodeStatus::Error);
        self.error = Some(error.into());
        self.error_kind = Some(kind);
    }

    /// Marks the node skipped.
    pub fn skip(&mut self, reason: impl Into<String>) {
        self.finish(NodeStatus::Skipped);
        self.error = Some(reason.into());
    }

    /// Marks the node cancelled.
    pub fn cancel(&mut self, reason: impl Into<String>) {
        self.finish(NodeStatus::Cancelled);
        self.error = Some(reason.into());
        self.error_kind = Some(ErrorKind::Cancelled);
    }

    /// Puts the node back to pending, keeping nothing from earlier attempts.
    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.node_id));
    }

    fn finish(&mut self, status: NodeStatus) {
        self.status = status;
        self.finished_at = Some(now_utc());
    }

    /// Wall time between start and finish.
    #[must_use]
    pub fn duration_ms(&self) -> Option<u64> {
        match (&self.started_at, &self.finished_at) {
            (Some(start), Some(end)) => Some(millis_between(start, end)),
            _ => None,
        }
    }
}

/// Resolved variable bindings, keyed by node id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(default)]
    bindings: HashMap<String, Value>,
}

impl ExecutionContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the resolved output of `node_id`.
    pub fn bind(&mut self, node_id: impl Into<String>, value: Value) {
        self.bindings.insert(node_id.into(), value);
    }

    /// The binding for `node_id`.
    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<&Value> {
        self.bindings.get(node_id)
    }

    /// Removes the binding for `node_id`.
    pub fn unbind(&mut self, node_id: &str) -> Option<Value> {
        self.bindings.remove(node_id)
    }

    /// All bindings.
    #[must_use]
    pub fn bindings(&self) -> &HashMap<String, Value> {
        &self.bindings
    }
}

/// State of one run. Mutated only by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    /// Run id.
    pub run_id: Uuid,
    nodes: HashMap<String, NodeExecutionState>,
    /// Run-scoped bindings.
    #[serde(default)]
    pub context: ExecutionContext,
    /// Levels whose barrier has passed.
    #[serde(default)]
    pub completed_levels: usize,
}

impl ExecutionState {
    /// A state with every node of `graph` pending.
    #[must_use]
    pub fn new(run_id: Uuid, graph: &ExecutionGraph) -> Self {
        let nodes = graph
            .nodes()
            .iter()
            .map(|node| (node.id.clone(), NodeExecutionState::new(node.id.clone())))
            .collect();
        Self {
            run_id,
            nodes,
            context: ExecutionContext::new(),
            completed_levels: 0,
        }
    }

    /// State of one node.
    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<&NodeExecutionState> {
        self.nodes.get(node_id)
    }

    /// Mutable state of one node, created pending if absent.
    pub fn node_mut(&mut self, node_id: &str) -> &mut NodeExecutionState {
        self.nodes
            .entry(node_id.to_string())
            .or_insert_with(|| NodeExecutionState::new(node_id))
    }

    /// Status of one node.
    #[must_use]
    pub fn status(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes.get(node_id).map(|n| n.status)
    }

    /// All node states.
    #[must_use]
    pub fn nodes(&self) -> &HashMap<String, NodeExecutionState> {
        &self.nodes
    }

    /// Ids of nodes with `status`, sorted.
    #[must_use]
    pub fn nodes_with_status(&self, status: NodeStatus) -> Vec<String> {
        let mut ids: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.status == status)
            .map(|n| n.node_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Returns true if every node is terminal.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.nodes.values().all(|n| n.status.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, Node};
    use serde_json::json;

    fn graph() -> ExecutionGraph {
        ExecutionGraph::new(
            vec![Node::new("a", "fetch"), Node::new("b", "summarize")],
            vec![Edge::new("a", "out", "b", "in")],
        )
    }

    #[test]
    fn test_new_state_is_pending() {
        let state = ExecutionState::new(Uuid::nil(), &graph());
        assert_eq!(state.nodes().len(), 2);
        assert_eq!(state.status("a"), Some(NodeStatus::Pending));
        assert!(!state.is_settled());
    }

    #[test]
    fn test_node_lifecycle() {
        let mut node = NodeExecutionState::new("a");
        node.start(0);
        assert_eq!(node.status, NodeStatus::Running);
        node.succeed(NodeOutput::Inline { value: json!(1) });
        assert_eq!(node.status, NodeStatus::Success);
        assert!(node.duration_ms().is_some());
        assert_eq!(node.output.as_ref().and_then(NodeOutput::inline_value), Some(&json!(1)));

        node.reset();
        assert_eq!(node, NodeExecutionState::new("a"));
    }

    #[test]
    fn test_state_serde() {
        let mut state = ExecutionState::new(Uuid::nil(), &graph());
        state.node_mut("a").fail("boom", ErrorKind::NodeExecution);
        state.node_mut("b").skip("upstream failed");
        state.context.bind("a", json!({"x": 1}));

        let json = serde_json::to_value(&state).unwrap();
        let back: ExecutionState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
        assert!(back.is_settled());
        assert_eq!(back.nodes_with_status(NodeStatus::Skipped), vec!["b".to_string()]);
    }
}
