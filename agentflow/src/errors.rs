//! Error types for the agentflow engine.
//!
//! The taxonomy separates "the workflow is broken" (precondition failures)
//! from "the system is out of capacity" (resource failures), and keeps
//! resurrection and compensation failures as their own kinds so callers can
//! render actionable UI for them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The graph failed validation before execution started.
    #[error("{0}")]
    Validation(#[from] GraphValidationError),

    /// The graph contains a dependency cycle.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// A node's agent invocation failed.
    #[error("Node '{node_id}' failed: {message}")]
    NodeExecution {
        /// The failing node.
        node_id: String,
        /// The failure message.
        message: String,
        /// Whether another attempt may succeed.
        retryable: bool,
    },

    /// A node exceeded its execution timeout.
    #[error("Node '{node_id}' timed out after {timeout_ms}ms")]
    Timeout {
        /// The node that timed out.
        node_id: String,
        /// The timeout that was exceeded.
        timeout_ms: u64,
    },

    /// The system is out of some capacity.
    #[error("{0}")]
    Resource(#[from] ResourceError),

    /// A stream could not be resurrected.
    #[error("{0}")]
    Resurrection(#[from] ResurrectionError),

    /// A ledger or compensation operation failed.
    #[error("{0}")]
    Compensation(#[from] CompensationError),

    /// The engine configuration is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A key or record was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The backing store reported an error.
    #[error("Store error: {0}")]
    Store(String),

    /// The run was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The workflow itself is invalid; nothing was executed.
    Precondition,
    /// A node failed while executing.
    NodeExecution,
    /// The system ran out of capacity.
    Resource,
    /// A checkpointed stream could not be brought back.
    Resurrection,
    /// Rolling back side effects failed or needs a human.
    Compensation,
    /// The run was cancelled.
    Cancelled,
    /// Storage, serialization or IO failure.
    Internal,
}

impl ErrorKind {
    /// Stable snake_case name, as serialized.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Precondition => "precondition",
            Self::NodeExecution => "node_execution",
            Self::Resource => "resource",
            Self::Resurrection => "resurrection",
            Self::Compensation => "compensation",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl EngineError {
    /// Creates a node execution error.
    #[must_use]
    pub fn node(node_id: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self::NodeExecution {
            node_id: node_id.into(),
            message: message.into(),
            retryable,
        }
    }

    /// Returns the coarse kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::CycleDetected(_) | Self::Config(_) => ErrorKind::Precondition,
            Self::NodeExecution { .. } | Self::Timeout { .. } => ErrorKind::NodeExecution,
            Self::Resource(_) => ErrorKind::Resource,
            Self::Resurrection(_) => ErrorKind::Resurrection,
            Self::Compensation(_) => ErrorKind::Compensation,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::NotFound(_) | Self::Store(_) | Self::Serialization(_) | Self::Io(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Returns true if retrying the failed operation may succeed.
    ///
    /// Resource failures are retryable after backpressure relief.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NodeExecution { retryable, .. } => *retryable,
            Self::Timeout { .. } | Self::Resource(_) => true,
            _ => false,
        }
    }

    /// Returns true for failures that are reported before any node runs.
    #[must_use]
    pub fn is_precondition(&self) -> bool {
        self.kind() == ErrorKind::Precondition
    }

    /// Converts to a dictionary representation for UI rendering.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), serde_json::json!(self.kind()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map.insert("retryable".to_string(), serde_json::json!(self.is_retryable()));

        match self {
            Self::Validation(err) => {
                map.insert("nodes".to_string(), serde_json::json!(err.nodes));
                if let Some(ref info) = err.error_info {
                    map.insert("code".to_string(), serde_json::json!(info.code));
                }
            }
            Self::CycleDetected(err) => {
                map.insert("cycle".to_string(), serde_json::json!(err.cycle_path));
                map.insert("code".to_string(), serde_json::json!(err.error_info.code));
            }
            Self::NodeExecution { node_id, .. } | Self::Timeout { node_id, .. } => {
                map.insert("node_id".to_string(), serde_json::json!(node_id));
            }
            _ => {}
        }

        map
    }
}

/// Metadata about a validation error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Error code (e.g., "GRAPH-001-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Stable error codes for graph validation failures.
pub mod codes {
    /// The graph contains a cycle.
    pub const CYCLE: &str = "GRAPH-001-CYCLE";
    /// An edge references a node that does not exist.
    pub const UNKNOWN_NODE: &str = "GRAPH-002-UNKNOWN_NODE";
    /// An edge references an undeclared slot.
    pub const UNKNOWN_SLOT: &str = "GRAPH-003-UNKNOWN_SLOT";
    /// A required input slot has no wiring and no run input.
    pub const MISSING_INPUT: &str = "GRAPH-004-MISSING_INPUT";
    /// Two nodes share an id.
    pub const DUPLICATE_NODE: &str = "GRAPH-005-DUPLICATE_NODE";
}

/// Error raised when graph validation fails.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct GraphValidationError {
    /// The error message.
    pub message: String,
    /// The nodes involved in the error.
    pub nodes: Vec<String>,
    /// Optional diagnostic info.
    pub error_info: Option<ErrorInfo>,
}

impl GraphValidationError {
    /// Creates a new graph validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            nodes: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the nodes involved.
    #[must_use]
    pub fn with_nodes(mut self, nodes: Vec<String>) -> Self {
        self.nodes = nodes;
        self
    }

    /// Sets the diagnostic info.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// An edge points at a node that is not in the graph.
    #[must_use]
    pub fn unknown_node(edge: &str, node_id: &str) -> Self {
        Self::new(format!("Edge {edge} references unknown node '{node_id}'"))
            .with_nodes(vec![node_id.to_string()])
            .with_error_info(
                ErrorInfo::new(codes::UNKNOWN_NODE, "Edge references a missing node")
                    .with_context_entry("edge", edge),
            )
    }

    /// An edge uses a slot the node does not declare.
    #[must_use]
    pub fn unknown_slot(node_id: &str, slot: &str, direction: &str) -> Self {
        Self::new(format!(
            "Node '{node_id}' declares no {direction} slot named '{slot}'"
        ))
        .with_nodes(vec![node_id.to_string()])
        .with_error_info(
            ErrorInfo::new(codes::UNKNOWN_SLOT, "Edge references an undeclared slot")
                .with_context_entry("slot", slot)
                .with_context_entry("direction", direction),
        )
    }

    /// A required input has no incoming edge and no run input.
    #[must_use]
    pub fn missing_input(node_id: &str, slot: &str) -> Self {
        Self::new(format!(
            "Required input '{slot}' of node '{node_id}' is not wired and has no run input"
        ))
        .with_nodes(vec![node_id.to_string()])
        .with_error_info(
            ErrorInfo::new(codes::MISSING_INPUT, "Required input is not wired")
                .with_fix_hint("Connect an edge to the slot or supply it as a run input.")
                .with_context_entry("slot", slot),
        )
    }

    /// Two nodes share the same id.
    #[must_use]
    pub fn duplicate_node(node_id: &str) -> Self {
        Self::new(format!("Duplicate node id '{node_id}'"))
            .with_nodes(vec![node_id.to_string()])
            .with_error_info(ErrorInfo::new(codes::DUPLICATE_NODE, "Node ids must be unique"))
    }
}

/// Error raised when a cycle is detected in the graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in graph: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of nodes forming the cycle.
    pub cycle_path: Vec<String>,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ErrorInfo::new(
            codes::CYCLE,
            format!("Graph contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the edges in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for GraphValidationError {
    fn from(err: CycleDetectedError) -> Self {
        GraphValidationError {
            message: err.to_string(),
            nodes: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}

/// Capacity failures, distinct from workflow failures.
#[derive(Debug, Clone, Error)]
pub enum ResourceError {
    /// The artifact store cannot make room for a value.
    #[error("Artifact store full: cannot store '{key}' ({requested} bytes, capacity {capacity})")]
    StoreFull {
        /// The key being written.
        key: String,
        /// Bytes requested.
        requested: u64,
        /// Store capacity in bytes.
        capacity: u64,
    },

    /// No stream slot is free.
    #[error("Stream slots exhausted ({limit} active streams)")]
    StreamSlotsExhausted {
        /// The configured limit.
        limit: usize,
    },

    /// The execution pool was closed while a node waited for a slot.
    #[error("Execution pool closed")]
    PoolClosed,
}

/// Failures bringing a checkpointed stream back.
#[derive(Debug, Clone, Error)]
pub enum ResurrectionError {
    /// No checkpoint exists for the stream.
    #[error("No checkpoint for stream {stream_id}")]
    NoCheckpoint {
        /// The stream id.
        stream_id: Uuid,
    },

    /// The producing node no longer exists.
    #[error("Producing node '{node_id}' of stream {stream_id} no longer exists")]
    NodeRemoved {
        /// The stream id.
        stream_id: Uuid,
        /// The missing node.
        node_id: String,
    },

    /// The checkpoint outlived its time-to-live.
    #[error("Checkpoint for stream {stream_id} has expired")]
    Expired {
        /// The stream id.
        stream_id: Uuid,
    },

    /// Regeneration is required but no agent invoker is configured.
    #[error("Stream {stream_id} needs regeneration but no agent invoker is available")]
    RegenerationUnavailable {
        /// The stream id.
        stream_id: Uuid,
    },

    /// Regeneration ran and failed, with nothing cached to fall back on.
    #[error("Regeneration of stream {stream_id} failed: {reason}")]
    RegenerationFailed {
        /// The stream id.
        stream_id: Uuid,
        /// Why regeneration failed.
        reason: String,
    },

    /// Staleness cannot be validated without a state provider.
    #[error("No workflow state provider configured; cannot validate stream {stream_id}")]
    NoStateProvider {
        /// The stream id.
        stream_id: Uuid,
    },

    /// The consumer index is outside the registered consumer count.
    #[error("Consumer index {index} out of range for stream {stream_id} ({count} consumers)")]
    ConsumerOutOfRange {
        /// The stream id.
        stream_id: Uuid,
        /// Requested index.
        index: usize,
        /// Registered consumers.
        count: usize,
    },
}

/// Failures in the side-effect ledger.
#[derive(Debug, Clone, Error)]
pub enum CompensationError {
    /// The effect id is not in the ledger.
    #[error("Unknown side effect {0}")]
    UnknownEffect(Uuid),

    /// The requested status transition is not allowed.
    #[error("Invalid transition for effect {id}: {from} -> {to}")]
    InvalidTransition {
        /// The effect id.
        id: Uuid,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// Writing the ledger journal failed.
    #[error("Ledger journal error: {0}")]
    Journal(String),
}

/// Invalid engine configuration.
#[derive(Debug, Clone, Error)]
#[error("Invalid configuration for '{field}': {reason}")]
pub struct ConfigError {
    /// The offending field.
    pub field: String,
    /// What is wrong with it.
    pub reason: String,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
