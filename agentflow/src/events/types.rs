//! Engine event payloads and type names.

use crate::utils::{iso_timestamp, sha256_hex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event type names emitted by the engine.
pub mod names {
    /// A run passed validation and started.
    pub const RUN_STARTED: &str = "run.started";
    /// A run finished (any status).
    pub const RUN_COMPLETED: &str = "run.completed";
    /// A run was cancelled.
    pub const RUN_CANCELLED: &str = "run.cancelled";
    /// A level was dispatched.
    pub const LEVEL_STARTED: &str = "level.started";
    /// Every member of a level reached a terminal status.
    pub const LEVEL_COMPLETED: &str = "level.completed";
    /// A node occupied an execution slot.
    pub const NODE_STARTED: &str = "node.started";
    /// A node succeeded.
    pub const NODE_COMPLETED: &str = "node.completed";
    /// A node failed terminally.
    pub const NODE_FAILED: &str = "node.failed";
    /// A node attempt failed and will be retried.
    pub const NODE_RETRYING: &str = "node.retrying";
    /// A node was skipped.
    pub const NODE_SKIPPED: &str = "node.skipped";
    /// A node was cancelled.
    pub const NODE_CANCELLED: &str = "node.cancelled";
    /// A strategy was selected for a node.
    pub const STRATEGY_SELECTED: &str = "streaming.strategy_selected";
    /// A stream was registered.
    pub const STREAM_REGISTERED: &str = "stream.registered";
    /// A stream was captured to durable storage.
    pub const STREAM_CHECKPOINTED: &str = "stream.checkpointed";
    /// A stream was brought back.
    pub const STREAM_RESURRECTED: &str = "stream.resurrected";
    /// A resurrected stream is not fresh.
    pub const STREAM_DEGRADED: &str = "stream.degraded";
    /// A checkpoint outlived its TTL.
    pub const STREAM_EXPIRED: &str = "stream.expired";
    /// A side effect was recorded.
    pub const EFFECT_RECORDED: &str = "ledger.effect_recorded";
    /// A side effect was compensated.
    pub const EFFECT_COMPENSATED: &str = "ledger.effect_compensated";
    /// Compensation failed or needs a human.
    pub const COMPENSATION_FAILED: &str = "ledger.compensation_failed";
    /// An execution snapshot was written.
    pub const SNAPSHOT_CREATED: &str = "checkpoint.snapshot_created";
    /// A snapshot was restored.
    pub const SNAPSHOT_RESTORED: &str = "checkpoint.restored";
    /// One wide summary event per finished run.
    pub const RUN_WIDE: &str = "run.wide";
}

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    /// Routine status.
    #[default]
    Info,
    /// Degraded but proceeding.
    Warning,
    /// Failure.
    Error,
}

/// A fire-and-forget status, warning or error event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    /// Event type, one of [`names`].
    pub event_type: String,
    /// Severity.
    #[serde(default)]
    pub severity: EventSeverity,
    /// Run the event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    /// Node the event concerns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Stream the event concerns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<Uuid>,
    /// Event-specific payload.
    #[serde(default)]
    pub data: Value,
    /// When the event was created.
    pub timestamp: String,
}

impl EngineEvent {
    /// Creates an info event.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            severity: EventSeverity::Info,
            run_id: None,
            node_id: None,
            stream_id: None,
            data: Value::Null,
            timestamp: iso_timestamp(),
        }
    }

    /// Creates a warning event.
    #[must_use]
    pub fn warning(event_type: impl Into<String>) -> Self {
        Self::new(event_type).with_severity(EventSeverity::Warning)
    }

    /// Creates an error event.
    #[must_use]
    pub fn error(event_type: impl Into<String>) -> Self {
        Self::new(event_type).with_severity(EventSeverity::Error)
    }

    /// Sets the severity.
    #[must_use]
    pub fn with_severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Sets the run id.
    #[must_use]
    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Sets the node id.
    #[must_use]
    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Sets the stream id.
    #[must_use]
    pub fn with_stream(mut self, stream_id: Uuid) -> Self {
        self.stream_id = Some(stream_id);
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Stable fingerprint of type and subject, for de-duplication in UIs.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        sha256_hex(
            format!(
                "{}|{:?}|{:?}|{:?}",
                self.event_type, self.run_id, self.node_id, self.stream_id
            )
            .as_bytes(),
        )
    }
}
