//! Stream checkpoint records.

use crate::core::ArtifactReference;
use crate::graph::Node;
use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// How much of a stream a checkpoint keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterializationMode {
    /// Every chunk.
    Full,
    /// A bounded prefix window.
    Partial,
    /// Nothing; the stream is regenerated on resurrection.
    Regenerate,
}

/// Lifecycle of a checkpoint record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// The stream is live.
    Active,
    /// Captured to durable storage.
    Checkpointed,
    /// Brought back after interruption.
    Resurrected,
    /// Validation found the checkpoint's assumptions no longer hold.
    Stale,
    /// Outlived its time-to-live.
    Expired,
}

/// Durable record of a checkpointed stream.
///
/// `config_version` and `inputs_version` are content hashes taken when the
/// stream was registered; resurrection compares them against the current
/// workflow state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamCheckpoint {
    /// Stream id.
    pub stream_id: Uuid,
    /// Run that produced the stream.
    pub run_id: Uuid,
    /// Producing node id.
    pub source_node: String,
    /// Number of consumers at registration.
    pub consumer_count: usize,
    /// When the stream was registered.
    pub created_at: Timestamp,
    /// Last checkpoint, resurrection or read.
    pub last_touch: Timestamp,
    /// Hash of the producing node's configuration.
    pub config_version: String,
    /// Hash of the resolved inputs.
    pub inputs_version: String,
    /// Materialization mode.
    pub mode: MaterializationMode,
    /// Current status.
    pub status: CheckpointStatus,
    /// Captured chunks, absent for `regenerate`.
    #[serde(default)]
    pub chunks: Option<ArtifactReference>,
    /// Number of chunks stored under `chunks`.
    #[serde(default)]
    pub captured_chunks: u64,
    /// The stored chunks are the whole stream.
    #[serde(default)]
    pub complete: bool,
    /// Node declaration at registration, used for regeneration.
    pub node_snapshot: Node,
    /// Resolved value inputs at registration, used for regeneration.
    #[serde(default)]
    pub input_snapshot: HashMap<String, Value>,
    /// Set once the stored chunks were produced by regeneration rather than
    /// captured from the original producer.
    #[serde(default)]
    pub regenerated_at: Option<Timestamp>,
}

impl StreamCheckpoint {
    /// Updates the last-touch timestamp.
    pub fn touch(&mut self) {
        self.last_touch = now_utc();
    }

    /// Whether a resurrection can replay stored chunks as the whole stream.
    #[must_use]
    pub fn has_complete_cache(&self) -> bool {
        self.chunks.is_some() && self.complete
    }

    /// Whether any chunks are stored.
    #[must_use]
    pub fn has_cache(&self) -> bool {
        self.chunks.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_serde() {
        assert_eq!(
            serde_json::to_string(&MaterializationMode::Regenerate).unwrap(),
            r#""regenerate""#
        );
        let status: CheckpointStatus = serde_json::from_str(r#""checkpointed""#).unwrap();
        assert_eq!(status, CheckpointStatus::Checkpointed);
    }

    #[test]
    fn test_cache_flags() {
        let mut record = StreamCheckpoint {
            stream_id: Uuid::nil(),
            run_id: Uuid::nil(),
            source_node: "n".into(),
            consumer_count: 1,
            created_at: now_utc(),
            last_touch: now_utc(),
            config_version: String::new(),
            inputs_version: String::new(),
            mode: MaterializationMode::Partial,
            status: CheckpointStatus::Active,
            chunks: Some(ArtifactReference::new("k")),
            captured_chunks: 2,
            complete: false,
            node_snapshot: Node::new("n", "llm"),
            input_snapshot: HashMap::new(),
            regenerated_at: None,
        };
        assert!(record.has_cache());
        assert!(!record.has_complete_cache());
        record.complete = true;
        assert!(record.has_complete_cache());
    }
}
