//! Staleness classification for checkpointed streams.

use super::checkpoint::StreamCheckpoint;
use crate::graph::Node;
use crate::utils::content_hash;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// How far a checkpoint's assumptions have drifted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessSeverity {
    /// Config and inputs are unchanged.
    Fresh,
    /// Non-critical config drift; proceed with a warning.
    Minor,
    /// A critical field or an input changed; regenerate.
    Major,
    /// The producing node no longer exists.
    Critical,
}

/// Result of validating a checkpoint against current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StalenessReport {
    /// Overall severity.
    pub severity: StalenessSeverity,
    /// Critical config paths whose value changed.
    pub changed_fields: Vec<String>,
    /// Whether the resolved inputs changed.
    pub inputs_changed: bool,
}

impl StalenessReport {
    /// Human-readable summary for warning events.
    #[must_use]
    pub fn describe(&self) -> String {
        match self.severity {
            StalenessSeverity::Fresh => "checkpoint is fresh".to_string(),
            StalenessSeverity::Critical => "producing node was removed".to_string(),
            StalenessSeverity::Minor => "node configuration changed in non-critical fields".to_string(),
            StalenessSeverity::Major => {
                let mut parts = Vec::new();
                if !self.changed_fields.is_empty() {
                    parts.push(format!("critical fields changed: {}", self.changed_fields.join(", ")));
                }
                if self.inputs_changed {
                    parts.push("inputs changed".to_string());
                }
                parts.join("; ")
            }
        }
    }
}

/// Hash of a node's resolved inputs.
///
/// # Errors
///
/// Returns an error if the inputs cannot be serialized.
pub fn inputs_version(inputs: &HashMap<String, Value>) -> Result<String, serde_json::Error> {
    content_hash(inputs)
}

/// Compares checkpoints against the current node declaration and inputs.
#[derive(Debug, Clone)]
pub struct StalenessValidator {
    critical_fields: Vec<String>,
}

impl StalenessValidator {
    /// Creates a validator treating `critical_fields` (dotted config paths)
    /// as critical.
    #[must_use]
    pub fn new(critical_fields: Vec<String>) -> Self {
        Self { critical_fields }
    }

    /// Classifies a checkpoint. `current` is `None` when the node is gone.
    ///
    /// # Errors
    ///
    /// Returns an error if hashing fails.
    pub fn classify(
        &self,
        checkpoint: &StreamCheckpoint,
        current: Option<(&Node, &HashMap<String, Value>)>,
    ) -> Result<StalenessReport, serde_json::Error> {
        let Some((node, inputs)) = current else {
            return Ok(StalenessReport {
                severity: StalenessSeverity::Critical,
                changed_fields: Vec::new(),
                inputs_changed: false,
            });
        };

        let config_changed = node.config_version()? != checkpoint.config_version;
        let inputs_changed = inputs_version(inputs)? != checkpoint.inputs_version;

        let changed_fields = if config_changed {
            self.changed_critical_fields(&checkpoint.node_snapshot, node)?
        } else {
            Vec::new()
        };

        let severity = if !changed_fields.is_empty() || inputs_changed {
            StalenessSeverity::Major
        } else if config_changed {
            StalenessSeverity::Minor
        } else {
            StalenessSeverity::Fresh
        };

        Ok(StalenessReport {
            severity,
            changed_fields,
            inputs_changed,
        })
    }

    fn changed_critical_fields(
        &self,
        before: &Node,
        after: &Node,
    ) -> Result<Vec<String>, serde_json::Error> {
        let before = serde_json::to_value(&before.config)?;
        let after = serde_json::to_value(&after.config)?;

        Ok(self
            .critical_fields
            .iter()
            .filter(|path| lookup(&before, path) != lookup(&after, path))
            .cloned()
            .collect())
    }
}

fn lookup<'a>(value: &'a Value, dotted: &str) -> Option<&'a Value> {
    dotted
        .split('.')
        .try_fold(value, |current, segment| current.get(segment))
}
