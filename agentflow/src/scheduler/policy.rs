//! Run-level failure policies and failure bookkeeping.
//!
//! `Stop` aborts remaining levels after the first terminal node failure.
//! `Continue` marks every transitive dependent of a failed node as skipped and
//! keeps executing independent branches. `Retry` retries failing nodes with
//! bounded backoff and then falls back to `Stop` or `Continue`.

use super::retry::RetryConfig;
use crate::utils::timestamps::iso_timestamp;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// What the run does once retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AfterRetry {
    /// Abort remaining levels.
    #[default]
    Stop,
    /// Skip dependents, keep independent branches.
    Continue,
}

/// How the scheduler reacts to a node failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort remaining levels on the first failure.
    Stop,
    /// Record the failure, skip dependents, continue elsewhere.
    Continue,
    /// Retry with backoff, then stop or continue.
    Retry {
        /// Retry configuration for every node in the run.
        retry: RetryConfig,
        /// Behavior once retries are exhausted.
        #[serde(default)]
        then: AfterRetry,
    },
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::Stop
    }
}

impl FailurePolicy {
    /// Retry policy falling back to `then`.
    #[must_use]
    pub fn retry(retry: RetryConfig, then: AfterRetry) -> Self {
        Self::Retry { retry, then }
    }

    /// Whether a terminal failure aborts the run.
    #[must_use]
    pub fn aborts_on_failure(&self) -> bool {
        match self {
            Self::Stop => true,
            Self::Continue => false,
            Self::Retry { then, .. } => *then == AfterRetry::Stop,
        }
    }

    /// The run-level retry configuration, if any.
    #[must_use]
    pub fn run_retry(&self) -> Option<&RetryConfig> {
        match self {
            Self::Retry { retry, .. } => Some(retry),
            _ => None,
        }
    }
}

/// Record of a node failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Node id.
    pub node_id: String,
    /// Error message.
    pub error: String,
    /// Error kind, as reported by [`crate::errors::ErrorKind`].
    pub kind: String,
    /// Attempts made before giving up.
    pub attempts: u32,
    /// When the failure became terminal.
    pub timestamp: String,
}

impl FailureRecord {
    /// Creates a new failure record.
    #[must_use]
    pub fn new(node_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            error: error.into(),
            kind: "node_execution".to_string(),
            attempts: 1,
            timestamp: iso_timestamp(),
        }
    }

    /// Sets the error kind.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Sets the attempt count.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// Summary of failures in a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureSummary {
    /// Total number of nodes.
    pub total_nodes: usize,
    /// Nodes that completed successfully.
    pub completed_nodes: usize,
    /// Nodes that failed.
    pub failed_nodes: usize,
    /// Nodes skipped because an upstream node failed.
    pub skipped_nodes: Vec<String>,
    /// Failure records in the order they became terminal.
    pub failures: Vec<FailureRecord>,
}

impl FailureSummary {
    /// Returns the success rate.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_nodes == 0 {
            return 0.0;
        }
        self.completed_nodes as f64 / self.total_nodes as f64
    }

    /// Converts to dictionary.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("total_nodes".to_string(), serde_json::json!(self.total_nodes));
        map.insert("completed_nodes".to_string(), serde_json::json!(self.completed_nodes));
        map.insert("failed_nodes".to_string(), serde_json::json!(self.failed_nodes));
        map.insert("skipped_nodes".to_string(), serde_json::json!(self.skipped_nodes));
        map.insert("success_rate".to_string(), serde_json::json!(self.success_rate()));
        map.insert("failures".to_string(), serde_json::json!(self.failures));
        map
    }
}

/// Collects failures during a run and answers "may this node run?".
#[derive(Debug)]
pub struct FailureCollector {
    aborts: bool,
    failures: Vec<FailureRecord>,
    failed: HashSet<String>,
    skipped: Vec<String>,
    blocked: HashSet<String>,
    completed: HashSet<String>,
}

impl FailureCollector {
    /// Creates a collector for the given policy.
    #[must_use]
    pub fn new(policy: &FailurePolicy) -> Self {
        Self {
            aborts: policy.aborts_on_failure(),
            failures: Vec::new(),
            failed: HashSet::new(),
            skipped: Vec::new(),
            blocked: HashSet::new(),
            completed: HashSet::new(),
        }
    }

    /// Records a terminal node failure.
    pub fn record_failure(&mut self, record: FailureRecord) {
        self.failed.insert(record.node_id.clone());
        self.blocked.insert(record.node_id.clone());
        self.failures.push(record);
    }

    /// Records a successful node.
    pub fn record_completion(&mut self, node_id: &str) {
        self.completed.insert(node_id.to_string());
    }

    /// Records a skipped node. Its own dependents become blocked too.
    pub fn record_skip(&mut self, node_id: &str) {
        self.blocked.insert(node_id.to_string());
        self.skipped.push(node_id.to_string());
    }

    /// Returns true if the run must abort.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.aborts && !self.failures.is_empty()
    }

    /// Returns true if none of the node's predecessors failed or were skipped.
    #[must_use]
    pub fn can_run(&self, predecessors: &[&str]) -> bool {
        !predecessors.iter().any(|p| self.blocked.contains(*p))
    }

    /// Creates a summary of the run.
    #[must_use]
    pub fn summary(&self, total_nodes: usize) -> FailureSummary {
        FailureSummary {
            total_nodes,
            completed_nodes: self.completed.len(),
            failed_nodes: self.failed.len(),
            skipped_nodes: self.skipped.clone(),
            failures: self.failures.clone(),
        }
    }

    /// Returns all failures.
    #[must_use]
    pub fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }
}
