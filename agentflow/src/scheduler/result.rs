//! Run outcome.

use super::policy::FailureSummary;
use super::state::{ExecutionState, NodeExecutionState, NodeOutput};
use crate::core::NodeStatus;
use crate::ledger::CompensationReport;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every node succeeded.
    Completed,
    /// The run finished but some nodes failed or were skipped.
    CompletedWithErrors,
    /// A failure aborted the remaining levels.
    Failed,
    /// The run was cancelled.
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::CompletedWithErrors => write!(f, "completed_with_errors"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Summary of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Run id.
    pub run_id: Uuid,
    /// Overall status.
    pub status: RunStatus,
    /// Final per-node state and bindings.
    pub state: ExecutionState,
    /// Topological levels the run was scheduled in.
    pub levels: Vec<Vec<String>>,
    /// Failures, skips and completion counts.
    pub failures: FailureSummary,
    /// Rollback performed on cancellation.
    #[serde(default)]
    pub compensation: Option<CompensationReport>,
    /// Last execution snapshot written for the run.
    #[serde(default)]
    pub snapshot_id: Option<Uuid>,
    /// Wall time of the run.
    pub duration_ms: u64,
    /// Why the run did not complete.
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionResult {
    /// Returns true if every node succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// State of one node.
    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<&NodeExecutionState> {
        self.state.node(node_id)
    }

    /// Status of one node.
    #[must_use]
    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.state.status(node_id)
    }

    /// Output of one node.
    #[must_use]
    pub fn output(&self, node_id: &str) -> Option<&NodeOutput> {
        self.node(node_id).and_then(|n| n.output.as_ref())
    }

    /// Level index of one node.
    #[must_use]
    pub fn level_of(&self, node_id: &str) -> Option<usize> {
        self.levels
            .iter()
            .position(|level| level.iter().any(|id| id == node_id))
    }
}
