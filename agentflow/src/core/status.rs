//! Node execution status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The execution status of a node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Not yet scheduled.
    #[default]
    Pending,
    /// Occupying an execution slot.
    Running,
    /// Completed successfully.
    Success,
    /// Failed terminally.
    Error,
    /// Not run because an upstream node failed.
    Skipped,
    /// Interrupted by run cancellation.
    Cancelled,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl NodeStatus {
    /// Returns true if the status is terminal for the level barrier.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Error | Self::Skipped | Self::Cancelled
        )
    }

    /// Returns true if the node produced an output.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

}
