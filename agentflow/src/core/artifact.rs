//! Opaque handles into the artifact store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A reference to a value held in the artifact store.
///
/// Node outputs above the inline limit, materialized streams and captured
/// checkpoint chunks are all referenced this way.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactReference {
    /// The store key.
    pub key: String,
}

impl ArtifactReference {
    /// Creates a reference to `key`.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// Key for a node's batch output within a run.
    #[must_use]
    pub fn for_node_output(run_id: &uuid::Uuid, node_id: &str) -> Self {
        Self::new(format!("runs/{run_id}/nodes/{node_id}/output"))
    }

    /// Key for a materialized stream.
    #[must_use]
    pub fn for_materialized_stream(stream_id: &uuid::Uuid) -> Self {
        Self::new(format!("streams/{stream_id}/materialized"))
    }

    /// Key for chunks captured at checkpoint time.
    #[must_use]
    pub fn for_stream_checkpoint(stream_id: &uuid::Uuid) -> Self {
        Self::new(format!("streams/{stream_id}/checkpoint"))
    }
}

impl fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "artifact:{}", self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_keys_are_scoped() {
        let run = Uuid::nil();
        let reference = ArtifactReference::for_node_output(&run, "fetch");
        assert_eq!(
            reference.key,
            "runs/00000000-0000-0000-0000-000000000000/nodes/fetch/output"
        );
        assert_eq!(reference.to_string(), format!("artifact:{}", reference.key));
    }

    #[test]
    fn test_serialization() {
        let reference = ArtifactReference::new("k");
        let json = serde_json::to_string(&reference).unwrap();
        assert_eq!(json, r#"{"key":"k"}"#);
    }
}
