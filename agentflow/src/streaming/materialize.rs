//! Draining streams into the artifact store and replaying them.

use super::{from_chunks, ChunkStream};
use crate::core::ArtifactReference;
use crate::errors::EngineError;
use crate::ports::{get_json, put_json, ArtifactStore, StoreHints};
use futures::StreamExt;
use serde_json::Value;
use tracing::debug;

/// Summary of a materialized stream.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedStream {
    /// Where the chunks were stored.
    pub reference: ArtifactReference,
    /// Number of chunks.
    pub chunks: u64,
    /// Serialized size of the stored document.
    pub bytes: u64,
}

/// Drains `stream` and stores its chunks under `reference`.
///
/// # Errors
///
/// Fails with a retryable node error if the stream faults, or with the
/// store's error if the write is rejected.
pub async fn materialize(
    mut stream: ChunkStream,
    store: &dyn ArtifactStore,
    reference: ArtifactReference,
    hints: StoreHints,
    node_id: &str,
) -> Result<MaterializedStream, EngineError> {
    let mut chunks = Vec::new();
    while let Some(item) = stream.next().await {
        let chunk = item.map_err(|fault| {
            EngineError::node(node_id, format!("stream failed during materialization: {fault}"), true)
        })?;
        chunks.push(chunk);
    }

    let bytes = serde_json::to_vec(&chunks)?.len() as u64;
    put_json(store, &reference.key, &chunks, hints).await?;
    debug!(key = %reference.key, chunks = chunks.len(), bytes, "stream materialized");

    Ok(MaterializedStream {
        reference,
        chunks: chunks.len() as u64,
        bytes,
    })
}

/// Returns a fresh stream over stored chunks.
///
/// # Errors
///
/// Returns [`EngineError::NotFound`] if the artifact is gone.
pub async fn replay(
    store: &dyn ArtifactStore,
    reference: &ArtifactReference,
) -> Result<ChunkStream, EngineError> {
    let chunks: Vec<Value> = get_json(store, &reference.key)
        .await?
        .ok_or_else(|| EngineError::NotFound(reference.to_string()))?;
    Ok(from_chunks(chunks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::InMemoryArtifactStore;
    use crate::streaming::StreamFault;
    use futures::stream;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_materialize_then_replay_twice() {
        let store = InMemoryArtifactStore::unbounded();
        let reference = ArtifactReference::new("streams/s/materialized");
        let summary = materialize(
            from_chunks(vec![json!("x"), json!("y")]),
            &store,
            reference.clone(),
            StoreHints::default(),
            "producer",
        )
        .await
        .unwrap();
        assert_eq!(summary.chunks, 2);

        for _ in 0..2 {
            let replayed: Vec<_> = replay(&store, &reference)
                .await
                .unwrap()
                .map(Result::unwrap)
                .collect()
                .await;
            assert_eq!(replayed, vec![json!("x"), json!("y")]);
        }
    }

    #[tokio::test]
    async fn test_fault_is_retryable_node_error() {
        let store = InMemoryArtifactStore::unbounded();
        let faulty = stream::iter(vec![Ok(json!(1)), Err(StreamFault::new("boom"))]).boxed();
        let err = materialize(faulty, &store, ArtifactReference::new("k"), StoreHints::default(), "p")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_replay_missing_is_not_found() {
        let store = InMemoryArtifactStore::unbounded();
        let Err(err) = replay(&store, &ArtifactReference::new("missing")).await else {
            panic!("replay of a missing artifact should fail");
        };
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
