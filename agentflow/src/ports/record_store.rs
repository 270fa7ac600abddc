//! Durable record storage for checkpoint records and execution snapshots.
//!
//! Records are JSON documents addressed by `(namespace, id)`. The file
//! implementation writes one document per record under a session directory,
//! replacing files atomically.

use crate::errors::EngineError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Namespace for stream checkpoint records.
pub const STREAM_CHECKPOINTS: &str = "stream_checkpoints";
/// Namespace for execution snapshots.
pub const EXECUTION_SNAPSHOTS: &str = "execution_snapshots";

/// Keyed JSON record storage.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Writes a record, replacing any previous version.
    async fn save(&self, namespace: &str, id: &str, record: Value) -> Result<(), EngineError>;

    /// Reads a record.
    async fn load(&self, namespace: &str, id: &str) -> Result<Option<Value>, EngineError>;

    /// Lists record ids in a namespace, sorted.
    async fn list(&self, namespace: &str) -> Result<Vec<String>, EngineError>;

    /// Removes a record. Returns whether it existed.
    async fn remove(&self, namespace: &str, id: &str) -> Result<bool, EngineError>;
}

/// Serializes and saves a typed record.
///
/// # Errors
///
/// Returns an error if serialization or the store fails.
pub async fn save_record<T: Serialize + ?Sized>(
    store: &dyn RecordStore,
    namespace: &str,
    id: &str,
    record: &T,
) -> Result<(), EngineError> {
    store.save(namespace, id, serde_json::to_value(record)?).await
}

/// Loads and deserializes a typed record.
///
/// # Errors
///
/// Returns an error if the store fails or the record does not match `T`.
pub async fn load_record<T: DeserializeOwned>(
    store: &dyn RecordStore,
    namespace: &str,
    id: &str,
) -> Result<Option<T>, EngineError> {
    match store.load(namespace, id).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Process-local record store.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl InMemoryRecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn save(&self, namespace: &str, id: &str, record: Value) -> Result<(), EngineError> {
        self.records
            .write()
            .entry(namespace.to_string())
            .or_default()
            .insert(id.to_string(), record);
        Ok(())
    }

    async fn load(&self, namespace: &str, id: &str) -> Result<Option<Value>, EngineError> {
        Ok(self
            .records
            .read()
            .get(namespace)
            .and_then(|ns| ns.get(id))
            .cloned())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<String>, EngineError> {
        Ok(self
            .records
            .read()
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove(&self, namespace: &str, id: &str) -> Result<bool, EngineError> {
        Ok(self
            .records
            .write()
            .get_mut(namespace)
            .and_then(|ns| ns.remove(id))
            .is_some())
    }
}

/// One JSON file per record: `<root>/<namespace>/<id>.json`.
#[derive(Debug, Clone)]
pub struct FileRecordStore {
    root: PathBuf,
}

impl FileRecordStore {
    /// Creates a store under `root` (a session directory).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The session directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, namespace: &str, id: &str) -> Result<PathBuf, EngineError> {
        let valid = |s: &str| {
            !s.is_empty()
                && s.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
                && s != "."
                && s != ".."
        };
        if !valid(namespace) || !valid(id) {
            return Err(EngineError::Store(format!(
                "invalid record address '{namespace}/{id}'"
            )));
        }
        Ok(self.root.join(namespace).join(format!("{id}.json")))
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn save(&self, namespace: &str, id: &str, record: Value) -> Result<(), EngineError> {
        let path = self.path_for(namespace, id)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(&record)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, namespace: &str, id: &str) -> Result<Option<Value>, EngineError> {
        let path = self.path_for(namespace, id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, namespace: &str) -> Result<Vec<String>, EngineError> {
        let dir = self.root.join(namespace);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn remove(&self, namespace: &str, id: &str) -> Result<bool, EngineError> {
        let path = self.path_for(namespace, id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
