//! Artifact store port and the bundled implementations.
//!
//! The engine stores large batch outputs, materialized streams and captured
//! checkpoint chunks here. `get` after `put` returns the same bytes unless the
//! entry was evicted; pinned entries are never evicted.

use crate::errors::{EngineError, ResourceError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};

/// Placement hints passed with `put`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreHints {
    /// Evict before anything else.
    #[serde(default)]
    pub temporary: bool,
    /// Never evict until unpinned.
    #[serde(default)]
    pub pinned: bool,
    /// Higher priority entries are evicted later.
    #[serde(default)]
    pub priority: Option<u8>,
}

impl StoreHints {
    /// Hints for short-lived intermediate data.
    #[must_use]
    pub fn temporary() -> Self {
        Self {
            temporary: true,
            ..Self::default()
        }
    }

    /// Hints for data that must survive until explicitly unpinned.
    #[must_use]
    pub fn pinned() -> Self {
        Self {
            pinned: true,
            ..Self::default()
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Key/value store for intermediate outputs.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores `bytes` under `key`, replacing any previous value.
    async fn put(&self, key: &str, bytes: Vec<u8>, hints: StoreHints) -> Result<(), EngineError>;

    /// Loads the value under `key`, or `None` if absent or evicted.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, EngineError>;

    /// Deletes `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, EngineError>;

    /// Protects `key` from eviction.
    async fn pin(&self, key: &str) -> Result<(), EngineError>;

    /// Makes `key` evictable again.
    async fn unpin(&self, key: &str) -> Result<(), EngineError>;
}

/// Serializes `value` as JSON and stores it.
///
/// # Errors
///
/// Returns an error if serialization or the store fails.
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn ArtifactStore,
    key: &str,
    value: &T,
    hints: StoreHints,
) -> Result<(), EngineError> {
    let bytes = serde_json::to_vec(value)?;
    store.put(key, bytes, hints).await
}

/// Loads and deserializes a JSON value.
///
/// # Errors
///
/// Returns an error if the store fails or the bytes are not valid JSON for `T`.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn ArtifactStore,
    key: &str,
) -> Result<Option<T>, EngineError> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

#[derive(Debug)]
struct Entry {
    bytes: Vec<u8>,
    hints: StoreHints,
    last_access: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, Entry>,
    used: u64,
    clock: u64,
}

impl MemoryState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Bounded in-memory store with eviction of unpinned entries.
///
/// Eviction order: temporary entries first, then lower priority, then least
/// recently used.
#[derive(Debug)]
pub struct InMemoryArtifactStore {
    capacity: u64,
    state: Mutex<MemoryState>,
}

impl InMemoryArtifactStore {
    /// Creates a store holding at most `capacity` bytes.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Creates a store without a practical capacity limit.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(u64::MAX)
    }

    /// Bytes currently stored.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_for(&self, state: &mut MemoryState, key: &str, needed: u64) -> Result<(), ResourceError> {
        let full = || ResourceError::StoreFull {
            key: key.to_string(),
            requested: needed,
            capacity: self.capacity,
        };

        if needed > self.capacity {
            return Err(full());
        }

        let mut candidates: Vec<(bool, u8, u64, String)> = state
            .entries
            .iter()
            .filter(|(k, e)| !e.hints.pinned && k.as_str() != key)
            .map(|(k, e)| {
                (
                    !e.hints.temporary,
                    e.hints.priority.unwrap_or(0),
                    e.last_access,
                    k.clone(),
                )
            })
            .collect();
        candidates.sort();

        let evictable: u64 = candidates
            .iter()
            .filter_map(|(_, _, _, k)| state.entries.get(k))
            .map(|e| e.bytes.len() as u64)
            .sum();
        if state.used - evictable + needed > self.capacity {
            return Err(full());
        }

        for (_, _, _, victim) in candidates {
            if state.used + needed <= self.capacity {
                break;
            }
            if let Some(entry) = state.entries.remove(&victim) {
                state.used -= entry.bytes.len() as u64;
                tracing::debug!(key = %victim, bytes = entry.bytes.len(), "evicted artifact");
            }
        }
        Ok(())
    }
}

impl Default for InMemoryArtifactStore {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, hints: StoreHints) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let size = bytes.len() as u64;

        if let Some(old) = state.entries.remove(key) {
            state.used -= old.bytes.len() as u64;
        }
        if state.used + size > self.capacity {
            self.evict_for(&mut state, key, size)?;
        }

        let last_access = state.tick();
        state.used += size;
        state.entries.insert(
            key.to_string(),
            Entry {
                bytes,
                hints,
                last_access,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, EngineError> {
        let mut state = self.state.lock();
        let now = state.tick();
        Ok(state.entries.get_mut(key).map(|entry| {
            entry.last_access = now;
            entry.bytes.clone()
        }))
    }

    async fn delete(&self, key: &str) -> Result<bool, EngineError> {
        let mut state = self.state.lock();
        match state.entries.remove(key) {
            Some(entry) => {
                state.used -= entry.bytes.len() as u64;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn pin(&self, key: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(key)
            .ok_or_else(|| EngineError::NotFound(format!("artifact '{key}'")))?;
        entry.hints.pinned = true;
        Ok(())
    }

    async fn unpin(&self, key: &str) -> Result<(), EngineError> {
        if let Some(entry) = self.state.lock().entries.get_mut(key) {
            entry.hints.pinned = false;
        }
        Ok(())
    }
}

/// Directory-backed store. Keys map to relative paths under the root.
///
/// Entries are never evicted; pins are tracked for interface parity.
#[derive(Debug)]
pub struct FsArtifactStore {
    root: PathBuf,
    pinned: Mutex<HashSet<String>>,
}

impl FsArtifactStore {
    /// Creates a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            pinned: Mutex::new(HashSet::new()),
        })
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, EngineError> {
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !safe {
            return Err(EngineError::Store(format!("invalid artifact key '{key}'")));
        }
        Ok(self.root.join(relative))
    }

    /// Whether `key` is pinned.
    #[must_use]
    pub fn is_pinned(&self, key: &str) -> bool {
        self.pinned.lock().contains(key)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, hints: StoreHints) -> Result<(), EngineError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        if hints.pinned {
            self.pinned.lock().insert(key.to_string());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, EngineError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, EngineError> {
        let path = self.path_for(key)?;
        self.pinned.lock().remove(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pin(&self, key: &str) -> Result<(), EngineError> {
        let path = self.path_for(key)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(EngineError::NotFound(format!("artifact '{key}'")));
        }
        self.pinned.lock().insert(key.to_string());
        Ok(())
    }

    async fn unpin(&self, key: &str) -> Result<(), EngineError> {
        self.pinned.lock().remove(key);
        Ok(())
    }
}
