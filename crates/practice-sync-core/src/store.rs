//! KeyValueStore trait abstraction for durable sync state.
//!
//! The pending-mutation queue, the sync cursors, crash-recovery backups, and
//! the realtime feature flag all live in a small namespaced key/value store
//! that may be shared by several execution contexts at once.
//!
//! Implementations:
//! - `MemoryStore` - For testing; clones share one map, simulating two contexts
//! - `FileStore` (in practice-sync) - JSON document on disk

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable string key/value storage.
///
/// Operations are synchronous and complete without yielding, so a caller
/// holding the queue lock never observes a half-applied write from itself.
/// Other contexts may write between calls; callers reload before acting.
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` if the key is absent.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a key. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

/// Read and decode a JSON value.
///
/// Missing keys, I/O failures, and corrupt values all yield `None`. A corrupt
/// value is removed so the next write starts clean.
pub fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Option<T> {
    let raw = match store.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            warn!("Failed to read {}: {}", key, e);
            return None;
        }
    };

    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Discarding corrupt value for {}: {}", key, e);
            if let Err(e) = store.remove(key) {
                warn!("Failed to clear corrupt key {}: {}", key, e);
            }
            None
        }
    }
}

/// Encode and write a JSON value.
pub fn save_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let raw = serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    store.set(key, &raw)
}

/// Crash-recovery snapshots kept alongside the sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupSlot {
    Entries,
    Pieces,
    Goals,
    Metadata,
}

impl BackupSlot {
    fn name(&self) -> &'static str {
        match self {
            BackupSlot::Entries => "entries",
            BackupSlot::Pieces => "pieces",
            BackupSlot::Goals => "goals",
            BackupSlot::Metadata => "metadata",
        }
    }
}

/// Namespaced key names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    prefix: String,
}

impl StoreKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}.{}", self.prefix, name)
    }

    pub fn last_sync_time(&self) -> String {
        self.key("last_sync_time")
    }

    pub fn last_seq(&self) -> String {
        self.key("last_seq")
    }

    pub fn offline_queue(&self) -> String {
        self.key("offline_queue")
    }

    pub fn realtime_enabled(&self) -> String {
        self.key("realtime_enabled")
    }

    pub fn backup(&self, slot: BackupSlot) -> String {
        self.key(&format!("backup.{}", slot.name()))
    }
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self::new("practice_sync")
    }
}

/// Whether realtime sync is switched on. Defaults to on when unset.
pub fn realtime_enabled(store: &dyn KeyValueStore, keys: &StoreKeys) -> bool {
    load_json(store, &keys.realtime_enabled()).unwrap_or(true)
}

/// Persist the realtime feature flag.
pub fn set_realtime_enabled(store: &dyn KeyValueStore, keys: &StoreKeys, enabled: bool) -> Result<()> {
    save_json(store, &keys.realtime_enabled(), &enabled)
}

/// In-memory store for testing.
///
/// Clones share the same underlying map, so two clients built on clones of
/// one `MemoryStore` behave like two tabs over one browser storage area.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.values.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.remove(key);
        Ok(())
    }
}
