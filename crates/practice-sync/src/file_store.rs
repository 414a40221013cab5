//! File-backed key/value store.
//!
//! Each key is its own file under the data directory. A write lands in a
//! fresh temp file next to its target and is renamed over it, so readers in
//! other processes see either the old value or the new one. Writing one key
//! never touches another key's file.

use practice_sync_core::store::{KeyValueStore, Result, StoreError};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::warn;

/// Extension of the per-key value files.
pub const VALUE_EXTENSION: &str = "json";

/// Durable store for the queue, cursors, backups, and feature flag.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open the store in `dir`, creating the directory if needed.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| StoreError::Io(format!("{}: {}", dir.display(), e)))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding `key`.
    pub fn key_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", file_name_for(key), VALUE_EXTENSION))
    }
}

/// Map a key onto a portable file name. Bytes outside `[A-Za-z0-9._-]` are
/// written as `%XX`, so distinct keys never share a file.
fn file_name_for(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                name.push(byte as char)
            }
            _ => name.push_str(&format!("%{:02X}", byte)),
        }
    }
    name
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.key_path(key);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                warn!("Ignoring unreadable value file {}: {}", path.display(), e);
                Ok(None)
            }
            Err(e) => Err(StoreError::Io(format!("{}: {}", path.display(), e))),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.key_path(key);
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| StoreError::Io(e.to_string()))?;
        tmp.write_all(value.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| StoreError::Io(e.to_string()))?;
        tmp.persist(&path)
            .map_err(|e| StoreError::Io(format!("{}: {}", path.display(), e.error)))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.key_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(format!("{}: {}", path.display(), e))),
        }
    }
}
