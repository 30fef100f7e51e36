//! File-backed durable store.
//!
//! The whole map lives in one JSON object file. Every mutation rewrites the
//! file through a temporary sibling that is synced and renamed into place, so
//! a crash leaves either the previous or the new contents, never a torn file.

use super::KeyValueStore;
use crate::core::{ResilienceError, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tempfile::NamedTempFile;
use tracing::{Level, event};

pub struct FileStore {
    path: PathBuf,
    items: RwLock<BTreeMap<String, String>>,
}

impl FileStore {
    /// Opens the store at `path`, creating parent directories as needed.
    ///
    /// A missing file is an empty store. A file that cannot be parsed is an
    /// error rather than silently discarded.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    ResilienceError::Storage(format!("Failed to create store directory: {}", e))
                })?;
            }
        }

        let items = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|e| {
                ResilienceError::Storage(format!("Failed to read store file: {}", e))
            })?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str::<BTreeMap<String, String>>(&raw).map_err(|e| {
                    ResilienceError::Storage(format!(
                        "Failed to parse store file '{}': {}",
                        path.display(),
                        e
                    ))
                })?
            }
        } else {
            BTreeMap::new()
        };

        event!(Level::DEBUG, path = %path.display(), keys = items.len(), "file store opened");
        Ok(Self {
            path,
            items: RwLock::new(items),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, items: &BTreeMap<String, String>) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let serialized = serde_json::to_vec_pretty(items)?;
        let mut temp = NamedTempFile::new_in(&dir)
            .map_err(|e| ResilienceError::Storage(format!("Failed to create temp file: {}", e)))?;
        temp.write_all(&serialized)
            .map_err(|e| ResilienceError::Storage(format!("Failed to write store: {}", e)))?;
        temp.flush()
            .map_err(|e| ResilienceError::Storage(format!("Failed to flush store: {}", e)))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| ResilienceError::Storage(format!("Failed to sync store: {}", e)))?;
        temp.persist(&self.path)
            .map_err(|e| ResilienceError::Storage(format!("Failed to rename store: {}", e)))?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let items = self.items.read()?;
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut items = self.items.write()?;
        let previous = items.insert(key.to_string(), value.to_string());
        if let Err(err) = self.flush(&items) {
            match previous {
                Some(previous) => items.insert(key.to_string(), previous),
                None => items.remove(key),
            };
            return Err(err);
        }
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let mut items = self.items.write()?;
        if let Some(previous) = items.remove(key) {
            if let Err(err) = self.flush(&items) {
                items.insert(key.to_string(), previous);
                return Err(err);
            }
        }
        Ok(())
    }

    fn key(&self, index: usize) -> Result<Option<String>> {
        let items = self.items.read()?;
        Ok(items.keys().nth(index).cloned())
    }

    fn length(&self) -> Result<usize> {
        let items = self.items.read()?;
        Ok(items.len())
    }
}
