use super::KeyValueStore;
use crate::core::{ResilienceError, Result};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// In-memory store. Keys enumerate in lexical order.
pub struct MemoryStore {
    items: RwLock<BTreeMap<String, String>>,
    /// Upper bound on the sum of key and value lengths, like a browser's quota.
    quota_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
            quota_bytes: None,
        }
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.items
            .read()
            .map(|items| items.iter().map(|(k, v)| k.len() + v.len()).sum())
            .unwrap_or_default()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let items = self.items.read()?;
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut items = self.items.write()?;
        if let Some(limit) = self.quota_bytes {
            let current: usize = items
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let required = current + key.len() + value.len();
            if required > limit {
                return Err(ResilienceError::QuotaExceeded {
                    key: key.to_string(),
                    required,
                    limit,
                });
            }
        }
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let mut items = self.items.write()?;
        items.remove(key);
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
