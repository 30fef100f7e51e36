//! Read-modify-write transactions over a single store key.
//!
//! The in-memory copy behind the mutex is the source of truth. An update runs
//! against a clone, the clone is serialized back to the store, and only then
//! does it replace the committed state. Overlapping async tasks therefore
//! cannot lose each other's writes, and a rejected store write leaves the
//! committed state untouched.
//!
//! State that must keep moving even when the store is full (mode switches,
//! drain bookkeeping) goes through [`DurableDocument::update_best_effort`]
//! instead, which commits in memory first and only logs a rejected write.

use super::KeyValueStore;
use crate::core::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex};
use tracing::{Level, event};

pub struct DurableDocument<T> {
    store: Arc<dyn KeyValueStore>,
    key: String,
    state: Mutex<T>,
}

impl<T> DurableDocument<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Loads the document stored under `key`, falling back to `fallback()` when
    /// the key is missing or its contents no longer parse.
    pub fn load_or_else(
        store: Arc<dyn KeyValueStore>,
        key: impl Into<String>,
        fallback: impl FnOnce() -> T,
    ) -> Self {
        let key = key.into();
        let state = match read_json::<T>(store.as_ref(), &key) {
            Ok(Some(state)) => state,
            Ok(None) => fallback(),
            Err(err) => {
                event!(Level::WARN, key = %key, error = %err, "stored document unreadable, using defaults");
                fallback()
            }
        };
        Self {
            store,
            key,
            state: Mutex::new(state),
        }
    }

    /// Starts from `state` without reading the store.
    pub fn with_state(store: Arc<dyn KeyValueStore>, key: impl Into<String>, state: T) -> Self {
        Self {
            store,
            key: key.into(),
            state: Mutex::new(state),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        let state = self.state.lock()?;
        Ok(f(&state))
    }

    pub fn snapshot(&self) -> Result<T> {
        self.read(T::clone)
    }

    /// Applies `f` and always writes the result back.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        self.update_selective(|state| f(state).map(|out| (out, true)))
    }

    /// Applies `f`; the new state is written to the store only when `f`
    /// returns `true` alongside its result.
    pub fn update_selective<R>(&self, f: impl FnOnce(&mut T) -> Result<(R, bool)>) -> Result<R> {
        let mut state = self.state.lock()?;
        let mut next = state.clone();
        let (out, persist) = f(&mut next)?;
        if persist {
            write_json(self.store.as_ref(), &self.key, &next)?;
        }
        *state = next;
        Ok(out)
    }

    /// Like [`update_selective`](Self::update_selective), but the new state is
    /// committed in memory even when the store rejects the write. Only an
    /// error from `f` itself is returned.
    pub fn update_best_effort<R>(
        &self,
        f: impl FnOnce(&mut T) -> Result<(R, bool)>,
    ) -> Result<R> {
        let mut state = self.state.lock()?;
        let mut next = state.clone();
        let (out, persist) = f(&mut next)?;
        if persist {
            if let Err(err) = write_json(self.store.as_ref(), &self.key, &next) {
                event!(Level::WARN, key = %self.key, error = %err, "store write rejected, keeping state in memory");
            }
        }
        *state = next;
        Ok(out)
    }

    /// Removes the stored copy; the in-memory state is kept.
    pub fn forget(&self) -> Result<()> {
        let _state = self.state.lock()?;
        self.store.remove_item(&self.key)
    }
}

pub fn read_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.get_item(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub fn write_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store.set_item(key, &raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: u32,
    }

    #[test]
    fn test_update_writes_through() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let doc = DurableDocument::load_or_else(store.clone(), "counter", Counter::default);
        doc.update(|c| {
            c.value += 2;
            Ok(())
        })
        .unwrap();

        let stored: Counter = read_json(store.as_ref(), "counter").unwrap().unwrap();
        assert_eq!(stored.value, 2);
    }

    #[test]
    fn test_failed_write_keeps_committed_state() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::with_quota(24));
        let doc = DurableDocument::load_or_else(store.clone(), "counter", Counter::default);
        doc.update(|c| {
            c.value = 1;
            Ok(())
        })
        .unwrap();

        let result = doc.update(|c| {
            c.value = 1_000_000_000;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(doc.snapshot().unwrap().value, 1);
    }

    #[test]
    fn test_best_effort_update_survives_rejected_write() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::with_quota(24));
        let doc = DurableDocument::load_or_else(store.clone(), "counter", Counter::default);

        let out = doc
            .update_best_effort(|c| {
                c.value = 1_000_000_000;
                Ok((c.value, true))
            })
            .unwrap();
        assert_eq!(out, 1_000_000_000);
        assert_eq!(doc.snapshot().unwrap().value, 1_000_000_000);
        assert_eq!(store.get_item("counter").unwrap(), None);

        let failed: Result<()> = doc.update_best_effort(|c| {
            c.value = 5;
            Err(crate::core::ResilienceError::Validation("rejected".into()))
        });
        assert!(failed.is_err());
        assert_eq!(doc.snapshot().unwrap().value, 1_000_000_000);
    }

    #[test]
    fn test_unparsable_document_falls_back() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store.set_item("counter", "{broken").unwrap();
        let doc = DurableDocument::load_or_else(store, "counter", || Counter { value: 7 });
        assert_eq!(doc.snapshot().unwrap(), Counter { value: 7 });
    }
}
