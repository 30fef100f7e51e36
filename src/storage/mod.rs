pub mod document;
pub mod file;
pub mod memory;

pub use document::DurableDocument;
pub use file::FileStore;
pub use memory::MemoryStore;

use crate::core::Result;

/// Synchronous string key-value store with local-storage semantics.
///
/// This is the only durable medium the resilience layer writes to. Writes may
/// be rejected with [`ResilienceError::QuotaExceeded`](crate::ResilienceError::QuotaExceeded)
/// when the backing store has a size limit.
pub trait KeyValueStore: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>>;

    fn set_item(&self, key: &str, value: &str) -> Result<()>;

    fn remove_item(&self, key: &str) -> Result<()>;

    /// Key at `index` in the store's enumeration order.
    fn key(&self, index: usize) -> Result<Option<String>>;

    fn length(&self) -> Result<usize>;

    /// All keys starting with `prefix`, collected before any mutation.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for index in 0..self.length()? {
            if let Some(key) = self.key(index)? {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }
}
