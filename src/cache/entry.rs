use serde::{Deserialize, Serialize};

/// Stored envelope: `{data, timestamp, expiry}`, times in epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    pub timestamp: i64,
    /// `None` never expires.
    pub expiry: Option<i64>,
}

impl<T> CacheEntry<T> {
    pub fn is_fresh_at(&self, now_ms: i64) -> bool {
        self.expiry.map(|expiry| now_ms < expiry).unwrap_or(true)
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.timestamp)
    }
}
