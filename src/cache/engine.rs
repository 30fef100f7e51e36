use super::entry::CacheEntry;
use crate::core::{Clock, ResilienceError, Result, SystemClock};
use crate::mode::OperationModeController;
use crate::storage::KeyValueStore;
use crate::storage::document::{read_json, write_json};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{Level, event, info_span};

/// Cache engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Prepended to every cache key in the durable store.
    pub key_prefix: String,
    /// TTL applied when a call passes none (or zero). `None` never expires.
    pub default_ttl_ms: Option<u64>,
    /// TTL multiplier while in Demo mode.
    pub demo_ttl_multiplier: u32,
    /// Period of the expired-entry sweep.
    pub cleanup_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "app_cache_".to_string(),
            default_ttl_ms: Some(5 * 60_000),
            demo_ttl_multiplier: 2,
            cleanup_interval_ms: 15 * 60_000,
        }
    }
}

impl CacheConfig {
    pub fn key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }

    pub fn default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl_ms = ttl.map(|ttl| ttl.as_millis() as u64);
        self
    }

    pub fn demo_ttl_multiplier(mut self, multiplier: u32) -> Self {
        self.demo_ttl_multiplier = multiplier;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval_ms = interval.as_millis() as u64;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

type SuccessHook<T> = Box<dyn Fn(&T, bool) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&ResilienceError) + Send + Sync>;
type LoadingHook = Box<dyn Fn(bool) + Send + Sync>;

/// Options of a read-through [`CacheEngine::fetch`].
pub struct FetchOptions<T> {
    ttl: Option<Duration>,
    stale_while_revalidate: bool,
    simulated: Option<T>,
    on_success: Option<SuccessHook<T>>,
    on_error: Option<ErrorHook>,
    on_loading: Option<LoadingHook>,
}

impl<T> Default for FetchOptions<T> {
    fn default() -> Self {
        Self {
            ttl: None,
            stale_while_revalidate: false,
            simulated: None,
            on_success: None,
            on_error: None,
            on_loading: None,
        }
    }
}

impl<T> FetchOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn stale_while_revalidate(mut self, enabled: bool) -> Self {
        self.stale_while_revalidate = enabled;
        self
    }

    /// Data served instead of calling the fetcher while in Demo mode.
    pub fn simulated(mut self, data: T) -> Self {
        self.simulated = Some(data);
        self
    }

    /// Called with the data and whether it came from the cache.
    pub fn on_success(mut self, hook: impl Fn(&T, bool) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Box::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&ResilienceError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }

    pub fn on_loading(mut self, hook: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_loading = Some(Box::new(hook));
        self
    }

    fn succeeded(&self, data: &T, from_cache: bool) {
        if let Some(hook) = &self.on_success {
            hook(data, from_cache);
        }
    }

    fn failed(&self, err: &ResilienceError) {
        if let Some(hook) = &self.on_error {
            hook(err);
        }
    }

    fn loading(&self, loading: bool) {
        if let Some(hook) = &self.on_loading {
            hook(loading);
        }
    }
}

struct CacheInner {
    store: Arc<dyn KeyValueStore>,
    mode: Arc<OperationModeController>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    refreshing: Mutex<HashSet<String>>,
}

/// TTL cache over the durable store with read-through fetch and
/// stale-while-revalidate. Cloning shares the same cache.
#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<CacheInner>,
}

impl CacheEngine {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        mode: Arc<OperationModeController>,
        config: CacheConfig,
    ) -> Self {
        Self::with_clock(store, mode, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn KeyValueStore>,
        mode: Arc<OperationModeController>,
        config: CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                store,
                mode,
                clock,
                config,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                refreshing: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.inner.config.key_prefix, key)
    }

    /// TTL actually applied: zero or missing falls back to the default, and
    /// Demo mode stretches it by the configured multiplier.
    pub fn effective_ttl(&self, ttl: Option<Duration>) -> Option<Duration> {
        let requested = ttl.filter(|ttl| !ttl.is_zero()).or_else(|| {
            self.inner
                .config
                .default_ttl_ms
                .map(Duration::from_millis)
        })?;
        if self.inner.mode.is_demo_mode() {
            let multiplier = self.inner.config.demo_ttl_multiplier.max(1);
            Some(requested.checked_mul(multiplier).unwrap_or(requested))
        } else {
            Some(requested)
        }
    }

    /// Reads the envelope for `key`; unreadable envelopes are dropped.
    fn read_entry<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        let storage_key = self.storage_key(key);
        match read_json::<CacheEntry<T>>(self.inner.store.as_ref(), &storage_key) {
            Ok(entry) => entry,
            Err(err) => {
                event!(Level::WARN, key = %key, error = %err, "dropping unreadable cache entry");
                if let Err(err) = self.inner.store.remove_item(&storage_key) {
                    event!(Level::DEBUG, key = %key, error = %err, "failed to remove unreadable cache entry");
                }
                None
            }
        }
    }

    fn record(&self, hit: bool) {
        let counter = if hit {
            &self.inner.hits
        } else {
            &self.inner.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Fresh data for `key`, or `None`. Never fails.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = self.inner.clock.now_ms();
        match self.read_entry::<T>(key) {
            Some(entry) if entry.is_fresh_at(now) => {
                self.record(true);
                Some(entry.data)
            }
            _ => {
                self.record(false);
                None
            }
        }
    }

    /// Stores `data` under `key`. When the store is full, expired entries are
    /// swept and the write is tried once more.
    pub fn set<T: Serialize>(&self, key: &str, data: &T, ttl: Option<Duration>) -> Result<()> {
        let now = self.inner.clock.now_ms();
        let expiry = self
            .effective_ttl(ttl)
            .map(|ttl| now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)));
        let entry = CacheEntry {
            data,
            timestamp: now,
            expiry,
        };
        let storage_key = self.storage_key(key);

        match write_json(self.inner.store.as_ref(), &storage_key, &entry) {
            Err(ResilienceError::QuotaExceeded { .. }) => {
                let swept = self.sweep_expired()?;
                event!(Level::DEBUG, key = %key, swept, "cache full, retrying write after sweep");
                write_json(self.inner.store.as_ref(), &storage_key, &entry)
            }
            other => other,
        }
    }

    pub fn invalidate(&self, key: &str) -> Result<()> {
        self.inner.store.remove_item(&self.storage_key(key))
    }

    /// Removes every entry whose key starts with `prefix`; returns how many.
    pub fn invalidate_by_prefix(&self, prefix: &str) -> Result<usize> {
        let span = info_span!("cache.invalidate_prefix", prefix = %prefix);
        let _enter = span.enter();
        let keys = self.inner.store.keys_with_prefix(&self.storage_key(prefix))?;
        for key in &keys {
            self.inner.store.remove_item(key)?;
        }
        event!(Level::DEBUG, removed = keys.len(), "cache entries invalidated");
        Ok(keys.len())
    }

    pub fn clear(&self) -> Result<usize> {
        let removed = self.invalidate_by_prefix("")?;
        self.inner.hits.store(0, Ordering::Relaxed);
        self.inner.misses.store(0, Ordering::Relaxed);
        Ok(removed)
    }

    /// Removes entries that have expired (or no longer parse); returns how many.
    pub fn sweep_expired(&self) -> Result<usize> {
        let now = self.inner.clock.now_ms();
        let keys = self
            .inner
            .store
            .keys_with_prefix(&self.inner.config.key_prefix)?;
        let mut removed = 0;
        for key in keys {
            let expired = match read_json::<CacheEntry<serde_json::Value>>(
                self.inner.store.as_ref(),
                &key,
            ) {
                Ok(Some(entry)) => !entry.is_fresh_at(now),
                Ok(None) => false,
                Err(_) => true,
            };
            if expired {
                self.inner.store.remove_item(&key)?;
                removed += 1;
            }
        }
        if removed > 0 {
            event!(Level::DEBUG, removed, "expired cache entries swept");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self
            .inner
            .store
            .keys_with_prefix(&self.inner.config.key_prefix)
            .map(|keys| keys.len())
            .unwrap_or_default();
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            entries,
        }
    }

    /// Read-through fetch.
    ///
    /// - Demo mode with simulated data: serve it after the simulated latency.
    /// - Stale-while-revalidate with any entry (fresh or stale): return the
    ///   entry and refresh it in the background; refresh errors are swallowed.
    /// - Fresh entry: return it.
    /// - Otherwise await `fetcher`, cache the result and return it. Fetcher
    ///   errors reach `on_error` and then the caller.
    pub async fn fetch<T, F, Fut>(&self, key: &str, fetcher: F, options: FetchOptions<T>) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut options = options;

        if self.inner.mode.is_demo_mode() {
            if let Some(simulated) = options.simulated.take() {
                return self.serve_simulated(key, simulated, options).await;
            }
        }

        if let Some(entry) = self.read_entry::<T>(key) {
            let fresh = entry.is_fresh_at(self.inner.clock.now_ms());
            if options.stale_while_revalidate {
                self.record(true);
                self.spawn_refresh(key, fetcher, options.ttl);
                options.succeeded(&entry.data, true);
                return Ok(entry.data);
            }
            if fresh {
                self.record(true);
                options.succeeded(&entry.data, true);
                return Ok(entry.data);
            }
        }
        self.record(false);

        options.loading(true);
        let result = fetcher().await;
        options.loading(false);

        match result {
            Ok(data) => {
                if let Err(err) = self.set(key, &data, options.ttl) {
                    event!(Level::WARN, key = %key, error = %err, "failed to cache fetched data");
                }
                self.inner.mode.report_success();
                options.succeeded(&data, false);
                Ok(data)
            }
            Err(err) => {
                self.inner.mode.report_failure(&err, Some(key));
                options.failed(&err);
                Err(err)
            }
        }
    }

    async fn serve_simulated<T: Serialize>(
        &self,
        key: &str,
        simulated: T,
        options: FetchOptions<T>,
    ) -> Result<T> {
        options.loading(true);
        let outcome = self.inner.mode.simulate_network().await;
        options.loading(false);
        match outcome {
            Ok(()) => {
                if let Err(err) = self.set(key, &simulated, options.ttl) {
                    event!(Level::WARN, key = %key, error = %err, "failed to cache simulated data");
                }
                options.succeeded(&simulated, false);
                Ok(simulated)
            }
            Err(err) => {
                options.failed(&err);
                Err(err)
            }
        }
    }

    /// At most one background refresh per key is in flight.
    fn spawn_refresh<T, F, Fut>(&self, key: &str, fetcher: F, ttl: Option<Duration>)
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let Some(slot) = RefreshSlot::claim(self, key) else {
            event!(Level::DEBUG, key = %key, "background refresh already in flight");
            return;
        };

        tokio::spawn(async move {
            let slot = slot;
            match fetcher().await {
                Ok(data) => {
                    if let Err(err) = slot.engine.set(&slot.key, &data, ttl) {
                        event!(Level::WARN, key = %slot.key, error = %err, "background refresh not cached");
                    }
                }
                Err(err) => {
                    event!(Level::DEBUG, key = %slot.key, error = %err, "background refresh failed");
                }
            }
        });
    }

    pub fn refresh_in_flight(&self, key: &str) -> bool {
        self.inner
            .refreshing
            .lock()
            .map(|refreshing| refreshing.contains(key))
            .unwrap_or(false)
    }
}

/// Marks a key as being refreshed; released on drop, including when the
/// refresh task panics or is aborted.
struct RefreshSlot {
    engine: CacheEngine,
    key: String,
}

impl RefreshSlot {
    fn claim(engine: &CacheEngine, key: &str) -> Option<Self> {
        let mut refreshing = engine.inner.refreshing.lock().ok()?;
        if !refreshing.insert(key.to_string()) {
            return None;
        }
        Some(Self {
            engine: engine.clone(),
            key: key.to_string(),
        })
    }
}

impl Drop for RefreshSlot {
    fn drop(&mut self) {
        if let Ok(mut refreshing) = self.engine.inner.refreshing.lock() {
            refreshing.remove(&self.key);
        }
    }
}
