use crate::cache::CacheConfig;
use crate::core::{ResilienceError, Result};
use crate::mode::{DEFAULT_MODE_KEY, ModeSettings};
use crate::queue::{DEFAULT_QUEUE_KEY, QueueConfig};
use crate::retry::RetryDefaults;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Durable-store keys of the persisted documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageKeys {
    /// Key of the `{isDemoMode, settings}` document
    pub mode: String,

    /// Key of the `{operations, isProcessing, lastSync}` document
    pub queue: String,
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self {
            mode: DEFAULT_MODE_KEY.to_string(),
            queue: DEFAULT_QUEUE_KEY.to_string(),
        }
    }
}

/// Resilience layer configuration
///
/// Every section is optional in JSON; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResilienceConfig {
    /// Initial mode-controller settings
    pub mode: ModeSettings,

    /// Cache engine settings
    pub cache: CacheConfig,

    /// Operation queue settings
    pub queue: QueueConfig,

    /// Retry parameters used when a request does not set them
    pub retry: RetryDefaults,

    pub storage_keys: StorageKeys,

    /// Seeds every jitter and simulated-failure generator (tests, replays)
    pub jitter_seed: Option<u64>,
}

impl ResilienceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ResilienceError::Storage(format!("failed to read config {}: {}", path.display(), err))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        self.mode.validate()?;
        if self.queue.poll_interval_ms == 0 {
            return Err(ResilienceError::Validation(
                "queue.pollIntervalMs must be positive".to_string(),
            ));
        }
        if self.cache.cleanup_interval_ms == 0 {
            return Err(ResilienceError::Validation(
                "cache.cleanupIntervalMs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the mode settings
    pub fn mode(mut self, mode: ModeSettings) -> Self {
        self.mode = mode;
        self
    }

    /// Set the cache settings
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Set the queue settings
    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Set the retry defaults
    pub fn retry(mut self, retry: RetryDefaults) -> Self {
        self.retry = retry;
        self
    }

    pub fn storage_keys(mut self, keys: StorageKeys) -> Self {
        self.storage_keys = keys;
        self
    }

    pub fn jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }
}
