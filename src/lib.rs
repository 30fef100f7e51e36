// ============================================================================
// Audit Resilience Library
// ============================================================================

pub mod cache;
pub mod config;
pub mod core;
pub mod mode;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod worker;

// Re-export main types for convenience
pub use crate::core::{
    Clock, ErrorCategory, ErrorReport, ManualClock, ResilienceError, Result, SystemClock,
};
pub use cache::{CacheConfig, CacheEngine, CacheStats, FetchOptions, spawn_cache_sweeper};
pub use config::{ResilienceConfig, StorageKeys};
pub use mode::{
    ForceRealGuard, ModeSettings, ModeStatus, ModeSubscription, OperationMode,
    OperationModeController,
};
pub use queue::{
    DrainReport, FnExecutor, OperationExecutor, OperationQueue, OperationRequest,
    OperationStatus, OperationType, QueueConfig, QueuedOperation, RetryOptions,
    spawn_queue_scheduler,
};
pub use retry::{
    BackoffConfig, BackoffStrategy, PolicyTable, RecoveryPolicy, RetryDefaults,
    RetryOrchestrator, RetryRequest, categorize_error,
};
pub use storage::{DurableDocument, FileStore, KeyValueStore, MemoryStore};
pub use worker::BackgroundWorker;

use std::sync::Arc;

// ============================================================================
// Assembled context
// ============================================================================

/// The controller, cache, queue and orchestrator wired to one store and clock.
///
/// Components receive the shared controller explicitly; there is no global
/// instance. Build one context per process and hand out clones of its parts.
///
/// # Examples
///
/// ```
/// use audit_resilience::{FnExecutor, MemoryStore, ResilienceConfig, ResilienceContext};
/// use futures::FutureExt;
/// use std::sync::Arc;
///
/// let executor = FnExecutor::new(|_op| async { Ok(()) }.boxed());
/// let ctx = ResilienceContext::open(
///     Arc::new(MemoryStore::new()),
///     Arc::new(executor),
///     ResilienceConfig::default(),
/// );
/// assert!(ctx.mode().is_real_mode());
/// ```
pub struct ResilienceContext {
    config: ResilienceConfig,
    mode: Arc<OperationModeController>,
    cache: CacheEngine,
    queue: OperationQueue,
    retry: Arc<RetryOrchestrator>,
}

impl ResilienceContext {
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        executor: Arc<dyn OperationExecutor>,
        config: ResilienceConfig,
    ) -> Self {
        Self::open_with_clock(store, executor, config, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        store: Arc<dyn KeyValueStore>,
        executor: Arc<dyn OperationExecutor>,
        config: ResilienceConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut mode = OperationModeController::open(
            store.clone(),
            config.storage_keys.mode.clone(),
            config.mode.clone(),
        )
        .with_clock(clock.clone());
        if let Some(seed) = config.jitter_seed {
            mode = mode.with_rng_seed(seed);
        }
        let mode = Arc::new(mode);

        let cache = CacheEngine::with_clock(
            store.clone(),
            mode.clone(),
            config.cache.clone(),
            clock.clone(),
        );

        let queue_config = match config.jitter_seed {
            Some(seed) => config.queue.clone().jitter_seed(Some(seed)),
            None => config.queue.clone(),
        };
        let queue = OperationQueue::open_with_clock(
            store,
            config.storage_keys.queue.clone(),
            mode.clone(),
            executor,
            queue_config,
            clock,
        );

        let mut retry = RetryOrchestrator::new(mode.clone(), config.retry).with_queue(queue.clone());
        if let Some(seed) = config.jitter_seed {
            retry = retry.with_rng_seed(seed);
        }

        Self {
            config,
            mode,
            cache,
            queue,
            retry: Arc::new(retry),
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn mode(&self) -> &Arc<OperationModeController> {
        &self.mode
    }

    pub fn cache(&self) -> &CacheEngine {
        &self.cache
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn retry(&self) -> &Arc<RetryOrchestrator> {
        &self.retry
    }

    /// Starts the cache sweeper and the queue scheduler on the current runtime.
    pub fn start_workers(&self) -> ContextWorkers {
        ContextWorkers {
            sweeper: spawn_cache_sweeper(self.cache.clone()),
            scheduler: spawn_queue_scheduler(self.queue.clone()),
        }
    }
}

/// Background workers of a [`ResilienceContext`]. Dropping aborts them.
pub struct ContextWorkers {
    sweeper: BackgroundWorker,
    scheduler: BackgroundWorker,
}

impl ContextWorkers {
    pub fn is_running(&self) -> bool {
        self.sweeper.is_running() && self.scheduler.is_running()
    }

    pub async fn stop(self) -> Result<()> {
        let ContextWorkers { sweeper, scheduler } = self;
        let scheduler_result = scheduler.stop().await;
        sweeper.stop().await?;
        scheduler_result
    }
}
