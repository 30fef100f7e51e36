use super::CacheEngine;
use crate::worker::BackgroundWorker;
use std::time::Duration;
use tracing::{Level, event};

/// Runs [`CacheEngine::sweep_expired`] every `cleanup_interval_ms`.
pub fn spawn_cache_sweeper(engine: CacheEngine) -> BackgroundWorker {
    let interval = Duration::from_millis(engine.config().cleanup_interval_ms.max(1));

    BackgroundWorker::spawn("cache-sweeper", move |mut stop_rx| async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = ticker.tick() => {
                    if let Err(err) = engine.sweep_expired() {
                        event!(Level::WARN, error = %err, "cache sweep failed");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::core::ManualClock;
    use crate::mode::OperationModeController;
    use crate::storage::MemoryStore;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_entries() {
        let clock = Arc::new(ManualClock::starting_now());
        let engine = CacheEngine::with_clock(
            Arc::new(MemoryStore::new()),
            Arc::new(OperationModeController::in_memory()),
            CacheConfig::default().cleanup_interval(Duration::from_secs(60)),
            clock.clone(),
        );
        engine.set("a", &"x", Some(Duration::from_secs(1))).unwrap();

        let worker = spawn_cache_sweeper(engine.clone());
        clock.advance(Duration::from_secs(2));
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(engine.stats().entries, 0);
        worker.stop().await.unwrap();
    }
}
