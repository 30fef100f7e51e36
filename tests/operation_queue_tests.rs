//! Integration tests for the durable operation queue

use audit_resilience::queue::DEFAULT_QUEUE_KEY;
use audit_resilience::{
    BackoffStrategy, ErrorCategory, FileStore, FnExecutor, KeyValueStore, ManualClock,
    MemoryStore, ModeSettings, OperationExecutor, OperationModeController, OperationQueue,
    OperationRequest, OperationStatus, OperationType, QueueConfig, QueuedOperation,
    ResilienceError, RetryOptions,
};
use futures::FutureExt;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

/// Fails the first `failures` calls with a network error, then succeeds.
fn flaky_executor(failures: u32, calls: Arc<AtomicU32>) -> Arc<dyn OperationExecutor> {
    Arc::new(FnExecutor::new(move |_op| {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < failures {
                Err(ResilienceError::Network("Failed to fetch".into()))
            } else {
                Ok(())
            }
        }
        .boxed()
    }))
}

fn open_queue(
    store: Arc<dyn KeyValueStore>,
    clock: Arc<ManualClock>,
    executor: Arc<dyn OperationExecutor>,
) -> OperationQueue {
    OperationQueue::open_with_clock(
        store,
        DEFAULT_QUEUE_KEY,
        Arc::new(OperationModeController::in_memory()),
        executor,
        QueueConfig::default().jitter_seed(Some(17)),
        clock,
    )
}

fn immediate(max_attempts: u32) -> RetryOptions {
    RetryOptions::default()
        .max_attempts(max_attempts)
        .strategy(BackoffStrategy::Immediate)
}

#[tokio::test(start_paused = true)]
async fn test_failed_then_successful_update() {
    let clock = Arc::new(ManualClock::starting_now());
    let calls = Arc::new(AtomicU32::new(0));
    let queue = open_queue(
        Arc::new(MemoryStore::new()),
        clock.clone(),
        flaky_executor(1, calls.clone()),
    );

    let op = queue
        .enqueue(
            OperationRequest::new("project", OperationType::Update)
                .entity_id("p1")
                .payload(json!({"name": "X"}))
                .retry(
                    RetryOptions::default()
                        .max_attempts(2)
                        .strategy(BackoffStrategy::Fixed)
                        .initial_delay_ms(100),
                ),
        )
        .unwrap();
    clock.advance(Duration::from_millis(130));

    let first = queue.drain().await.unwrap();
    assert_eq!((first.attempted, first.failed), (1, 1));

    let after_failure = queue.get(&op.id).unwrap();
    assert_eq!(after_failure.attempts, 1);
    assert_eq!(after_failure.status, OperationStatus::Pending);
    assert_eq!(after_failure.error.as_deref(), Some("Network error: Failed to fetch"));
    let wait = after_failure.next_retry_time.unwrap() - after_failure.last_attempt.unwrap();
    assert!((70..=130).contains(&wait.num_milliseconds()), "wait {:?}", wait);

    // not due yet
    assert_eq!(queue.drain().await.unwrap().attempted, 0);

    clock.advance(Duration::from_millis(130));
    let second = queue.drain().await.unwrap();
    assert_eq!((second.attempted, second.succeeded), (1, 1));
    assert_eq!(queue.get(&op.id).unwrap().status, OperationStatus::Success);
    assert_eq!(queue.success_count(), 1);

    tokio::time::sleep(Duration::from_millis(5_010)).await;
    assert!(queue.get(&op.id).is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_operation_stays_in_error() {
    let clock = Arc::new(ManualClock::starting_now());
    let calls = Arc::new(AtomicU32::new(0));
    let queue = open_queue(
        Arc::new(MemoryStore::new()),
        clock,
        flaky_executor(u32::MAX, calls.clone()),
    );
    let op = queue
        .enqueue(OperationRequest::new("task", OperationType::Create).retry(immediate(3)))
        .unwrap();

    for _ in 0..3 {
        queue.drain().await.unwrap();
    }
    let failed = queue.get(&op.id).unwrap();
    assert_eq!(failed.status, OperationStatus::Error);
    assert_eq!(failed.attempts, 3);
    assert_eq!(failed.next_retry_time, None);

    assert_eq!(queue.drain().await.unwrap().attempted, 0);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(queue.error_count(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_non_retryable_failure_skips_remaining_attempts() {
    let executor: Arc<dyn OperationExecutor> = Arc::new(FnExecutor::new(|_op| {
        async { Err(ResilienceError::Authorization("read-only token".into())) }.boxed()
    }));
    let queue = open_queue(
        Arc::new(MemoryStore::new()),
        Arc::new(ManualClock::starting_now()),
        executor,
    );
    let op = queue
        .enqueue(OperationRequest::new("task", OperationType::Delete).retry(immediate(5)))
        .unwrap();

    queue.drain().await.unwrap();
    let failed = queue.get(&op.id).unwrap();
    assert_eq!(failed.status, OperationStatus::Error);
    assert_eq!(failed.attempts, 1);
}

#[tokio::test]
async fn test_retry_now_revives_failed_operation() {
    let calls = Arc::new(AtomicU32::new(0));
    let queue = open_queue(
        Arc::new(MemoryStore::new()),
        Arc::new(ManualClock::starting_now()),
        flaky_executor(1, calls),
    );
    let op = queue
        .enqueue(OperationRequest::new("task", OperationType::Update).retry(immediate(1)))
        .unwrap();

    queue.drain().await.unwrap();
    assert_eq!(queue.get(&op.id).unwrap().status, OperationStatus::Error);

    let report = queue.retry_now(&op.id).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(queue.get(&op.id).unwrap().status, OperationStatus::Success);

    assert_err!(queue.reset_for_retry(&op.id));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_drains_do_not_overlap() {
    let running = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    let executor: Arc<dyn OperationExecutor> = {
        let running = running.clone();
        let peak = peak.clone();
        Arc::new(FnExecutor::new(move |_op| {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        }))
    };
    let queue = open_queue(
        Arc::new(MemoryStore::new()),
        Arc::new(ManualClock::starting_now()),
        executor,
    );
    for _ in 0..3 {
        queue
            .enqueue(OperationRequest::new("task", OperationType::Create).retry(immediate(3)))
            .unwrap();
    }

    let (a, b) = tokio::join!(queue.drain(), queue.drain());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.attempted + b.attempted, 3);
    assert!(a.attempted == 0 || b.attempted == 0);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(!queue.is_processing());
}

#[tokio::test]
async fn test_drain_runs_selected_operations_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let executor: Arc<dyn OperationExecutor> = {
        let seen = seen.clone();
        Arc::new(FnExecutor::new(move |op: QueuedOperation| {
            seen.lock().unwrap().push(op.entity_id.unwrap_or_default());
            async { Ok(()) }.boxed()
        }))
    };
    let queue = open_queue(
        Arc::new(MemoryStore::new()),
        Arc::new(ManualClock::starting_now()),
        executor,
    );
    for id in ["a", "b", "c"] {
        queue
            .enqueue(
                OperationRequest::new("task", OperationType::Update)
                    .entity_id(id)
                    .retry(immediate(1)),
            )
            .unwrap();
    }

    queue.drain().await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    assert!(queue.last_sync().is_some());
}

#[test]
fn test_queue_persists_across_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("store.json");
    let clock = Arc::new(ManualClock::starting_now());
    let calls = Arc::new(AtomicU32::new(0));

    let op = {
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&path).unwrap());
        let queue = open_queue(store, clock.clone(), flaky_executor(0, calls.clone()));
        queue
            .enqueue(
                OperationRequest::new("checklist", OperationType::Create)
                    .payload(json!({"items": [1, 2, 3]})),
            )
            .unwrap()
    };

    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&path).unwrap());
    let raw: serde_json::Value =
        serde_json::from_str(&store.get_item(DEFAULT_QUEUE_KEY).unwrap().unwrap()).unwrap();
    assert!(raw["operations"].is_array());
    assert_eq!(raw["isProcessing"], json!(false));
    assert!(raw.get("lastSync").is_some());

    let queue = open_queue(store, clock, flaky_executor(0, calls));
    let restored = queue.get(&op.id).unwrap();
    assert_eq!(restored.payload, Some(json!({"items": [1, 2, 3]})));
    assert_eq!(restored.retry, op.retry);
    assert_eq!(queue.pending_count(), 1);
}

#[test]
fn test_clear_and_remove() {
    let queue = open_queue(
        Arc::new(MemoryStore::new()),
        Arc::new(ManualClock::starting_now()),
        flaky_executor(0, Arc::new(AtomicU32::new(0))),
    );
    let first = queue
        .enqueue(OperationRequest::new("a", OperationType::Create))
        .unwrap();
    queue
        .enqueue(OperationRequest::new("b", OperationType::Create))
        .unwrap();

    assert_ok!(queue.remove(&first.id));
    assert!(matches!(
        queue.remove(&first.id),
        Err(ResilienceError::OperationNotFound(_))
    ));
    assert_eq!(queue.clear().unwrap(), 1);
    assert!(queue.operations().is_empty());
}

/// Memory store whose writes can be switched off.
#[derive(Default)]
struct SwitchableStore {
    inner: MemoryStore,
    reject_writes: AtomicBool,
}

impl KeyValueStore for SwitchableStore {
    fn get_item(&self, key: &str) -> audit_resilience::Result<Option<String>> {
        self.inner.get_item(key)
    }

    fn set_item(&self, key: &str, value: &str) -> audit_resilience::Result<()> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(ResilienceError::Storage("full".into()));
        }
        self.inner.set_item(key, value)
    }

    fn remove_item(&self, key: &str) -> audit_resilience::Result<()> {
        self.inner.remove_item(key)
    }

    fn key(&self, index: usize) -> audit_resilience::Result<Option<String>> {
        self.inner.key(index)
    }

    fn length(&self) -> audit_resilience::Result<usize> {
        self.inner.length()
    }
}

#[tokio::test]
async fn test_rejected_writes_do_not_strand_operations() {
    let store = Arc::new(SwitchableStore::default());
    let calls = Arc::new(AtomicU32::new(0));
    let executor: Arc<dyn OperationExecutor> = {
        let store = store.clone();
        let calls = calls.clone();
        Arc::new(FnExecutor::new(move |_op| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            // the store fills up while the first operation runs
            store.reject_writes.store(true, Ordering::SeqCst);
            async move {
                if n == 1 {
                    Err(ResilienceError::Network("Failed to fetch".into()))
                } else {
                    Ok(())
                }
            }
            .boxed()
        }))
    };
    let queue = open_queue(
        store.clone(),
        Arc::new(ManualClock::starting_now()),
        executor,
    );
    let first = queue
        .enqueue(OperationRequest::new("task", OperationType::Create).retry(immediate(3)))
        .unwrap();
    let second = queue
        .enqueue(OperationRequest::new("task", OperationType::Update).retry(immediate(3)))
        .unwrap();

    let report = assert_ok!(queue.drain().await);
    assert_eq!((report.succeeded, report.failed), (1, 1));
    assert!(!queue.is_processing());
    assert_eq!(queue.get(&first.id).unwrap().status, OperationStatus::Success);
    let retried = queue.get(&second.id).unwrap();
    assert_eq!(retried.status, OperationStatus::Pending);
    assert_eq!(retried.attempts, 1);

    store.reject_writes.store(false, Ordering::SeqCst);
    let next = queue.drain().await.unwrap();
    assert_eq!((next.attempted, next.succeeded), (1, 1));
    assert_eq!(queue.get(&second.id).unwrap().status, OperationStatus::Success);
}

#[tokio::test]
async fn test_drain_reports_outcomes_to_mode_controller() {
    let mode = Arc::new(OperationModeController::open(
        Arc::new(MemoryStore::new()),
        "operation-mode",
        ModeSettings::default().max_consecutive_failures(2),
    ));
    let executor: Arc<dyn OperationExecutor> = Arc::new(FnExecutor::new(|op: QueuedOperation| {
        let denied = op.entity_id.as_deref() == Some("locked");
        async move {
            if denied {
                Err(ResilienceError::Authorization("read-only token".into()))
            } else {
                Ok(())
            }
        }
        .boxed()
    }));
    let queue = OperationQueue::open_with_clock(
        Arc::new(MemoryStore::new()),
        DEFAULT_QUEUE_KEY,
        mode.clone(),
        executor,
        QueueConfig::default(),
        Arc::new(ManualClock::starting_now()),
    );
    for id in ["locked", "open", "locked"] {
        queue
            .enqueue(
                OperationRequest::new("audit", OperationType::Update)
                    .entity_id(id)
                    .retry(immediate(1)),
            )
            .unwrap();
    }

    queue.drain().await.unwrap();
    let status = mode.status().unwrap();
    // the success in the middle resets the run
    assert_eq!(status.consecutive_failures, 1);
    let last_error = status.last_error.unwrap();
    assert_eq!(last_error.category, ErrorCategory::Authorization);
    assert_eq!(last_error.context.as_deref(), Some("audit"));
    assert!(mode.is_real_mode());
}
