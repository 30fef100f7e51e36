use super::executor::OperationExecutor;
use super::operation::{OperationRequest, OperationStatus, QueuedOperation};
use crate::core::clock::{to_chrono, until};
use crate::core::{Clock, ResilienceError, Result, SystemClock};
use crate::mode::OperationModeController;
use crate::retry::PolicyTable;
use crate::retry::backoff::jitter_rng;
use crate::storage::{DurableDocument, KeyValueStore};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{Level, event, info_span};

pub const DEFAULT_QUEUE_KEY: &str = "operation-queue";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    /// Upper bound on how long the scheduler sleeps between checks.
    pub poll_interval_ms: u64,
    /// How long a successful operation stays visible before removal.
    pub success_grace_ms: u64,
    /// Failed operations older than this are purged by the scheduler.
    /// `None` keeps them until removed by hand.
    pub failed_retention_ms: Option<u64>,
    pub jitter_seed: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            success_grace_ms: 5_000,
            failed_retention_ms: None,
            jitter_seed: None,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn success_grace(mut self, grace: Duration) -> Self {
        self.success_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn failed_retention(mut self, retention: Option<Duration>) -> Self {
        self.failed_retention_ms = retention.map(|r| r.as_millis() as u64);
        self
    }

    pub fn jitter_seed(mut self, seed: Option<u64>) -> Self {
        self.jitter_seed = seed;
        self
    }
}

/// Persisted as `{operations, isProcessing, lastSync}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct QueueState {
    operations: Vec<QueuedOperation>,
    is_processing: bool,
    last_sync: Option<DateTime<Utc>>,
}

impl QueueState {
    fn find_mut(&mut self, id: &str) -> Result<&mut QueuedOperation> {
        self.operations
            .iter_mut()
            .find(|op| op.id == id)
            .ok_or_else(|| ResilienceError::OperationNotFound(id.to_string()))
    }
}

/// Outcome of one [`OperationQueue::drain`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// True when the pass was skipped because the controller is in Demo mode.
    pub held: bool,
}

struct QueueInner {
    doc: DurableDocument<QueueState>,
    executor: Arc<dyn OperationExecutor>,
    mode: Arc<OperationModeController>,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
    policies: RwLock<PolicyTable>,
    config: QueueConfig,
    draining: AtomicBool,
    wakeup: Notify,
}

/// Durable queue of mutations replayed with backoff. Cloning shares the queue.
#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<QueueInner>,
}

/// Clears the drain flag even if the drain future is dropped mid-way.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl OperationQueue {
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        key: impl Into<String>,
        mode: Arc<OperationModeController>,
        executor: Arc<dyn OperationExecutor>,
        config: QueueConfig,
    ) -> Self {
        Self::open_with_clock(store, key, mode, executor, config, Arc::new(SystemClock))
    }

    /// Loads the persisted queue. Operations left `processing` by an
    /// interrupted drain go back to `pending`.
    pub fn open_with_clock(
        store: Arc<dyn KeyValueStore>,
        key: impl Into<String>,
        mode: Arc<OperationModeController>,
        executor: Arc<dyn OperationExecutor>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let doc = DurableDocument::load_or_else(store, key, QueueState::default);
        let recovered = doc.update_selective(|state| {
            let mut recovered = 0;
            for op in state.operations.iter_mut() {
                if op.status == OperationStatus::Processing {
                    op.status = OperationStatus::Pending;
                    recovered += 1;
                }
            }
            let dirty = recovered > 0 || state.is_processing;
            state.is_processing = false;
            Ok((recovered, dirty))
        });
        match recovered {
            Ok(0) => {}
            Ok(recovered) => {
                event!(Level::INFO, recovered, "interrupted operations returned to pending")
            }
            Err(err) => event!(Level::WARN, error = %err, "failed to recover queue state"),
        }

        Self {
            inner: Arc::new(QueueInner {
                doc,
                executor,
                mode,
                clock,
                rng: Mutex::new(jitter_rng(config.jitter_seed)),
                policies: RwLock::new(PolicyTable::new()),
                config,
                draining: AtomicBool::new(false),
                wakeup: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Replaces the table deciding which failures are retried on replay.
    pub fn set_policies(&self, policies: PolicyTable) -> Result<()> {
        *self.inner.policies.write()? = policies;
        Ok(())
    }

    pub fn policies(&self) -> Result<PolicyTable> {
        Ok(self.inner.policies.read()?.clone())
    }

    /// Adds an operation scheduled `delay(1)` from now.
    pub fn enqueue(&self, request: OperationRequest) -> Result<QueuedOperation> {
        let span = info_span!(
            "queue.enqueue",
            entity_type = %request.entity_type,
            operation_type = ?request.operation_type
        );
        let _enter = span.enter();

        let now = self.inner.clock.now();
        let mut op = request.into_operation(now);
        let delay = {
            let mut rng = self.inner.rng.lock()?;
            op.retry.backoff().delay(1, &mut *rng)
        };
        op.next_retry_time = Some(now + to_chrono(delay));

        let stored = op.clone();
        self.inner.doc.update(move |state| {
            state.operations.push(stored);
            Ok(())
        })?;
        event!(Level::DEBUG, id = %op.id, delay_ms = delay.as_millis() as u64, "operation queued");
        self.inner.wakeup.notify_one();
        Ok(op)
    }

    /// Records an outcome for operation `id`.
    ///
    /// A failure increments `attempts`. With attempts left and a retryable
    /// error the operation goes back to `pending`, due `delay(attempts + 1)`
    /// from now; otherwise it stays in `error` until handled by hand.
    /// Success schedules removal after the grace period.
    pub fn update_status(
        &self,
        id: &str,
        status: OperationStatus,
        error: Option<&ResilienceError>,
    ) -> Result<QueuedOperation> {
        let now = self.inner.clock.now();
        let retryable = self.is_retryable(error)?;
        let message = error.map(ToString::to_string);
        let updated = self.inner.doc.update(|state| {
            let op = state.find_mut(id)?;
            self.apply_status(op, status, message, retryable, now)?;
            Ok(op.clone())
        })?;
        self.status_applied(&updated);
        Ok(updated)
    }

    /// Drain-side variant of [`update_status`](Self::update_status): the
    /// outcome is kept in memory even when the store rejects the write, so
    /// no operation is left `processing`.
    fn record_outcome(
        &self,
        id: &str,
        status: OperationStatus,
        error: Option<&ResilienceError>,
    ) -> Result<QueuedOperation> {
        let now = self.inner.clock.now();
        let retryable = self.is_retryable(error)?;
        let message = error.map(ToString::to_string);
        let updated = self.inner.doc.update_best_effort(|state| {
            let op = state.find_mut(id)?;
            self.apply_status(op, status, message, retryable, now)?;
            Ok((op.clone(), true))
        })?;
        self.status_applied(&updated);
        Ok(updated)
    }

    fn is_retryable(&self, error: Option<&ResilienceError>) -> Result<bool> {
        match error {
            Some(err) => Ok(self.inner.policies.read()?.get(err.category()).retryable),
            None => Ok(true),
        }
    }

    fn apply_status(
        &self,
        op: &mut QueuedOperation,
        status: OperationStatus,
        message: Option<String>,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match status {
            OperationStatus::Error => {
                op.attempts = op.attempts.saturating_add(1);
                op.last_attempt = Some(now);
                op.error = message;
                if retryable && op.has_attempts_left() {
                    let delay = {
                        let mut rng = self.inner.rng.lock()?;
                        op.retry.backoff().delay(op.attempts + 1, &mut *rng)
                    };
                    op.status = OperationStatus::Pending;
                    op.next_retry_time = Some(now + to_chrono(delay));
                } else {
                    op.status = OperationStatus::Error;
                    op.next_retry_time = None;
                }
            }
            OperationStatus::Processing => {
                op.status = OperationStatus::Processing;
                op.last_attempt = Some(now);
            }
            OperationStatus::Success => {
                op.status = OperationStatus::Success;
                op.error = None;
                op.next_retry_time = None;
            }
            OperationStatus::Pending => {
                op.status = OperationStatus::Pending;
                op.next_retry_time = Some(now);
            }
        }
        Ok(())
    }

    fn status_applied(&self, updated: &QueuedOperation) {
        match updated.status {
            OperationStatus::Success => self.schedule_removal(&updated.id),
            OperationStatus::Error => event!(
                Level::WARN,
                id = %updated.id,
                attempts = updated.attempts,
                error = updated.error.as_deref().unwrap_or(""),
                "queued operation failed permanently"
            ),
            _ => {}
        }
    }

    fn schedule_removal(&self, id: &str) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            event!(Level::DEBUG, id = %id, "no runtime, successful operation kept");
            return;
        };
        let queue = self.clone();
        let id = id.to_string();
        let grace = Duration::from_millis(self.inner.config.success_grace_ms);
        handle.spawn(async move {
            tokio::time::sleep(grace).await;
            let removed = queue.inner.doc.update_selective(|state| {
                let before = state.operations.len();
                state
                    .operations
                    .retain(|op| !(op.id == id && op.status == OperationStatus::Success));
                let removed = state.operations.len() != before;
                Ok((removed, removed))
            });
            if let Err(err) = removed {
                event!(Level::WARN, id = %id, error = %err, "failed to remove completed operation");
            }
        });
    }

    /// Executes every due `pending` operation, sequentially, in queue order.
    ///
    /// No-op while another drain runs or while in Demo mode.
    pub async fn drain(&self) -> Result<DrainReport> {
        if self.inner.mode.is_demo_mode() {
            event!(Level::DEBUG, "demo mode, queue drain held");
            return Ok(DrainReport {
                held: true,
                ..DrainReport::default()
            });
        }
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(DrainReport::default());
        }
        let _guard = DrainGuard(&self.inner.draining);

        let now = self.inner.clock.now();
        let selected = self.inner.doc.update_selective(|state| {
            let mut selected = Vec::new();
            for op in state.operations.iter_mut().filter(|op| op.is_due_at(now)) {
                op.status = OperationStatus::Processing;
                op.last_attempt = Some(now);
                selected.push(op.clone());
            }
            let persist = !selected.is_empty();
            state.is_processing = persist;
            Ok((selected, persist))
        })?;
        if selected.is_empty() {
            return Ok(DrainReport::default());
        }

        let mut report = DrainReport {
            attempted: selected.len(),
            ..DrainReport::default()
        };
        for op in selected {
            let outcome = self.inner.executor.execute(&op).await;
            let (status, error) = match &outcome {
                Ok(()) => {
                    self.inner.mode.report_success();
                    (OperationStatus::Success, None)
                }
                Err(err) => {
                    self.inner.mode.report_failure(err, Some(&op.entity_type));
                    (OperationStatus::Error, Some(err))
                }
            };
            match self.record_outcome(&op.id, status, error) {
                Ok(_) if outcome.is_ok() => report.succeeded += 1,
                Ok(_) => report.failed += 1,
                // Removed while it was executing.
                Err(ResilienceError::OperationNotFound(_)) => {}
                Err(err) => {
                    event!(Level::WARN, id = %op.id, error = %err, "failed to record operation outcome");
                }
            }
        }

        let finished = self.inner.clock.now();
        self.inner.doc.update_best_effort(|state| {
            state.is_processing = false;
            state.last_sync = Some(finished);
            Ok(((), true))
        })?;
        event!(
            Level::INFO,
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            "queue drained"
        );
        Ok(report)
    }

    /// Resets `id` to `pending` with a fresh attempt budget, due now.
    pub fn reset_for_retry(&self, id: &str) -> Result<QueuedOperation> {
        let now = self.inner.clock.now();
        let op = self.inner.doc.update(|state| {
            let op = state.find_mut(id)?;
            if op.status == OperationStatus::Success {
                return Err(ResilienceError::Validation(format!(
                    "operation '{}' already succeeded",
                    id
                )));
            }
            op.status = OperationStatus::Pending;
            op.attempts = 0;
            op.error = None;
            op.next_retry_time = Some(now);
            Ok(op.clone())
        })?;
        self.inner.wakeup.notify_one();
        Ok(op)
    }

    /// Forces `id` back to `pending` and drains immediately.
    pub async fn retry_now(&self, id: &str) -> Result<DrainReport> {
        self.reset_for_retry(id)?;
        self.drain().await
    }

    pub fn clear(&self) -> Result<usize> {
        let removed = self.inner.doc.update(|state| {
            let removed = state.operations.len();
            state.operations.clear();
            Ok(removed)
        })?;
        event!(Level::INFO, removed, "operation queue cleared");
        Ok(removed)
    }

    pub fn remove(&self, id: &str) -> Result<QueuedOperation> {
        self.inner.doc.update(|state| {
            let index = state
                .operations
                .iter()
                .position(|op| op.id == id)
                .ok_or_else(|| ResilienceError::OperationNotFound(id.to_string()))?;
            Ok(state.operations.remove(index))
        })
    }

    /// Drops failed operations whose last attempt is older than `older_than`.
    pub fn purge_failed(&self, older_than: Duration) -> Result<usize> {
        let cutoff = self.inner.clock.now() - to_chrono(older_than);
        let purged = self.inner.doc.update_selective(|state| {
            let before = state.operations.len();
            state.operations.retain(|op| {
                op.status != OperationStatus::Error
                    || op.last_attempt.unwrap_or(op.created_at) > cutoff
            });
            let purged = before - state.operations.len();
            Ok((purged, purged > 0))
        })?;
        if purged > 0 {
            event!(Level::INFO, purged, "failed operations purged");
        }
        Ok(purged)
    }

    pub fn get(&self, id: &str) -> Option<QueuedOperation> {
        self.inner
            .doc
            .read(|state| state.operations.iter().find(|op| op.id == id).cloned())
            .ok()
            .flatten()
    }

    pub fn operations(&self) -> Vec<QueuedOperation> {
        self.inner
            .doc
            .read(|state| state.operations.clone())
            .unwrap_or_default()
    }

    fn count(&self, status: OperationStatus) -> usize {
        self.inner
            .doc
            .read(|state| state.operations.iter().filter(|op| op.status == status).count())
            .unwrap_or(0)
    }

    pub fn pending_count(&self) -> usize {
        self.count(OperationStatus::Pending)
    }

    pub fn error_count(&self) -> usize {
        self.count(OperationStatus::Error)
    }

    pub fn success_count(&self) -> usize {
        self.count(OperationStatus::Success)
    }

    pub fn is_processing(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.inner.doc.read(|state| state.last_sync).ok().flatten()
    }

    /// Earliest time a pending operation becomes due.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.inner
            .doc
            .read(|state| {
                state
                    .operations
                    .iter()
                    .filter(|op| op.status == OperationStatus::Pending)
                    .map(|op| op.next_retry_time.unwrap_or(op.created_at))
                    .min()
            })
            .ok()
            .flatten()
    }

    /// How long the scheduler may sleep: until the next due operation,
    /// capped by the poll interval.
    pub(crate) fn time_until_next_due(&self) -> Duration {
        let poll = Duration::from_millis(self.inner.config.poll_interval_ms.max(1));
        match self.next_due() {
            Some(at) => until(self.inner.clock.now(), at).min(poll),
            None => poll,
        }
    }

    pub(crate) fn has_due(&self) -> bool {
        self.next_due()
            .map(|at| at <= self.inner.clock.now())
            .unwrap_or(false)
    }

    pub(crate) fn wakeup(&self) -> &Notify {
        &self.inner.wakeup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use crate::queue::{FnExecutor, OperationType, RetryOptions};
    use crate::retry::BackoffStrategy;
    use crate::storage::MemoryStore;
    use futures::FutureExt;

    fn queue_with(
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        result: fn() -> Result<()>,
    ) -> OperationQueue {
        let executor = FnExecutor::new(move |_op| async move { result() }.boxed());
        OperationQueue::open_with_clock(
            store,
            DEFAULT_QUEUE_KEY,
            Arc::new(OperationModeController::in_memory()),
            Arc::new(executor),
            QueueConfig::default().jitter_seed(Some(1)),
            clock,
        )
    }

    fn immediate(entity: &str) -> OperationRequest {
        OperationRequest::new(entity, OperationType::Create)
            .retry(RetryOptions::default().strategy(BackoffStrategy::Immediate))
    }

    #[test]
    fn test_enqueue_schedules_first_attempt() {
        let clock = Arc::new(ManualClock::starting_now());
        let queue = queue_with(Arc::new(MemoryStore::new()), clock.clone(), || Ok(()));
        let op = queue
            .enqueue(
                OperationRequest::new("task", OperationType::Create).retry(
                    RetryOptions::default()
                        .strategy(BackoffStrategy::Fixed)
                        .initial_delay_ms(250)
                        .use_jitter(false),
                ),
            )
            .unwrap();

        assert_eq!(
            op.next_retry_time,
            Some(clock.now() + chrono::Duration::milliseconds(250))
        );
        assert_eq!(queue.pending_count(), 1);
        assert!(!queue.has_due());
    }

    #[test]
    fn test_non_retryable_failure_is_terminal() {
        let clock = Arc::new(ManualClock::starting_now());
        let queue = queue_with(Arc::new(MemoryStore::new()), clock, || Ok(()));
        let op = queue.enqueue(immediate("task")).unwrap();

        let failed = queue
            .update_status(
                &op.id,
                OperationStatus::Error,
                Some(&ResilienceError::Validation("bad payload".into())),
            )
            .unwrap();
        assert_eq!(failed.status, OperationStatus::Error);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.next_retry_time, None);
    }

    #[test]
    fn test_reopen_recovers_processing() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let queue = queue_with(store.clone(), clock.clone(), || Ok(()));
        let op = queue.enqueue(immediate("task")).unwrap();
        queue
            .update_status(&op.id, OperationStatus::Processing, None)
            .unwrap();
        drop(queue);

        let reopened = queue_with(store, clock, || Ok(()));
        assert_eq!(
            reopened.get(&op.id).map(|op| op.status),
            Some(OperationStatus::Pending)
        );
    }

    #[tokio::test]
    async fn test_drain_held_in_demo_mode() {
        let mode = Arc::new(OperationModeController::in_memory());
        mode.enable_demo_mode("offline").unwrap();
        let executor = FnExecutor::new(|_op| async { Ok(()) }.boxed());
        let queue = OperationQueue::open(
            Arc::new(MemoryStore::new()),
            DEFAULT_QUEUE_KEY,
            mode,
            Arc::new(executor),
            QueueConfig::default(),
        );
        queue.enqueue(immediate("task")).unwrap();

        let report = queue.drain().await.unwrap();
        assert!(report.held);
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn test_purge_failed_respects_age() {
        let clock = Arc::new(ManualClock::starting_now());
        let queue = queue_with(Arc::new(MemoryStore::new()), clock.clone(), || Ok(()));
        let op = queue.enqueue(immediate("task")).unwrap();
        queue
            .update_status(
                &op.id,
                OperationStatus::Error,
                Some(&ResilienceError::NotFound("gone".into())),
            )
            .unwrap();

        assert_eq!(queue.purge_failed(Duration::from_secs(60)).unwrap(), 0);
        clock.advance(Duration::from_secs(61));
        assert_eq!(queue.purge_failed(Duration::from_secs(60)).unwrap(), 1);
        assert!(queue.operations().is_empty());
    }
}
