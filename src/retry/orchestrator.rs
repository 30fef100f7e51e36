use super::backoff::{BackoffConfig, BackoffStrategy, jitter_rng};
use super::categorize::categorize_error;
use super::policy::{PolicyTable, RecoveryPolicy};
use crate::core::{ResilienceError, Result};
use crate::mode::OperationModeController;
use crate::queue::{OperationQueue, OperationRequest};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{Instrument, Level, event, info_span};

/// Retry parameters used when a request does not override them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryDefaults {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub use_jitter: bool,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            use_jitter: true,
        }
    }
}

/// Per-call options of [`RetryOrchestrator::execute_with_retry`].
#[derive(Debug, Clone, Default)]
pub struct RetryRequest {
    max_retries: Option<u32>,
    initial_delay: Option<Duration>,
    strategy: Option<BackoffStrategy>,
    backoff_factor: Option<f64>,
    max_delay: Option<Duration>,
    use_jitter: Option<bool>,
    context: Option<String>,
    queue_on_failure: Option<OperationRequest>,
}

impl RetryRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upper bound on retries; the category's policy may lower it further.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Overrides the strategy of the failure category's policy.
    pub fn strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = Some(factor);
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    pub fn use_jitter(mut self, enabled: bool) -> Self {
        self.use_jitter = Some(enabled);
        self
    }

    /// Free-form description of the call, used for logging and as a
    /// categorization hint.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Operation to enqueue when retries run out and the policy allows queueing.
    pub fn queue_on_failure(mut self, request: OperationRequest) -> Self {
        self.queue_on_failure = Some(request);
        self
    }
}

/// Runs operations with category-aware retries and reports outcomes to the
/// mode controller.
pub struct RetryOrchestrator {
    mode: Arc<OperationModeController>,
    queue: Option<OperationQueue>,
    policies: PolicyTable,
    defaults: RetryDefaults,
    rng: Mutex<StdRng>,
}

impl RetryOrchestrator {
    pub fn new(mode: Arc<OperationModeController>, defaults: RetryDefaults) -> Self {
        Self {
            mode,
            queue: None,
            policies: PolicyTable::new(),
            defaults,
            rng: Mutex::new(jitter_rng(None)),
        }
    }

    /// Queue that receives operations whose retries ran out. The queue
    /// replays them under this orchestrator's policy table.
    pub fn with_queue(mut self, queue: OperationQueue) -> Self {
        self.share_policies(&queue);
        self.queue = Some(queue);
        self
    }

    pub fn with_policies(mut self, policies: PolicyTable) -> Self {
        self.policies = policies;
        if let Some(queue) = &self.queue {
            self.share_policies(queue);
        }
        self
    }

    fn share_policies(&self, queue: &OperationQueue) {
        if let Err(err) = queue.set_policies(self.policies.clone()) {
            event!(Level::WARN, error = %err, "failed to share retry policies with queue");
        }
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(jitter_rng(Some(seed)));
        self
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Calls `operation` until it succeeds or the failure's policy says stop.
    ///
    /// Errors of non-retryable categories are reported to the mode controller
    /// and returned unchanged. Retryable errors that run out of attempts come
    /// back as [`ResilienceError::Exhausted`], carrying the queued operation id
    /// when `queue_on_failure` was set and the policy allows queueing.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        mut operation: F,
        request: RetryRequest,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let span = info_span!(
            "retry.execute",
            context = request.context.as_deref().unwrap_or("")
        );

        async move {
            let mut attempt: u32 = 1;
            loop {
                let err = match operation().await {
                    Ok(value) => {
                        self.mode.report_success();
                        return Ok(value);
                    }
                    Err(err) => err,
                };

                let category = categorize_error(&err, request.context.as_deref());
                let policy = self.policies.get(category);
                let max_retries = request
                    .max_retries
                    .unwrap_or(self.defaults.max_retries)
                    .min(policy.max_retries);

                if !policy.retryable {
                    event!(Level::DEBUG, category = %category, error = %err, "non-retryable failure");
                    self.mode.report_failure(&err, request.context.as_deref());
                    return Err(err);
                }

                if attempt <= max_retries {
                    let mut delay = self.retry_delay(&request, &policy, attempt)?;
                    if let ResilienceError::RateLimited {
                        retry_after: Some(retry_after),
                        ..
                    } = &err
                    {
                        delay = delay.max(*retry_after);
                    }
                    event!(
                        Level::DEBUG,
                        category = %category,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }

                self.mode.report_failure(&err, request.context.as_deref());
                let queued_operation_id = if policy.should_queue_on_exhaustion {
                    self.queue_for_later(request.queue_on_failure.clone())
                } else {
                    None
                };
                event!(
                    Level::WARN,
                    category = %category,
                    attempts = attempt,
                    queued = queued_operation_id.is_some(),
                    error = %err,
                    "retries exhausted"
                );
                return Err(ResilienceError::Exhausted {
                    attempts: attempt,
                    queued_operation_id,
                    source: Box::new(err),
                });
            }
        }
        .instrument(span)
        .await
    }

    /// Wait before retry number `attempt` (1-based).
    fn retry_delay(
        &self,
        request: &RetryRequest,
        policy: &RecoveryPolicy,
        attempt: u32,
    ) -> Result<Duration> {
        let initial_ms = request
            .initial_delay
            .map(|delay| delay.as_millis() as u64)
            .unwrap_or(self.defaults.initial_delay_ms);
        let backoff = BackoffConfig {
            strategy: request.strategy.unwrap_or(policy.strategy),
            initial_delay_ms: (initial_ms as f64 * policy.delay_multiplier).max(0.0) as u64,
            backoff_factor: request.backoff_factor.unwrap_or(self.defaults.backoff_factor),
            max_delay_ms: request
                .max_delay
                .map(|delay| delay.as_millis() as u64)
                .unwrap_or(self.defaults.max_delay_ms),
            use_jitter: request.use_jitter.unwrap_or(self.defaults.use_jitter),
        };
        let mut rng = self.rng.lock()?;
        Ok(backoff.delay(attempt, &mut *rng))
    }

    fn queue_for_later(&self, request: Option<OperationRequest>) -> Option<String> {
        let (queue, request) = match (&self.queue, request) {
            (Some(queue), Some(request)) => (queue, request),
            _ => return None,
        };
        match queue.enqueue(request) {
            Ok(op) => Some(op.id),
            Err(err) => {
                event!(Level::WARN, error = %err, "failed to queue exhausted operation");
                None
            }
        }
    }
}
