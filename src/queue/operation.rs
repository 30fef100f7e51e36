use crate::retry::{BackoffConfig, BackoffStrategy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Processing,
    Success,
    Error,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Processing => "processing",
            OperationStatus::Success => "success",
            OperationStatus::Error => "error",
        }
    }
}

/// Per-operation retry configuration, stored inline with the operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub retry_strategy: BackoffStrategy,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub use_jitter: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        let backoff = BackoffConfig::default();
        Self {
            max_attempts: 3,
            retry_strategy: backoff.strategy,
            initial_delay_ms: backoff.initial_delay_ms,
            backoff_factor: backoff.backoff_factor,
            max_delay_ms: backoff.max_delay_ms,
            use_jitter: backoff.use_jitter,
        }
    }
}

impl RetryOptions {
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.retry_strategy = strategy;
        self
    }

    pub fn initial_delay_ms(mut self, ms: u64) -> Self {
        self.initial_delay_ms = ms;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn max_delay_ms(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    pub fn use_jitter(mut self, enabled: bool) -> Self {
        self.use_jitter = enabled;
        self
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            strategy: self.retry_strategy,
            initial_delay_ms: self.initial_delay_ms,
            backoff_factor: self.backoff_factor,
            max_delay_ms: self.max_delay_ms,
            use_jitter: self.use_jitter,
        }
    }
}

impl From<BackoffConfig> for RetryOptions {
    fn from(backoff: BackoffConfig) -> Self {
        Self {
            retry_strategy: backoff.strategy,
            initial_delay_ms: backoff.initial_delay_ms,
            backoff_factor: backoff.backoff_factor,
            max_delay_ms: backoff.max_delay_ms,
            use_jitter: backoff.use_jitter,
            ..Self::default()
        }
    }
}

/// A mutation waiting to be replayed against the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: String,
    pub entity_type: String,
    pub operation_type: OperationType,
    pub entity_id: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub status: OperationStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_attempt: Option<DateTime<Utc>>,
    pub attempts: u32,
    #[serde(flatten)]
    pub retry: RetryOptions,
    pub next_retry_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl QueuedOperation {
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.status == OperationStatus::Pending
            && self.next_retry_time.map(|at| at <= now).unwrap_or(true)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.retry.max_attempts
    }
}

/// Arguments of [`OperationQueue::enqueue`](super::OperationQueue::enqueue).
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub entity_type: String,
    pub operation_type: OperationType,
    pub entity_id: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub retry: RetryOptions,
}

impl OperationRequest {
    pub fn new(entity_type: impl Into<String>, operation_type: OperationType) -> Self {
        Self {
            entity_type: entity_type.into(),
            operation_type,
            entity_id: None,
            payload: None,
            retry: RetryOptions::default(),
        }
    }

    pub fn entity_id(mut self, id: impl Into<String>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub(crate) fn into_operation(self, now: DateTime<Utc>) -> QueuedOperation {
        QueuedOperation {
            id: Uuid::new_v4().to_string(),
            entity_type: self.entity_type,
            operation_type: self.operation_type,
            entity_id: self.entity_id,
            payload: self.payload,
            status: OperationStatus::Pending,
            created_at: now,
            last_attempt: None,
            attempts: 0,
            retry: self.retry,
            next_retry_time: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let op = OperationRequest::new("project", OperationType::Update)
            .entity_id("p1")
            .payload(json!({"name": "X"}))
            .retry(RetryOptions::default().max_attempts(2).strategy(BackoffStrategy::Fixed))
            .into_operation(Utc::now());

        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["entityType"], "project");
        assert_eq!(value["operationType"], "update");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["maxAttempts"], 2);
        assert_eq!(value["retryStrategy"], "fixed");
        assert!(value["createdAt"].is_i64());
        assert!(value["nextRetryTime"].is_null());

        let back: QueuedOperation = serde_json::from_value(value).unwrap();
        assert_eq!(back.retry, op.retry);
        assert_eq!(back.created_at.timestamp_millis(), op.created_at.timestamp_millis());
    }

    #[test]
    fn test_due_only_when_pending_and_elapsed() {
        let now = Utc::now();
        let mut op = OperationRequest::new("task", OperationType::Create).into_operation(now);
        assert!(op.is_due_at(now));

        op.next_retry_time = Some(now + chrono::Duration::milliseconds(100));
        assert!(!op.is_due_at(now));
        assert!(op.is_due_at(now + chrono::Duration::milliseconds(100)));

        op.status = OperationStatus::Error;
        assert!(!op.is_due_at(now + chrono::Duration::seconds(1)));
    }
}
