use super::backoff::BackoffStrategy;
use crate::core::ErrorCategory;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a failure of a given category is recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryPolicy {
    pub retryable: bool,
    pub max_retries: u32,
    pub strategy: BackoffStrategy,
    pub should_queue_on_exhaustion: bool,
    /// Scales the caller's initial delay.
    pub delay_multiplier: f64,
}

impl RecoveryPolicy {
    const fn retry(
        max_retries: u32,
        strategy: BackoffStrategy,
        should_queue_on_exhaustion: bool,
        delay_multiplier: f64,
    ) -> Self {
        Self {
            retryable: true,
            max_retries,
            strategy,
            should_queue_on_exhaustion,
            delay_multiplier,
        }
    }

    const fn fail_fast() -> Self {
        Self {
            retryable: false,
            max_retries: 0,
            strategy: BackoffStrategy::Immediate,
            should_queue_on_exhaustion: false,
            delay_multiplier: 0.0,
        }
    }

    /// Built-in policy for `category`.
    pub const fn for_category(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::Network => Self::retry(3, BackoffStrategy::Exponential, true, 1.0),
            ErrorCategory::Timeout => Self::retry(2, BackoffStrategy::Linear, true, 1.5),
            ErrorCategory::RateLimit => Self::retry(3, BackoffStrategy::Exponential, true, 2.0),
            ErrorCategory::Server => Self::retry(2, BackoffStrategy::Exponential, true, 1.0),
            ErrorCategory::Conflict => Self::retry(1, BackoffStrategy::Fixed, false, 0.5),
            ErrorCategory::Unknown => Self::retry(1, BackoffStrategy::Fixed, false, 1.0),
            ErrorCategory::Authentication
            | ErrorCategory::Authorization
            | ErrorCategory::Validation
            | ErrorCategory::NotFound
            | ErrorCategory::Parse
            | ErrorCategory::Business => Self::fail_fast(),
        }
    }
}

/// Category → policy lookup. Starts from the built-in table; entries can be overridden.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    overrides: HashMap<ErrorCategory, RecoveryPolicy>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(mut self, category: ErrorCategory, policy: RecoveryPolicy) -> Self {
        self.overrides.insert(category, policy);
        self
    }

    pub fn get(&self, category: ErrorCategory) -> RecoveryPolicy {
        self.overrides
            .get(&category)
            .copied()
            .unwrap_or_else(|| RecoveryPolicy::for_category(category))
    }
}
