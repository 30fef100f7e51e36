use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::time::Duration;

/// Multiplicative jitter window applied after clamping.
pub const JITTER_RANGE: RangeInclusive<f64> = 0.7..=1.3;

/// Shape of the wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Immediate,
    Fixed,
    Linear,
    #[default]
    Exponential,
}

/// Parameters of the delay function shared by the queue and the retry orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    pub strategy: BackoffStrategy,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub use_jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            initial_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            use_jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Unclamped, unjittered delay before `attempt` (1-based).
    pub fn base_delay_ms(&self, attempt: u32) -> f64 {
        let attempt = attempt.max(1);
        let initial = self.initial_delay_ms as f64;
        match self.strategy {
            BackoffStrategy::Immediate => 0.0,
            BackoffStrategy::Fixed => initial,
            BackoffStrategy::Linear => initial * attempt as f64,
            BackoffStrategy::Exponential => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                initial * self.backoff_factor.powi(exponent)
            }
        }
    }

    /// Delay before `attempt`: base, then clamp to `max_delay_ms`, then jitter.
    ///
    /// The order is fixed so a seeded `rng` reproduces the same sequence.
    pub fn delay_ms<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> u64 {
        let clamped = self.base_delay_ms(attempt).min(self.max_delay_ms as f64);
        let clamped = if clamped.is_finite() { clamped.max(0.0) } else { 0.0 };
        if self.use_jitter {
            (clamped * rng.gen_range(JITTER_RANGE)).floor() as u64
        } else {
            clamped.floor() as u64
        }
    }

    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        Duration::from_millis(self.delay_ms(attempt, rng))
    }
}

pub(crate) fn jitter_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}
