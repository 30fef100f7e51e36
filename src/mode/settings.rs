use crate::core::{ResilienceError, Result};
use serde::{Deserialize, Serialize};

/// Tunables of the operation-mode controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModeSettings {
    /// Switch Real → Demo after `max_consecutive_failures` failures in a row.
    pub auto_switch_on_failure: bool,
    pub max_consecutive_failures: u32,
    /// Persist mode and settings to the durable store.
    pub persistent_mode_storage: bool,
    /// How long the UI shows mode-change notifications.
    pub notification_duration_ms: u64,
    /// Artificial latency of simulated (demo) responses.
    pub simulated_network_delay_ms: u64,
    /// Chance, in percent, that a simulated response fails.
    pub simulated_error_rate_percent: u8,
}

impl Default for ModeSettings {
    fn default() -> Self {
        Self {
            auto_switch_on_failure: true,
            max_consecutive_failures: 3,
            persistent_mode_storage: true,
            notification_duration_ms: 5_000,
            simulated_network_delay_ms: 300,
            simulated_error_rate_percent: 0,
        }
    }
}

impl ModeSettings {
    pub fn validate(&self) -> Result<()> {
        if self.simulated_error_rate_percent > 100 {
            return Err(ResilienceError::Validation(format!(
                "simulatedErrorRatePercent must be within 0..=100, got {}",
                self.simulated_error_rate_percent
            )));
        }
        if self.max_consecutive_failures == 0 {
            return Err(ResilienceError::Validation(
                "maxConsecutiveFailures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn auto_switch_on_failure(mut self, enabled: bool) -> Self {
        self.auto_switch_on_failure = enabled;
        self
    }

    pub fn max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    pub fn persistent_mode_storage(mut self, enabled: bool) -> Self {
        self.persistent_mode_storage = enabled;
        self
    }

    pub fn notification_duration_ms(mut self, ms: u64) -> Self {
        self.notification_duration_ms = ms;
        self
    }

    pub fn simulated_network_delay_ms(mut self, ms: u64) -> Self {
        self.simulated_network_delay_ms = ms;
        self
    }

    pub fn simulated_error_rate_percent(mut self, percent: u8) -> Self {
        self.simulated_error_rate_percent = percent;
        self
    }
}
