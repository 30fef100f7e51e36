use super::settings::ModeSettings;
use crate::core::{Clock, ErrorCategory, ResilienceError, Result, SystemClock};
use crate::retry::backoff::jitter_rng;
use crate::retry::categorize::categorize_error;
use crate::storage::{DurableDocument, KeyValueStore};
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{Level, event, info_span};

pub const DEFAULT_MODE_KEY: &str = "operation-mode";
pub const AUTO_SWITCH_REASON: &str = "repeated failures";

/// Whether the application talks to the real backend or to simulated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    Real,
    Demo,
}

impl OperationMode {
    pub fn is_demo(&self) -> bool {
        matches!(self, OperationMode::Demo)
    }

    pub fn is_real(&self) -> bool {
        matches!(self, OperationMode::Real)
    }

    pub fn toggled(&self) -> Self {
        match self {
            OperationMode::Real => OperationMode::Demo,
            OperationMode::Demo => OperationMode::Real,
        }
    }
}

/// Most recent failure reported to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub message: String,
    pub name: String,
    pub category: ErrorCategory,
    pub context: Option<String>,
    pub at: DateTime<Utc>,
}

/// Persisted as `{isDemoMode, settings}`; the failure bookkeeping is process-local.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModeState {
    is_demo_mode: bool,
    #[serde(default)]
    settings: ModeSettings,
    #[serde(skip)]
    consecutive_failures: u32,
    #[serde(skip)]
    last_error: Option<LastError>,
    #[serde(skip)]
    switch_reason: Option<String>,
}

impl ModeState {
    fn fresh(settings: ModeSettings) -> Self {
        Self {
            is_demo_mode: false,
            settings,
            consecutive_failures: 0,
            last_error: None,
            switch_reason: None,
        }
    }

    fn mode(&self) -> OperationMode {
        if self.is_demo_mode {
            OperationMode::Demo
        } else {
            OperationMode::Real
        }
    }
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeStatus {
    pub mode: OperationMode,
    pub consecutive_failures: u32,
    pub last_error: Option<LastError>,
    pub switch_reason: Option<String>,
    pub settings: ModeSettings,
}

impl ModeStatus {
    pub fn is_demo_mode(&self) -> bool {
        self.mode.is_demo()
    }

    pub fn is_real_mode(&self) -> bool {
        self.mode.is_real()
    }
}

type ModeListener = Arc<dyn Fn(OperationMode) + Send + Sync>;

#[derive(Default)]
struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, ModeListener)>>,
}

impl ListenerRegistry {
    fn add(&self, listener: ModeListener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.push((id, listener));
        id
    }

    fn remove(&self, id: u64) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|(listener_id, _)| *listener_id != id);
    }

    fn len(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or_default()
    }

    /// Calls every listener in subscription order. The list is copied first so
    /// listeners may subscribe, unsubscribe or switch modes re-entrantly.
    fn notify(&self, mode: OperationMode) {
        let listeners: Vec<ModeListener> = {
            let guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            guard.iter().map(|(_, listener)| listener.clone()).collect()
        };
        for listener in listeners {
            listener(mode);
        }
    }
}

/// Handle returned by [`OperationModeController::on_mode_change`].
#[must_use = "dropping the subscription unsubscribes the listener"]
pub struct ModeSubscription {
    registry: Weak<ListenerRegistry>,
    id: u64,
}

impl ModeSubscription {
    /// Removes the listener now rather than when the handle goes out of scope.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for ModeSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

/// Two-state (Real/Demo) controller with failure counting and auto-switch.
///
/// One instance is shared (behind an `Arc`) by the cache engine, the
/// operation queue and the retry orchestrator.
pub struct OperationModeController {
    doc: DurableDocument<ModeState>,
    defaults: ModeSettings,
    listeners: Arc<ListenerRegistry>,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
}

impl OperationModeController {
    /// Restores the controller from `store`, or starts in Real mode with
    /// `defaults` when nothing (valid) is stored or persistence is disabled.
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        key: impl Into<String>,
        defaults: ModeSettings,
    ) -> Self {
        let key = key.into();
        let doc = if defaults.persistent_mode_storage {
            let fallback = defaults.clone();
            DurableDocument::load_or_else(store, key, move || ModeState::fresh(fallback))
        } else {
            DurableDocument::with_state(store, key, ModeState::fresh(defaults.clone()))
        };

        let stored_settings_valid = doc
            .read(|state| state.settings.validate().is_ok())
            .unwrap_or(false);
        if !stored_settings_valid {
            event!(Level::WARN, "stored mode settings invalid, using defaults");
            let fallback = defaults.clone();
            let _ = doc.update_selective(move |state| {
                state.settings = fallback;
                Ok(((), false))
            });
        }

        Self {
            doc,
            defaults,
            listeners: Arc::new(ListenerRegistry::default()),
            clock: Arc::new(SystemClock),
            rng: Mutex::new(jitter_rng(None)),
        }
    }

    /// In-memory controller with default settings and no persistence.
    pub fn in_memory() -> Self {
        Self::open(
            Arc::new(crate::storage::MemoryStore::new()),
            DEFAULT_MODE_KEY,
            ModeSettings::default().persistent_mode_storage(false),
        )
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Seeds the generator behind simulated failures.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(jitter_rng(Some(seed)));
        self
    }

    pub fn mode(&self) -> OperationMode {
        self.doc
            .read(ModeState::mode)
            .unwrap_or(OperationMode::Real)
    }

    pub fn is_demo_mode(&self) -> bool {
        self.mode().is_demo()
    }

    pub fn is_real_mode(&self) -> bool {
        self.mode().is_real()
    }

    pub fn settings(&self) -> ModeSettings {
        self.doc
            .read(|state| state.settings.clone())
            .unwrap_or_else(|_| self.defaults.clone())
    }

    pub fn status(&self) -> Result<ModeStatus> {
        self.doc.read(|state| ModeStatus {
            mode: state.mode(),
            consecutive_failures: state.consecutive_failures,
            last_error: state.last_error.clone(),
            switch_reason: state.switch_reason.clone(),
            settings: state.settings.clone(),
        })
    }

    pub fn enable_real_mode(&self) -> Result<()> {
        let span = info_span!("mode.enable_real");
        let _enter = span.enter();
        self.transition(|state| {
            state.is_demo_mode = false;
            state.consecutive_failures = 0;
            state.last_error = None;
        })
        .map(|_| ())
    }

    pub fn enable_demo_mode(&self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        let span = info_span!("mode.enable_demo", reason = %reason);
        let _enter = span.enter();
        self.transition(|state| {
            state.is_demo_mode = true;
            state.switch_reason = Some(reason);
        })
        .map(|_| ())
    }

    /// Flips the current mode and returns the new one.
    pub fn toggle(&self) -> Result<OperationMode> {
        match self.mode() {
            OperationMode::Real => self.enable_demo_mode("manual toggle")?,
            OperationMode::Demo => self.enable_real_mode()?,
        }
        Ok(self.mode())
    }

    /// Switches to Real mode for the lifetime of the returned guard.
    ///
    /// The prior mode comes back when the guard is dropped or
    /// [`ForceRealGuard::restore`] is called. Guards nest; each restores the
    /// mode it observed.
    pub fn temporarily_force_real(&self) -> Result<ForceRealGuard<'_>> {
        let (previous, previous_reason) = self
            .doc
            .read(|state| (state.mode(), state.switch_reason.clone()))?;
        if previous.is_demo() {
            self.transition(|state| state.is_demo_mode = false)?;
        }
        event!(Level::DEBUG, ?previous, "forced real mode");
        Ok(ForceRealGuard {
            controller: self,
            previous,
            previous_reason,
            restored: false,
        })
    }

    /// Records a failure; returns `true` when it triggered an automatic switch to Demo.
    pub fn report_failure(
        &self,
        error: &(dyn std::error::Error + 'static),
        context: Option<&str>,
    ) -> bool {
        let category = categorize_error(error, context);
        let name = error
            .downcast_ref::<ResilienceError>()
            .map(ResilienceError::kind_name)
            .unwrap_or("Error");
        let last_error = LastError {
            message: error.to_string(),
            name: name.to_string(),
            category,
            context: context.map(str::to_string),
            at: self.clock.now(),
        };

        let outcome = self.transition(|state| {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.last_error = Some(last_error);
            if state.settings.auto_switch_on_failure
                && !state.is_demo_mode
                && state.consecutive_failures >= state.settings.max_consecutive_failures
            {
                state.is_demo_mode = true;
                state.switch_reason = Some(AUTO_SWITCH_REASON.to_string());
            }
        });

        match outcome {
            Ok(Some(OperationMode::Demo)) => {
                event!(
                    Level::WARN,
                    category = %category,
                    context = context.unwrap_or(""),
                    "switched to demo mode after repeated failures"
                );
                true
            }
            Ok(_) => false,
            Err(err) => {
                event!(Level::WARN, error = %err, "failed to record failure");
                false
            }
        }
    }

    pub fn report_success(&self) {
        if let Err(err) = self.transition(|state| state.consecutive_failures = 0) {
            event!(Level::WARN, error = %err, "failed to record success");
        }
    }

    /// Restores the default settings; the current mode is kept.
    pub fn reset(&self) -> Result<()> {
        self.update_settings(self.defaults.clone())
    }

    /// Replaces the settings after validating them.
    pub fn update_settings(&self, settings: ModeSettings) -> Result<()> {
        settings.validate()?;
        let persist = settings.persistent_mode_storage;
        self.doc.update_selective(|state| {
            state.settings = settings;
            Ok(((), persist))
        })?;
        if !persist {
            self.doc.forget()?;
        }
        event!(Level::DEBUG, persist, "mode settings updated");
        Ok(())
    }

    /// Registers `listener` for mode changes. Listeners run synchronously,
    /// in subscription order, right after each change.
    pub fn on_mode_change<F>(&self, listener: F) -> ModeSubscription
    where
        F: Fn(OperationMode) + Send + Sync + 'static,
    {
        let id = self.listeners.add(Arc::new(listener));
        ModeSubscription {
            registry: Arc::downgrade(&self.listeners),
            id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }

    /// Waits the simulated network delay, then fails with the configured
    /// probability. Used when serving simulated data in Demo mode.
    pub async fn simulate_network(&self) -> Result<()> {
        let settings = self.settings();
        if settings.simulated_network_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(settings.simulated_network_delay_ms)).await;
        }
        let roll: u8 = {
            let mut rng = self.rng.lock()?;
            rng.gen_range(0..100)
        };
        if roll < settings.simulated_error_rate_percent {
            return Err(ResilienceError::Network(
                "simulated network failure".to_string(),
            ));
        }
        Ok(())
    }

    /// Applies `f`; persists and notifies only when the mode actually changed.
    /// The change holds in memory even when the store rejects the write.
    fn transition(&self, f: impl FnOnce(&mut ModeState)) -> Result<Option<OperationMode>> {
        let changed = self.doc.update_best_effort(|state| {
            let before = state.mode();
            f(state);
            let after = state.mode();
            let changed = (before != after).then_some(after);
            let persist = changed.is_some() && state.settings.persistent_mode_storage;
            Ok((changed, persist))
        })?;

        if let Some(mode) = changed {
            event!(Level::INFO, ?mode, "operation mode changed");
            self.listeners.notify(mode);
        }
        Ok(changed)
    }
}

/// Keeps Real mode forced until dropped.
#[must_use = "the prior mode is restored as soon as the guard is dropped"]
pub struct ForceRealGuard<'a> {
    controller: &'a OperationModeController,
    previous: OperationMode,
    previous_reason: Option<String>,
    restored: bool,
}

impl ForceRealGuard<'_> {
    pub fn previous_mode(&self) -> OperationMode {
        self.previous
    }

    pub fn restore(mut self) -> Result<()> {
        self.restore_inner()
    }

    fn restore_inner(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        if self.previous.is_demo() {
            let reason = self.previous_reason.take();
            self.controller.transition(|state| {
                state.is_demo_mode = true;
                state.switch_reason = reason;
            })?;
        }
        Ok(())
    }
}

impl Drop for ForceRealGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.restore_inner() {
            event!(Level::WARN, error = %err, "failed to restore mode after forced real operation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::storage::document::read_json;
    use std::sync::atomic::AtomicUsize;

    fn controller(settings: ModeSettings) -> (Arc<MemoryStore>, OperationModeController) {
        let store = Arc::new(MemoryStore::new());
        let controller = OperationModeController::open(store.clone(), DEFAULT_MODE_KEY, settings);
        (store, controller)
    }

    #[test]
    fn test_starts_real_with_defaults() {
        let (_, controller) = controller(ModeSettings::default());
        let status = controller.status().unwrap();
        assert!(status.is_real_mode());
        assert!(!status.is_demo_mode());
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.switch_reason, None);
    }

    #[test]
    fn test_transitions_are_persisted() {
        let (store, controller) = controller(ModeSettings::default());
        controller.enable_demo_mode("offline audit").unwrap();

        let raw: serde_json::Value = read_json(store.as_ref(), DEFAULT_MODE_KEY).unwrap().unwrap();
        assert_eq!(raw["isDemoMode"], serde_json::json!(true));
        assert_eq!(raw["settings"]["maxConsecutiveFailures"], serde_json::json!(3));
        assert!(raw.get("consecutiveFailures").is_none());

        let reopened =
            OperationModeController::open(store, DEFAULT_MODE_KEY, ModeSettings::default());
        assert!(reopened.is_demo_mode());
    }

    #[test]
    fn test_garbage_in_store_falls_back_to_defaults() {
        let store = Arc::new(MemoryStore::new());
        store.set_item(DEFAULT_MODE_KEY, "][").unwrap();
        let controller =
            OperationModeController::open(store, DEFAULT_MODE_KEY, ModeSettings::default());
        assert!(controller.is_real_mode());
        assert_eq!(controller.settings(), ModeSettings::default());
    }

    #[test]
    fn test_persistence_disabled_never_writes() {
        let (store, controller) =
            controller(ModeSettings::default().persistent_mode_storage(false));
        controller.enable_demo_mode("x").unwrap();
        assert_eq!(store.get_item(DEFAULT_MODE_KEY).unwrap(), None);
    }

    #[test]
    fn test_listener_sees_only_real_changes() {
        let (_, controller) = controller(ModeSettings::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let _subscription = controller.on_mode_change(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        controller.enable_real_mode().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        controller.toggle().unwrap();
        controller.toggle().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_may_reenter_controller() {
        let (_, controller) = controller(ModeSettings::default());
        let controller = Arc::new(controller);
        let weak = Arc::downgrade(&controller);
        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = observed.clone();
        let _subscription = controller.on_mode_change(move |mode| {
            if let Some(controller) = weak.upgrade() {
                sink.lock().unwrap().push((mode, controller.is_demo_mode()));
            }
        });

        controller.enable_demo_mode("test").unwrap();
        assert_eq!(*observed.lock().unwrap(), vec![(OperationMode::Demo, true)]);
    }

    #[tokio::test]
    async fn test_simulated_failures_follow_error_rate() {
        let (_, controller) = controller(
            ModeSettings::default()
                .simulated_network_delay_ms(0)
                .simulated_error_rate_percent(100),
        );
        let err = controller.simulate_network().await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Network);

        controller
            .update_settings(controller.settings().simulated_error_rate_percent(0))
            .unwrap();
        controller.simulate_network().await.unwrap();
    }
}
