pub mod controller;
pub mod settings;

pub use controller::{
    AUTO_SWITCH_REASON, DEFAULT_MODE_KEY, ForceRealGuard, LastError, ModeStatus, ModeSubscription,
    OperationMode, OperationModeController,
};
pub use settings::ModeSettings;
