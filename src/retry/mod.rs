pub mod backoff;
pub mod categorize;
pub mod orchestrator;
pub mod policy;

pub use backoff::{BackoffConfig, BackoffStrategy, JITTER_RANGE};
pub use categorize::{categorize_error, categorize_message};
pub use orchestrator::{RetryDefaults, RetryOrchestrator, RetryRequest};
pub use policy::{PolicyTable, RecoveryPolicy};
