pub mod executor;
pub mod operation;
#[allow(clippy::module_inception)]
pub mod queue;
pub mod scheduler;

pub use executor::{FnExecutor, OperationExecutor};
pub use operation::{OperationRequest, OperationStatus, OperationType, QueuedOperation, RetryOptions};
pub use queue::{DEFAULT_QUEUE_KEY, DrainReport, OperationQueue, QueueConfig};
pub use scheduler::spawn_queue_scheduler;
