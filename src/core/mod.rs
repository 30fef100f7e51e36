pub mod category;
pub mod clock;
pub mod error;

pub use category::{ErrorCategory, ErrorReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ResilienceError, Result, category_for_status};
