pub mod engine;
pub mod entry;
pub mod sweeper;

pub use engine::{CacheConfig, CacheEngine, CacheStats, FetchOptions};
pub use entry::CacheEntry;
pub use sweeper::spawn_cache_sweeper;
