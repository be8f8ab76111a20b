//! Cache Module
//!
//! Category-scoped TTL caching over a memory tier and an optional durable
//! tier, with retrying upstream fetches and stale fallback.

pub mod category;
mod durable;
mod entry;
mod retry;
mod retryable;
mod single_flight;
mod stats;
mod store;


// Re-export public types
pub use category::CategoryConfig;
pub use durable::{escape_key, unescape_key, DurableStore, FileDurableStore, InMemoryDurableStore};
pub use entry::{CacheEntry, SOURCE_API, SOURCE_MANUAL};
pub use retry::{
    RetryOverrides, RetryPolicy, DEFAULT_BACKOFF_FACTOR, DEFAULT_MAX_DELAY, MAX_JITTER_MS,
};
pub use retryable::{RetryableCache, RetryableCacheBuilder, SetOptions, DEFAULT_NAMESPACE};
pub use single_flight::SingleFlight;
pub use stats::CacheStats;
pub use store::MemoryStore;

// == Public Constants ==
/// Maximum allowed key length in bytes
pub const MAX_KEY_LENGTH: usize = 256;
