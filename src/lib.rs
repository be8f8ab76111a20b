//! Retry Cache - a category-scoped TTL cache for upstream travel APIs
//!
//! Caches search and lookup results per category, retries failing fetches
//! with exponential backoff and falls back to stale data when the upstream
//! stays down. Entries can be mirrored to a durable store so they survive a
//! restart.

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod models;

pub use api::AppState;
pub use cache::{
    CacheEntry, CacheStats, CategoryConfig, DurableStore, FileDurableStore, InMemoryDurableStore,
    RetryOverrides, RetryPolicy, RetryableCache, RetryableCacheBuilder, SetOptions,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{CacheError, Result, UpstreamError};
