//! Category Module
//!
//! Named partitions of the cache, each with its own TTL, retry policy and
//! capacity.

use std::collections::HashMap;
use std::time::Duration;

use crate::cache::retry::{RetryPolicy, DEFAULT_BACKOFF_FACTOR, DEFAULT_MAX_DELAY};
use crate::error::{CacheError, Result};

pub const FLIGHT_SEARCH: &str = "flight-search";
pub const HOTEL_SEARCH: &str = "hotel-search";
pub const ACTIVITY_SEARCH: &str = "activity-search";
pub const TRANSFER_SEARCH: &str = "transfer-search";
pub const LOCATION_LOOKUP: &str = "location-lookup";
pub const PRICING: &str = "pricing";
pub const DEFAULT_CATEGORY: &str = "default";

// == Category Config ==
/// Expiration, retry and capacity policy for one category.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryConfig {
    /// Lifetime of entries written without a custom TTL
    pub ttl: Duration,
    /// Retries after the first failed fetch
    pub max_retries: u32,
    /// Delay after the first failed fetch
    pub retry_base_delay: Duration,
    /// Entries kept in memory before FIFO eviction kicks in
    pub max_entries: usize,
    /// Whether entries are mirrored to the durable store
    pub persist_to_durable_store: bool,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for CategoryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            max_entries: 100,
            persist_to_durable_store: false,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: false,
        }
    }
}

impl CategoryConfig {
    /// Shorthand for the four settings every category picks explicitly.
    pub fn new(
        ttl: Duration,
        max_retries: u32,
        retry_base_delay: Duration,
        max_entries: usize,
    ) -> Self {
        Self {
            ttl,
            max_retries,
            retry_base_delay,
            max_entries,
            ..Self::default()
        }
    }

    pub fn persisted(mut self) -> Self {
        self.persist_to_durable_store = true;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    // == Validate ==
    /// Rejects configurations the cache cannot honour.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.max_entries == 0 {
            return Err(CacheError::InvalidCategory(format!(
                "category '{}' must allow at least one entry",
                name
            )));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(CacheError::InvalidCategory(format!(
                "category '{}' has backoff factor {} (must be >= 1.0)",
                name, self.backoff_factor
            )));
        }
        Ok(())
    }

    /// Retry policy derived from this category.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.retry_base_delay,
            backoff_factor: self.backoff_factor,
            max_delay: self.max_delay,
            jitter: self.jitter,
        }
    }

    // == Travel Defaults ==
    /// Built-in categories for travel-provider searches.
    pub fn travel_defaults() -> HashMap<String, CategoryConfig> {
        let secs = Duration::from_secs;
        let millis = Duration::from_millis;

        [
            (FLIGHT_SEARCH, Self::new(secs(5 * 60), 3, secs(1), 100).persisted()),
            (HOTEL_SEARCH, Self::new(secs(10 * 60), 3, secs(1), 200).persisted()),
            (ACTIVITY_SEARCH, Self::new(secs(30 * 60), 2, secs(1), 200).persisted()),
            (TRANSFER_SEARCH, Self::new(secs(15 * 60), 2, secs(1), 100)),
            (LOCATION_LOOKUP, Self::new(secs(24 * 60 * 60), 2, millis(500), 500).persisted()),
            (PRICING, Self::new(secs(2 * 60), 1, millis(500), 100)),
            (DEFAULT_CATEGORY, Self::default()),
        ]
        .into_iter()
        .map(|(name, config)| (name.to_string(), config))
        .collect()
    }
}
