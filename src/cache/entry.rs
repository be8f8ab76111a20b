//! Cache Entry Module
//!
//! Defines the structure for individual cache entries with TTL support.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Provenance tag for entries written by `get_with_retry` after a fetch.
pub const SOURCE_API: &str = "api";

/// Provenance tag for entries written through `set` without an explicit source.
pub const SOURCE_MANUAL: &str = "manual";

// == Cache Entry ==
/// A cached payload with its lifetime and provenance metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// The stored payload
    pub data: T,
    /// Creation timestamp (Unix milliseconds)
    pub created_at: u64,
    /// Expiration timestamp (Unix milliseconds), always after `created_at`
    pub expires_at: u64,
    /// Where the payload came from ("api", "database", ...)
    pub source: String,
    /// Optional request correlation tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl<T> CacheEntry<T> {
    // == Constructor ==
    /// Creates a new entry created at `now_ms` that lives for `ttl`.
    ///
    /// A zero TTL is clamped to one millisecond so that `expires_at` is
    /// always strictly after `created_at`.
    pub fn new(
        data: T,
        now_ms: u64,
        ttl: Duration,
        source: impl Into<String>,
        correlation_id: Option<String>,
    ) -> Self {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        Self {
            data,
            created_at: now_ms,
            expires_at: now_ms.saturating_add(ttl_ms),
            source: source.into(),
            correlation_id,
        }
    }

    // == Is Expired ==
    /// Checks whether the entry is stale at `now_ms`.
    ///
    /// An entry is valid while `now < expires_at`; from `expires_at` onward
    /// it is expired.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }

    // == Time To Live ==
    /// Returns the remaining lifetime in milliseconds, 0 once expired.
    pub fn ttl_remaining_ms(&self, now_ms: u64) -> u64 {
        self.expires_at.saturating_sub(now_ms)
    }
}
