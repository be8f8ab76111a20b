//! Cache Statistics Module
//!
//! Tracks cache performance metrics including hits, misses, evictions,
//! retries and errors.

use serde::Serialize;

// == Cache Stats ==
/// Tracks cache performance metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Number of lookups that found a fresh entry
    pub hits: u64,
    /// Number of lookups that found nothing fresh
    pub misses: u64,
    /// Number of entries removed by capacity eviction
    pub evictions: u64,
    /// Number of failed upstream fetch attempts
    pub retries: u64,
    /// Durable store failures plus fetches that exhausted without fallback
    pub errors: u64,
    /// Current number of entries held in memory
    pub entry_count: usize,
    /// Hit rate as a percentage, 0.0 when no lookups happened yet
    pub hit_rate: f64,
}

impl CacheStats {
    // == Constructor ==
    /// Creates a new CacheStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Calculates `100 * hits / (hits + misses)`, or 0.0 with no lookups.
    pub fn hit_rate_percent(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 * 100.0 / total as f64
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_evictions(&mut self, count: usize) {
        self.evictions += count as u64;
    }

    pub fn record_retry(&mut self) {
        self.retries += 1;
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    // == Snapshot ==
    /// Returns a copy with `entry_count` and the derived hit rate filled in.
    pub fn snapshot(&self, entry_count: usize) -> Self {
        Self {
            entry_count,
            hit_rate: self.hit_rate_percent(),
            ..self.clone()
        }
    }
}
