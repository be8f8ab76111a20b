//! Retry Policy Module
//!
//! Exponential backoff parameters and delay computation for upstream fetches.

use std::time::Duration;

use rand::Rng;

/// Default multiplier applied to the delay after each failed attempt.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Default upper bound on a single backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Jitter is drawn uniformly from `0..MAX_JITTER_MS` milliseconds.
pub const MAX_JITTER_MS: u64 = 1_000;

// == Retry Policy ==
/// Effective retry settings for one `get_with_retry` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt; total attempts are `max_retries + 1`
    pub max_retries: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_factor: f64,
    /// Cap applied before jitter
    pub max_delay: Duration,
    /// Adds up to one second of random delay when set
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    // == Apply Overrides ==
    /// Returns a copy with every field set in `overrides` replaced.
    ///
    /// A backoff factor below 1.0 is raised to 1.0 so delays never shrink;
    /// a non-finite one is ignored.
    pub fn with_overrides(&self, overrides: &RetryOverrides) -> Self {
        let backoff_factor = match overrides.backoff_factor {
            Some(factor) if factor.is_finite() => factor.max(1.0),
            _ => self.backoff_factor,
        };

        Self {
            max_retries: overrides.max_retries.unwrap_or(self.max_retries),
            base_delay: overrides.base_delay.unwrap_or(self.base_delay),
            backoff_factor,
            max_delay: overrides.max_delay.unwrap_or(self.max_delay),
            jitter: overrides.jitter.unwrap_or(self.jitter),
        }
    }

    // == Backoff ==
    /// Deterministic part of the delay after failed attempt number `attempt`.
    ///
    /// `attempt` is 1-based: the delay after the first failure is
    /// `base_delay`, then `base_delay * factor`, and so on, never above
    /// `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base_ms = self.base_delay.as_millis() as f64;
        let cap_ms = self.max_delay.as_millis() as f64;

        // powi overflows to infinity for large exponents, which min() handles.
        let delay_ms = (base_ms * self.backoff_factor.powi(exponent)).min(cap_ms);
        if delay_ms.is_nan() || delay_ms <= 0.0 {
            return Duration::ZERO;
        }

        Duration::from_millis(delay_ms as u64)
    }

    /// Full delay after failed attempt `attempt`, jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        if !self.jitter {
            return delay;
        }

        let jitter_ms = rand::thread_rng().gen_range(0..MAX_JITTER_MS);
        delay + Duration::from_millis(jitter_ms)
    }
}

// == Retry Overrides ==
/// Per-call replacements for a category's retry settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryOverrides {
    pub max_retries: Option<u32>,
    pub base_delay: Option<Duration>,
    pub backoff_factor: Option<f64>,
    pub max_delay: Option<Duration>,
    pub jitter: Option<bool>,
}

impl RetryOverrides {
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = Some(base_delay);
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = Some(factor);
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = Some(jitter);
        self
    }
}
