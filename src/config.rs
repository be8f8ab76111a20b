//! Configuration Module
//!
//! Handles loading and managing cache server configuration from environment
//! variables.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::category::DEFAULT_CATEGORY;
use crate::cache::{CategoryConfig, DEFAULT_MAX_DELAY, DEFAULT_NAMESPACE};

/// Server configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Prefix for keys written to the durable store
    pub namespace: String,
    /// Directory for the file durable store; in-memory durable store when unset
    pub cache_dir: Option<PathBuf>,
    /// HTTP server port
    pub server_port: u16,
    /// TTL in seconds for the fallback category
    pub default_ttl: u64,
    /// Capacity of the fallback category
    pub default_max_entries: usize,
    /// Adds random jitter to every category's backoff
    pub retry_jitter: bool,
    /// Cap on a single backoff delay, in milliseconds
    pub max_retry_delay_ms: u64,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_NAMESPACE` - Durable key prefix (default: travel-cache)
    /// - `CACHE_DIR` - File durable store directory (default: unset)
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    /// - `DEFAULT_TTL` - Fallback category TTL in seconds (default: 300)
    /// - `DEFAULT_MAX_ENTRIES` - Fallback category capacity (default: 100)
    /// - `RETRY_JITTER` - Enable backoff jitter (default: false)
    /// - `MAX_RETRY_DELAY_MS` - Backoff cap in milliseconds (default: 30000)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            namespace: env::var("CACHE_NAMESPACE")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.namespace),
            cache_dir: env::var("CACHE_DIR")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            server_port: parse_var("SERVER_PORT").unwrap_or(defaults.server_port),
            default_ttl: parse_var("DEFAULT_TTL").unwrap_or(defaults.default_ttl),
            default_max_entries: parse_var("DEFAULT_MAX_ENTRIES")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.default_max_entries),
            retry_jitter: parse_var("RETRY_JITTER").unwrap_or(defaults.retry_jitter),
            max_retry_delay_ms: parse_var("MAX_RETRY_DELAY_MS")
                .unwrap_or(defaults.max_retry_delay_ms),
        }
    }

    /// Fallback category built from the `DEFAULT_*` settings.
    pub fn fallback_category(&self) -> CategoryConfig {
        CategoryConfig {
            ttl: Duration::from_secs(self.default_ttl),
            max_entries: self.default_max_entries,
            ..CategoryConfig::default()
        }
        .with_jitter(self.retry_jitter)
        .with_max_delay(Duration::from_millis(self.max_retry_delay_ms))
    }

    /// Built-in travel categories with the retry settings applied.
    pub fn categories(&self) -> HashMap<String, CategoryConfig> {
        let mut categories: HashMap<String, CategoryConfig> = CategoryConfig::travel_defaults()
            .into_iter()
            .map(|(name, config)| {
                let config = config
                    .with_jitter(self.retry_jitter)
                    .with_max_delay(Duration::from_millis(self.max_retry_delay_ms));
                (name, config)
            })
            .collect();
        categories.insert(DEFAULT_CATEGORY.to_string(), self.fallback_category());
        categories
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            cache_dir: None,
            server_port: 3000,
            default_ttl: 300,
            default_max_entries: 100,
            retry_jitter: false,
            max_retry_delay_ms: DEFAULT_MAX_DELAY.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.namespace, "travel-cache");
        assert!(config.cache_dir.is_none());
        assert_eq!(config.server_port, 3000);
        assert_eq!(config.default_ttl, 300);
        assert_eq!(config.default_max_entries, 100);
        assert!(!config.retry_jitter);
        assert_eq!(config.max_retry_delay_ms, 30_000);
    }

    #[test]
    fn test_config_from_env_defaults() {
        // Clear any existing env vars to test defaults
        for name in [
            "CACHE_NAMESPACE",
            "CACHE_DIR",
            "SERVER_PORT",
            "DEFAULT_TTL",
            "DEFAULT_MAX_ENTRIES",
            "RETRY_JITTER",
            "MAX_RETRY_DELAY_MS",
        ] {
            env::remove_var(name);
        }

        let config = Config::from_env();
        assert_eq!(config.namespace, "travel-cache");
        assert_eq!(config.server_port, 3000);
        assert_eq!(config.default_ttl, 300);
        assert!(!config.retry_jitter);
    }

    #[test]
    fn test_categories_apply_retry_settings() {
        let config = Config {
            retry_jitter: true,
            max_retry_delay_ms: 5_000,
            default_ttl: 42,
            ..Config::default()
        };

        let categories = config.categories();
        assert!(categories.values().all(|c| c.jitter));
        assert!(categories
            .values()
            .all(|c| c.max_delay == Duration::from_secs(5)));
        assert_eq!(categories[DEFAULT_CATEGORY].ttl, Duration::from_secs(42));
    }
}
