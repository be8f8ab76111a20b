//! Retryable Cache Module
//!
//! The two-tier cache: a category-partitioned memory store in front of an
//! optional durable store, with retrying fetches on miss and stale data as
//! the last resort when every fetch attempt fails.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::category::DEFAULT_CATEGORY;
use crate::cache::{
    CacheEntry, CacheStats, CategoryConfig, DurableStore, MemoryStore, RetryOverrides,
    RetryPolicy, SingleFlight, SOURCE_API, SOURCE_MANUAL,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{CacheError, Result, UpstreamError};

/// Namespace used for durable keys when none is configured.
pub const DEFAULT_NAMESPACE: &str = "travel-cache";

// == Set Options ==
/// Optional metadata for [`RetryableCache::set`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Provenance tag, "manual" when unset
    pub source: Option<String>,
    pub correlation_id: Option<String>,
    /// Overrides the category TTL for this entry
    pub custom_ttl: Option<Duration>,
}

impl SetOptions {
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.custom_ttl = Some(ttl);
        self
    }
}

/// Why a coalesced fetch gave up; cloned out to every waiting caller.
#[derive(Debug, Clone)]
struct FetchFailure {
    attempts: u32,
    last: UpstreamError,
}

type FetchOutcome<T> = std::result::Result<T, FetchFailure>;

#[derive(Debug)]
struct CacheState<T> {
    store: MemoryStore<T>,
    stats: CacheStats,
}

// == Retryable Cache ==
/// Category-scoped TTL cache with retrying, coalesced upstream fetches.
///
/// Share one instance behind an `Arc`; every method takes `&self`.
pub struct RetryableCache<T> {
    state: RwLock<CacheState<T>>,
    categories: RwLock<HashMap<String, CategoryConfig>>,
    /// Policy for categories nobody registered
    fallback: CategoryConfig,
    durable: Option<Arc<dyn DurableStore>>,
    namespace: String,
    clock: Arc<dyn Clock>,
    in_flight: SingleFlight<FetchOutcome<T>>,
}

impl<T> RetryableCache<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    // == Constructor ==
    pub fn builder() -> RetryableCacheBuilder<T> {
        RetryableCacheBuilder::new()
    }

    // == Categories ==
    /// Adds or replaces a category. Shrinking `max_entries` evicts at once.
    pub async fn register_category(&self, name: &str, config: CategoryConfig) -> Result<()> {
        config.validate(name)?;

        let max_entries = config.max_entries;
        let persist = config.persist_to_durable_store;
        self.categories
            .write()
            .await
            .insert(name.to_string(), config);
        info!("Registered cache category '{}'", name);

        let evicted = self.evict(name, max_entries).await;
        if persist {
            self.remove_durable(&evicted).await;
        }
        Ok(())
    }

    /// Returns the policy for `category`, or the fallback when unregistered.
    pub async fn category_config(&self, category: &str) -> CategoryConfig {
        match self.categories.read().await.get(category) {
            Some(config) => config.clone(),
            None => {
                debug!("Unknown category '{}', using fallback policy", category);
                self.fallback.clone()
            }
        }
    }

    pub async fn category_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.categories.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    // == Get ==
    /// Returns the fresh value for `key`, checking memory then the durable
    /// store. A durable hit is promoted back into memory.
    pub async fn get(&self, key: &str, category: &str) -> Option<T> {
        let config = self.category_config(category).await;
        let now = self.clock.now_ms();

        {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            if let Some(data) = state
                .store
                .get_fresh(key, category, now)
                .map(|entry| entry.data.clone())
            {
                state.stats.record_hit();
                debug!("Cache hit for '{}' in '{}'", key, category);
                return Some(data);
            }
        }

        if config.persist_to_durable_store {
            if let Some(entry) = self.read_durable(key).await {
                if !entry.is_expired_at(now) {
                    let data = entry.data.clone();
                    let evicted = {
                        let mut guard = self.state.write().await;
                        let state = &mut *guard;
                        state.store.insert(key, category, entry);
                        state.stats.record_hit();
                        let evicted = state.store.evict_excess(category, config.max_entries);
                        state.stats.record_evictions(evicted.len());
                        evicted
                    };
                    self.remove_durable(&evicted).await;
                    debug!("Promoted '{}' from durable store into memory", key);
                    return Some(data);
                }
            }
        }

        self.state.write().await.stats.record_miss();
        debug!("Cache miss for '{}' in '{}'", key, category);
        None
    }

    // == Set ==
    /// Stores `data` under `key`. Durable persistence is best-effort; a
    /// failure there is logged and counted, never returned.
    pub async fn set(&self, key: &str, data: T, category: &str, options: SetOptions) {
        let config = self.category_config(category).await;
        let ttl = options.custom_ttl.unwrap_or(config.ttl);
        let entry = CacheEntry::new(
            data,
            self.clock.now_ms(),
            ttl,
            options.source.unwrap_or_else(|| SOURCE_MANUAL.to_string()),
            options.correlation_id,
        );

        let encoded = if config.persist_to_durable_store && self.durable.is_some() {
            match serde_json::to_vec(&entry) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!("Failed to encode '{}' for durable store: {}", key, e);
                    self.record_error().await;
                    None
                }
            }
        } else {
            None
        };

        self.state.write().await.store.insert(key, category, entry);

        if let Some(bytes) = encoded {
            self.write_durable(key, bytes).await;
        }

        let evicted = self.evict(category, config.max_entries).await;
        if config.persist_to_durable_store {
            self.remove_durable(&evicted).await;
        }
    }

    // == Get With Retry ==
    /// Returns the cached value for `key`, or fetches it with retries.
    ///
    /// Concurrent misses on the same key share a single retry loop. When
    /// every attempt fails, an expired entry for the key is returned if one
    /// exists in either tier; otherwise the last fetch error is surfaced as
    /// [`CacheError::FetchExhausted`].
    pub async fn get_with_retry<F, Fut, E>(
        &self,
        key: &str,
        category: &str,
        fetch: F,
        overrides: Option<RetryOverrides>,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        if let Some(hit) = self.get(key, category).await {
            return Ok(hit);
        }

        let config = self.category_config(category).await;
        let mut policy = config.retry_policy();
        if let Some(overrides) = &overrides {
            policy = policy.with_overrides(overrides);
        }

        let (outcome, led) = self
            .in_flight
            .run(key, || self.fetch_with_retry(key, category, fetch, policy))
            .await;
        if !led {
            debug!("Joined in-flight fetch for '{}'", key);
        }

        outcome.map_err(|failure| CacheError::FetchExhausted {
            key: key.to_string(),
            attempts: failure.attempts,
            source: failure.last,
        })
    }

    /// [`get_with_retry`](Self::get_with_retry) that gives up as soon as
    /// `cancel` resolves, dropping any fetch or backoff sleep in progress.
    pub async fn get_with_retry_until<F, Fut, E, C>(
        &self,
        key: &str,
        category: &str,
        fetch: F,
        overrides: Option<RetryOverrides>,
        cancel: C,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<Box<dyn StdError + Send + Sync>>,
        C: Future<Output = ()>,
    {
        tokio::select! {
            result = self.get_with_retry(key, category, fetch, overrides) => result,
            _ = cancel => {
                warn!("Fetch for '{}' cancelled by caller", key);
                Err(CacheError::Cancelled(format!("fetch for '{}' cancelled", key)))
            }
        }
    }

    async fn fetch_with_retry<F, Fut, E>(
        &self,
        key: &str,
        category: &str,
        mut fetch: F,
        policy: RetryPolicy,
    ) -> FetchOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        // A run that finished just before this one started may have filled it.
        let now = self.clock.now_ms();
        if let Some(data) = self
            .state
            .read()
            .await
            .store
            .get_fresh(key, category, now)
            .map(|entry| entry.data.clone())
        {
            return Ok(data);
        }

        let mut attempt: u32 = 0;
        let last: UpstreamError = loop {
            match fetch().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!("Fetch for '{}' succeeded after {} retries", key, attempt);
                    }
                    self.set(
                        key,
                        value.clone(),
                        category,
                        SetOptions::default().source(SOURCE_API),
                    )
                    .await;
                    return Ok(value);
                }
                Err(e) => {
                    let boxed: Box<dyn StdError + Send + Sync> = e.into();
                    let err: UpstreamError = Arc::from(boxed);
                    attempt += 1;
                    self.state.write().await.stats.record_retry();
                    warn!(
                        "Fetch attempt {}/{} for '{}' failed: {}",
                        attempt,
                        policy.max_retries + 1,
                        key,
                        err
                    );

                    if attempt > policy.max_retries {
                        break err;
                    }

                    let delay = policy.delay_for(attempt);
                    debug!("Retrying '{}' in {:?}", key, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        };

        if let Some(stale) = self.stale_value(key).await {
            warn!(
                "Serving stale data for '{}' after {} failed attempts",
                key, attempt
            );
            return Ok(stale);
        }

        self.record_error().await;
        Err(FetchFailure {
            attempts: attempt,
            last,
        })
    }

    /// Any entry for `key`, expired or not, from memory then durable store.
    async fn stale_value(&self, key: &str) -> Option<T> {
        let in_memory = self
            .state
            .read()
            .await
            .store
            .get_any(key)
            .map(|entry| entry.data.clone());

        match in_memory {
            Some(data) => Some(data),
            None => self.read_durable(key).await.map(|entry| entry.data),
        }
    }

    // == Invalidate ==
    /// Removes every key containing `pattern` from both tiers.
    ///
    /// Returns the number of entries removed from memory.
    pub async fn invalidate(&self, pattern: &str) -> usize {
        let removed = self.state.write().await.store.remove_matching(pattern);

        if let Some(durable) = &self.durable {
            let prefix = self.durable_prefix();
            match durable.keys().await {
                Ok(keys) => {
                    let matching: Vec<String> = keys
                        .into_iter()
                        .filter(|k| {
                            k.strip_prefix(&prefix)
                                .is_some_and(|rest| rest.contains(pattern))
                        })
                        .collect();
                    for durable_key in matching {
                        if let Err(e) = durable.remove(&durable_key).await {
                            warn!("Failed to remove '{}' from durable store: {}", durable_key, e);
                            self.record_error().await;
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to list durable keys for invalidation: {}", e);
                    self.record_error().await;
                }
            }
        }

        info!(
            "Invalidated {} entries matching '{}'",
            removed.len(),
            pattern
        );
        removed.len()
    }

    // == Remove ==
    /// Removes `key` from both tiers if it belongs to `category`.
    ///
    /// A key held in memory under another category is left alone. Returns
    /// whether either tier held the entry.
    pub async fn remove(&self, key: &str, category: &str) -> bool {
        let config = self.category_config(category).await;

        let (removed, held_elsewhere) = {
            let mut state = self.state.write().await;
            let removed = state.store.remove_from(key, category).is_some();
            (removed, !removed && state.store.owner(key).is_some())
        };
        if held_elsewhere {
            debug!("'{}' is not held in '{}', nothing removed", key, category);
            return false;
        }

        let in_durable = config.persist_to_durable_store && self.read_durable(key).await.is_some();
        if removed || in_durable {
            self.remove_durable(&[key.to_string()]).await;
        }
        removed || in_durable
    }

    // == Clear ==
    /// Drops every entry in both tiers, pending fetch slots, and statistics.
    pub async fn clear(&self) {
        if let Some(durable) = &self.durable {
            let prefix = self.durable_prefix();
            match durable.keys().await {
                Ok(keys) => {
                    for durable_key in keys.iter().filter(|k| k.starts_with(&prefix)) {
                        if let Err(e) = durable.remove(durable_key).await {
                            warn!("Failed to remove '{}' from durable store: {}", durable_key, e);
                        }
                    }
                }
                Err(e) => warn!("Failed to list durable keys for clear: {}", e),
            }
        }

        self.in_flight.clear();

        let mut state = self.state.write().await;
        state.store.clear();
        state.stats = CacheStats::new();
        info!("Cache cleared");
    }

    // == Stats ==
    /// Returns counters plus current entry count and hit rate.
    pub async fn stats(&self) -> CacheStats {
        let state = self.state.read().await;
        state.stats.snapshot(state.store.len())
    }

    /// Number of in-memory entries held for `category`.
    pub async fn category_entry_count(&self, category: &str) -> usize {
        self.state.read().await.store.category_len(category)
    }

    // == Internals ==
    async fn evict(&self, category: &str, max_entries: usize) -> Vec<String> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let evicted = state.store.evict_excess(category, max_entries);
        if !evicted.is_empty() {
            state.stats.record_evictions(evicted.len());
            debug!(
                "Evicted {} oldest entries from '{}'",
                evicted.len(),
                category
            );
        }
        evicted
    }

    async fn record_error(&self) {
        self.state.write().await.stats.record_error();
    }

    fn durable_prefix(&self) -> String {
        format!("{}-", self.namespace)
    }

    fn durable_key(&self, key: &str) -> String {
        format!("{}-{}", self.namespace, key)
    }

    async fn read_durable(&self, key: &str) -> Option<CacheEntry<T>> {
        let durable = self.durable.as_ref()?;

        match durable.get(&self.durable_key(key)).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Discarding undecodable durable entry '{}': {}", key, e);
                    self.record_error().await;
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Durable read for '{}' failed: {}", key, e);
                self.record_error().await;
                None
            }
        }
    }

    async fn write_durable(&self, key: &str, bytes: Vec<u8>) {
        let Some(durable) = &self.durable else {
            return;
        };

        if let Err(e) = durable.set(&self.durable_key(key), bytes).await {
            warn!(
                "Durable write for '{}' failed, keeping memory copy only: {}",
                key, e
            );
            self.record_error().await;
        }
    }

    async fn remove_durable(&self, keys: &[String]) {
        let Some(durable) = &self.durable else {
            return;
        };

        for key in keys {
            if let Err(e) = durable.remove(&self.durable_key(key)).await {
                warn!("Durable remove for '{}' failed: {}", key, e);
                self.record_error().await;
            }
        }
    }
}

// == Builder ==
/// Configures a [`RetryableCache`].
pub struct RetryableCacheBuilder<T> {
    categories: HashMap<String, CategoryConfig>,
    fallback: CategoryConfig,
    durable: Option<Arc<dyn DurableStore>>,
    namespace: String,
    clock: Arc<dyn Clock>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for RetryableCacheBuilder<T> {
    fn default() -> Self {
        Self {
            categories: HashMap::new(),
            fallback: CategoryConfig::default(),
            durable: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            clock: Arc::new(SystemClock),
            _marker: PhantomData,
        }
    }
}

impl<T> RetryableCacheBuilder<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category(mut self, name: impl Into<String>, config: CategoryConfig) -> Self {
        self.categories.insert(name.into(), config);
        self
    }

    pub fn categories(mut self, categories: HashMap<String, CategoryConfig>) -> Self {
        self.categories.extend(categories);
        self
    }

    /// Policy applied to categories that were never registered.
    pub fn fallback_category(mut self, config: CategoryConfig) -> Self {
        self.fallback = config;
        self
    }

    pub fn durable_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(store);
        self
    }

    /// Prefix for durable keys, which are stored as `"<namespace>-<key>"`.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<RetryableCache<T>> {
        for (name, config) in &self.categories {
            config.validate(name)?;
        }
        self.fallback.validate(DEFAULT_CATEGORY)?;

        Ok(RetryableCache {
            state: RwLock::new(CacheState {
                store: MemoryStore::new(),
                stats: CacheStats::new(),
            }),
            categories: RwLock::new(self.categories),
            fallback: self.fallback,
            durable: self.durable,
            namespace: self.namespace,
            clock: self.clock,
            in_flight: SingleFlight::new(),
        })
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::category::{HOTEL_SEARCH, PRICING};
    use crate::cache::InMemoryDurableStore;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    const START_MS: u64 = 1_700_000_000_000;

    fn fast_category(max_entries: usize) -> CategoryConfig {
        CategoryConfig::new(
            Duration::from_secs(60),
            2,
            Duration::from_millis(1_000),
            max_entries,
        )
    }

    fn test_cache(clock: &ManualClock) -> RetryableCache<Value> {
        RetryableCache::builder()
            .categories(CategoryConfig::travel_defaults())
            .category("search", fast_category(3))
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap()
    }

    fn persisted_cache(
        clock: &ManualClock,
        durable: Arc<dyn DurableStore>,
    ) -> RetryableCache<Value> {
        RetryableCache::builder()
            .category("search", fast_category(10).persisted())
            .durable_store(durable)
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap()
    }

    /// A durable store that fails every call.
    struct BrokenStore;

    #[async_trait]
    impl DurableStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(CacheError::Durable("unavailable".into()))
        }
        async fn set(&self, _key: &str, _value: Vec<u8>) -> Result<()> {
            Err(CacheError::Durable("unavailable".into()))
        }
        async fn remove(&self, _key: &str) -> Result<()> {
            Err(CacheError::Durable("unavailable".into()))
        }
        async fn keys(&self) -> Result<Vec<String>> {
            Err(CacheError::Durable("unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_set_then_get_hotel_search() {
        let clock = ManualClock::new(START_MS);
        let cache = test_cache(&clock);

        cache
            .set(
                "hotel:SYD:2024-05-01",
                json!({"price": 200}),
                HOTEL_SEARCH,
                SetOptions::default(),
            )
            .await;

        let value = cache.get("hotel:SYD:2024-05-01", HOTEL_SEARCH).await;
        assert_eq!(value, Some(json!({"price": 200})));
    }

    #[tokio::test]
    async fn test_get_expires_after_ttl() {
        let clock = ManualClock::new(START_MS);
        let cache = test_cache(&clock);

        cache.set("k", json!(1), "search", SetOptions::default()).await;

        clock.advance(Duration::from_millis(59_999));
        assert_eq!(cache.get("k", "search").await, Some(json!(1)));

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get("k", "search").await, None);

        // Lazy expiration: the entry is still held until evicted or cleared.
        assert_eq!(cache.stats().await.entry_count, 1);
    }

    #[tokio::test]
    async fn test_custom_ttl_overrides_category() {
        let clock = ManualClock::new(START_MS);
        let cache = test_cache(&clock);

        cache
            .set(
                "short",
                json!("x"),
                "search",
                SetOptions::default().ttl(Duration::from_secs(1)),
            )
            .await;
        clock.advance(Duration::from_secs(2));

        assert_eq!(cache.get("short", "search").await, None);
    }

    #[tokio::test]
    async fn test_unknown_category_uses_fallback() {
        let clock = ManualClock::new(START_MS);
        let cache = test_cache(&clock);

        cache.set("k", json!(true), "not-registered", SetOptions::default()).await;
        assert_eq!(cache.get("k", "not-registered").await, Some(json!(true)));

        // Fallback TTL is five minutes.
        clock.advance(Duration::from_secs(301));
        assert_eq!(cache.get("k", "not-registered").await, None);
    }

    #[tokio::test]
    async fn test_stats_track_hits_and_misses() {
        let clock = ManualClock::new(START_MS);
        let cache = test_cache(&clock);

        cache.set("k", json!(1), "search", SetOptions::default()).await;
        cache.get("k", "search").await;
        cache.get("k", "search").await;
        cache.get("k", "search").await;
        cache.get("missing", "search").await;

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 75.0);
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test]
    async fn test_eviction_is_fifo_not_lru() {
        let clock = ManualClock::new(START_MS);
        let cache = test_cache(&clock);

        for i in 0..3 {
            cache.set(&format!("k{}", i), json!(i), "search", SetOptions::default()).await;
            clock.advance(Duration::from_millis(10));
        }

        // Reading k0 does not protect it.
        assert!(cache.get("k0", "search").await.is_some());
        cache.set("k3", json!(3), "search", SetOptions::default()).await;

        assert_eq!(cache.category_entry_count("search").await, 3);
        assert!(cache.get("k0", "search").await.is_none());
        assert!(cache.get("k1", "search").await.is_some());
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_register_category_shrinks_capacity() {
        let clock = ManualClock::new(START_MS);
        let cache = test_cache(&clock);

        for i in 0..3 {
            cache.set(&format!("k{}", i), json!(i), "search", SetOptions::default()).await;
            clock.advance(Duration::from_millis(1));
        }

        cache
            .register_category("search", fast_category(1))
            .await
            .unwrap();

        assert_eq!(cache.category_entry_count("search").await, 1);
        assert!(cache.get("k2", "search").await.is_some());

        let invalid = cache.register_category("broken", fast_category(0)).await;
        assert!(matches!(invalid, Err(CacheError::InvalidCategory(_))));
    }

    #[tokio::test]
    async fn test_invalidate_by_substring() {
        let clock = ManualClock::new(START_MS);
        let cache = test_cache(&clock);

        for key in ["hotel:SYD:2024-05-01", "hotel:SYD:2024-06-01", "hotel:MEL:2024-05-01"] {
            cache.set(key, json!(key), HOTEL_SEARCH, SetOptions::default()).await;
        }

        assert_eq!(cache.invalidate("hotel:SYD").await, 2);
        assert!(cache.get("hotel:SYD:2024-05-01", HOTEL_SEARCH).await.is_none());
        assert!(cache.get("hotel:SYD:2024-06-01", HOTEL_SEARCH).await.is_none());
        assert!(cache.get("hotel:MEL:2024-05-01", HOTEL_SEARCH).await.is_some());
    }

    #[tokio::test]
    async fn test_remove_is_scoped_to_category() {
        let clock = ManualClock::new(START_MS);
        let cache = test_cache(&clock);
        cache
            .set("hotel:SYD", json!(1), HOTEL_SEARCH, SetOptions::default())
            .await;

        assert!(!cache.remove("hotel:SYD", PRICING).await);
        assert!(cache.get("hotel:SYD", HOTEL_SEARCH).await.is_some());

        assert!(cache.remove("hotel:SYD", HOTEL_SEARCH).await);
        assert!(cache.get("hotel:SYD", HOTEL_SEARCH).await.is_none());
        assert!(!cache.remove("hotel:SYD", HOTEL_SEARCH).await);
    }

    #[tokio::test]
    async fn test_remove_reaches_durable_only_copy() {
        let clock = ManualClock::new(START_MS);
        let durable: Arc<dyn DurableStore> = Arc::new(InMemoryDurableStore::new());
        let first = persisted_cache(&clock, durable.clone());
        first
            .set("hotel:SYD", json!(1), "search", SetOptions::default())
            .await;

        let second = persisted_cache(&clock, durable.clone());
        assert!(second.remove("hotel:SYD", "search").await);
        assert!(durable.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_huge_custom_ttl_does_not_wrap() {
        let clock = ManualClock::new(START_MS);
        let cache = test_cache(&clock);
        let huge = Duration::from_secs(18_446_744_073_709_552);

        cache
            .set("k", json!(1), PRICING, SetOptions::default().ttl(huge))
            .await;
        clock.advance(Duration::from_secs(1));

        assert_eq!(cache.get("k", PRICING).await, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let clock = ManualClock::new(START_MS);
        let cache = test_cache(&clock);

        cache.set("a", json!(1), PRICING, SetOptions::default()).await;
        cache.get("a", PRICING).await;

        cache.clear().await;
        let first = cache.stats().await;
        cache.clear().await;
        let second = cache.stats().await;

        assert_eq!(first, second);
        assert_eq!(second.entry_count, 0);
        assert_eq!(second.hits, 0);
    }

    #[tokio::test]
    async fn test_hit_does_not_call_fetch() {
        let clock = ManualClock::new(START_MS);
        let cache = test_cache(&clock);
        cache.set("k", json!("cached"), "search", SetOptions::default()).await;

        let calls = AtomicUsize::new(0);
        let value = cache
            .get_with_retry(
                "k",
                "search",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::io::Error>(json!("fresh"))
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(value, json!("cached"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_miss_fetches_and_stores_with_api_source() {
        let clock = ManualClock::new(START_MS);
        let cache = test_cache(&clock);

        let value = cache
            .get_with_retry("k", "search", || async { Ok::<_, std::io::Error>(json!(42)) }, None)
            .await
            .unwrap();
        assert_eq!(value, json!(42));

        let state = cache.state.read().await;
        let entry = state.store.get_any("k").unwrap();
        assert_eq!(entry.source, SOURCE_API);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_and_retry_bound() {
        let clock = ManualClock::new(START_MS);
        let cache = test_cache(&clock);

        let call_times = std::sync::Mutex::new(Vec::new());
        let result = cache
            .get_with_retry(
                "flaky",
                "search",
                || {
                    call_times.lock().unwrap().push(Instant::now());
                    async { Err::<Value, _>(std::io::Error::other("supplier down")) }
                },
                None,
            )
            .await;

        match result {
            Err(CacheError::FetchExhausted { attempts, source, .. }) => {
                assert_eq!(attempts, 3);
                assert!(source.to_string().contains("supplier down"));
            }
            other => panic!("expected FetchExhausted, got {:?}", other),
        }

        let times = call_times.lock().unwrap();
        assert_eq!(times.len(), 3);
        let first_gap = times[1] - times[0];
        let second_gap = times[2] - times[1];
        assert!(first_gap >= Duration::from_millis(1_000));
        assert!(first_gap < Duration::from_millis(1_010));
        assert!(second_gap >= Duration::from_millis(2_000));
        assert!(second_gap < Duration::from_millis(2_010));

        let stats = cache.stats().await;
        assert_eq!(stats.retries, 3);
        assert_eq!(stats.errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_later_attempt() {
        let clock = ManualClock::new(START_MS);
        let cache = test_cache(&clock);
        let calls = AtomicUsize::new(0);

        let value = cache
            .get_with_retry(
                "k",
                "search",
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(std::io::Error::other("timeout"))
                    } else {
                        Ok(json!("third time"))
                    }
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(value, json!("third time"));
        assert_eq!(cache.get("k", "search").await, Some(json!("third time")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrides_change_attempt_count() {
        let clock = ManualClock::new(START_MS);
        let cache = test_cache(&clock);
        let calls = AtomicUsize::new(0);

        let result = cache
            .get_with_retry(
                "k",
                "search",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<Value, _>("nope")
                },
                Some(RetryOverrides::default().max_retries(0)),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_fallback_after_exhaustion() {
        let clock = ManualClock::new(START_MS);
        let cache = test_cache(&clock);

        cache.set("k", json!("old"), "search", SetOptions::default()).await;
        clock.advance(Duration::from_secs(3600));

        let value = cache
            .get_with_retry("k", "search", || async { Err::<Value, _>("down") }, None)
            .await
            .unwrap();

        assert_eq!(value, json!("old"));
        assert_eq!(cache.stats().await.errors, 0);
    }

    #[tokio::test]
    async fn test_durable_entry_promoted_into_fresh_cache() {
        let clock = ManualClock::new(START_MS);
        let durable: Arc<dyn DurableStore> = Arc::new(InMemoryDurableStore::new());

        let first = persisted_cache(&clock, durable.clone());
        first
            .set("hotel:SYD", json!({"price": 180}), "search", SetOptions::default())
            .await;
        assert!(durable.get("travel-cache-hotel:SYD").await.unwrap().is_some());

        let second = persisted_cache(&clock, durable.clone());
        assert_eq!(second.get("hotel:SYD", "search").await, Some(json!({"price": 180})));
        assert_eq!(second.stats().await.entry_count, 1);
    }

    #[tokio::test]
    async fn test_expired_durable_entry_is_not_promoted() {
        let clock = ManualClock::new(START_MS);
        let durable: Arc<dyn DurableStore> = Arc::new(InMemoryDurableStore::new());

        persisted_cache(&clock, durable.clone())
            .set("k", json!(1), "search", SetOptions::default())
            .await;
        clock.advance(Duration::from_secs(61));

        let second = persisted_cache(&clock, durable);
        assert_eq!(second.get("k", "search").await, None);
        assert_eq!(second.stats().await.entry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_fallback_reads_durable_tier() {
        let clock = ManualClock::new(START_MS);
        let durable: Arc<dyn DurableStore> = Arc::new(InMemoryDurableStore::new());

        persisted_cache(&clock, durable.clone())
            .set("k", json!("from disk"), "search", SetOptions::default())
            .await;
        clock.advance(Duration::from_secs(600));

        let fresh = persisted_cache(&clock, durable);
        let value = fresh
            .get_with_retry("k", "search", || async { Err::<Value, _>("down") }, None)
            .await
            .unwrap();
        assert_eq!(value, json!("from disk"));
    }

    #[tokio::test]
    async fn test_broken_durable_store_never_surfaces() {
        let clock = ManualClock::new(START_MS);
        let cache = persisted_cache(&clock, Arc::new(BrokenStore));

        cache.set("k", json!("memory only"), "search", SetOptions::default()).await;
        assert_eq!(cache.get("k", "search").await, Some(json!("memory only")));
        assert_eq!(cache.get("missing", "search").await, None);
        assert_eq!(cache.invalidate("k").await, 1);
        cache.clear().await;

        assert_eq!(cache.stats().await.entry_count, 0);
    }

    #[tokio::test]
    async fn test_durable_quota_failure_is_counted() {
        let clock = ManualClock::new(START_MS);
        let cache = persisted_cache(&clock, Arc::new(InMemoryDurableStore::with_quota(8)));

        cache
            .set("k", json!("too big for the quota"), "search", SetOptions::default())
            .await;

        assert_eq!(cache.get("k", "search").await, Some(json!("too big for the quota")));
        assert_eq!(cache.stats().await.errors, 1);
    }

    #[tokio::test]
    async fn test_invalidate_and_clear_reach_durable_tier() {
        let clock = ManualClock::new(START_MS);
        let durable = Arc::new(InMemoryDurableStore::new());
        durable.set("other-app-key", b"keep".to_vec()).await.unwrap();
        let cache = persisted_cache(&clock, durable.clone());

        cache.set("hotel:SYD:1", json!(1), "search", SetOptions::default()).await;
        cache.set("hotel:MEL:1", json!(2), "search", SetOptions::default()).await;

        cache.invalidate("SYD").await;
        let mut keys = durable.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["other-app-key".to_string(), "travel-cache-hotel:MEL:1".to_string()]);

        cache.clear().await;
        assert_eq!(durable.keys().await.unwrap(), vec!["other-app-key".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fetch() {
        let clock = ManualClock::new(START_MS);
        let cache = Arc::new(test_cache(&clock));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_with_retry(
                        "flight:SYD-LAX",
                        "search",
                        || {
                            let calls = calls.clone();
                            async move {
                                calls.fetch_add(1, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                Ok::<_, std::io::Error>(json!({"fare": 999}))
                            }
                        },
                        None,
                    )
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!({"fare": 999}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_retry_loop() {
        let clock = ManualClock::new(START_MS);
        let cache = test_cache(&clock);
        let calls = AtomicUsize::new(0);

        let result = cache
            .get_with_retry_until(
                "k",
                "search",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<Value, _>("down")
                },
                None,
                tokio::time::sleep(Duration::from_millis(500)),
            )
            .await;

        assert!(matches!(result, Err(CacheError::Cancelled(_))));
        // First attempt ran, the 1s backoff sleep was cut short.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
