//! API Handlers
//!
//! HTTP request handlers for each cache admin endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::Value;
use tracing::info;

use crate::cache::{
    CacheStats, DurableStore, FileDurableStore, InMemoryDurableStore, RetryableCache, SetOptions,
};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::models::{
    validate_key, CategoriesResponse, ClearResponse, DeleteResponse, GetResponse, HealthResponse,
    InvalidateRequest, InvalidateResponse, SetRequest, SetResponse,
};

/// The cache the admin server hosts: arbitrary JSON payloads.
pub type JsonCache = RetryableCache<Value>;

/// Application state shared across all handlers.
///
/// The cache synchronises internally, so handlers share it through a plain `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<JsonCache>,
}

impl AppState {
    /// Creates a new AppState around an existing cache.
    pub fn new(cache: JsonCache) -> Self {
        Self {
            cache: Arc::new(cache),
        }
    }

    /// Creates a new AppState from configuration.
    ///
    /// Uses a file durable store when `cache_dir` is set, otherwise an
    /// in-memory one.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let durable: Arc<dyn DurableStore> = match &config.cache_dir {
            Some(dir) => {
                info!("Persisting cache entries under {}", dir.display());
                Arc::new(FileDurableStore::open(dir).await?)
            }
            None => Arc::new(InMemoryDurableStore::new()),
        };

        let cache = RetryableCache::builder()
            .categories(config.categories())
            .fallback_category(config.fallback_category())
            .namespace(config.namespace.clone())
            .durable_store(durable)
            .build()?;

        Ok(Self::new(cache))
    }
}

/// Handler for GET /cache/:category/:key
pub async fn get_handler(
    State(state): State<AppState>,
    Path((category, key)): Path<(String, String)>,
) -> Result<Json<GetResponse>> {
    if let Some(error_msg) = validate_key(&key) {
        return Err(CacheError::InvalidRequest(error_msg));
    }

    match state.cache.get(&key, &category).await {
        Some(value) => Ok(Json(GetResponse::new(category, key, value))),
        None => Err(CacheError::NotFound(key)),
    }
}

/// Handler for PUT /cache/:category/:key
pub async fn set_handler(
    State(state): State<AppState>,
    Path((category, key)): Path<(String, String)>,
    Json(req): Json<SetRequest>,
) -> Result<Json<SetResponse>> {
    if let Some(error_msg) = validate_key(&key).or_else(|| req.validate()) {
        return Err(CacheError::InvalidRequest(error_msg));
    }

    let options = SetOptions {
        source: req.source,
        correlation_id: req.correlation_id,
        custom_ttl: req.ttl.map(Duration::from_secs),
    };
    state.cache.set(&key, req.value, &category, options).await;

    Ok(Json(SetResponse::new(category, key)))
}

/// Handler for DELETE /cache/:category/:key
pub async fn delete_handler(
    State(state): State<AppState>,
    Path((category, key)): Path<(String, String)>,
) -> Result<Json<DeleteResponse>> {
    if state.cache.remove(&key, &category).await {
        Ok(Json(DeleteResponse::new(key)))
    } else {
        Err(CacheError::NotFound(key))
    }
}

/// Handler for POST /invalidate
pub async fn invalidate_handler(
    State(state): State<AppState>,
    Json(req): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(CacheError::InvalidRequest(error_msg));
    }

    let removed = state.cache.invalidate(&req.pattern).await;
    Ok(Json(InvalidateResponse {
        pattern: req.pattern,
        removed,
    }))
}

/// Handler for POST /clear
pub async fn clear_handler(State(state): State<AppState>) -> Json<ClearResponse> {
    state.cache.clear().await;
    Json(ClearResponse::cleared())
}

/// Handler for GET /stats
pub async fn stats_handler(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.cache.stats().await)
}

/// Handler for GET /categories
pub async fn categories_handler(State(state): State<AppState>) -> Json<CategoriesResponse> {
    Json(CategoriesResponse {
        categories: state.cache.category_names().await,
    })
}

/// Handler for GET /health
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}
