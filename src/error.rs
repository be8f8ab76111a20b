//! Error types for the retry cache
//!
//! Provides unified error handling using thiserror.

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Error produced by a caller-supplied upstream fetch.
///
/// Shared behind an `Arc` so that every caller coalesced onto one fetch
/// receives the same cause.
pub type UpstreamError = Arc<dyn std::error::Error + Send + Sync + 'static>;

// == Cache Error Enum ==
/// Unified error type for the cache and its admin server.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Durable store read/write failure, recovered locally
    #[error("Durable store error: {0}")]
    Durable(String),

    /// Durable store I/O failure, recovered locally
    #[error("Durable store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry could not be encoded or decoded for the durable store
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// All fetch attempts failed and no stale entry was available
    #[error("Fetch for '{key}' exhausted after {attempts} attempt(s): {source}")]
    FetchExhausted {
        key: String,
        attempts: u32,
        #[source]
        source: UpstreamError,
    },

    /// The caller gave up before the fetch completed
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Category configuration rejected at registration
    #[error("Invalid category: {0}")]
    InvalidCategory(String),

    /// Key not found in cache
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::NotFound(_) => StatusCode::NOT_FOUND,
            CacheError::InvalidRequest(_) | CacheError::InvalidCategory(_) => {
                StatusCode::BAD_REQUEST
            }
            CacheError::FetchExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CacheError::Cancelled(_) => StatusCode::REQUEST_TIMEOUT,
            CacheError::Durable(_) | CacheError::Io(_) | CacheError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the retry cache.
pub type Result<T> = std::result::Result<T, CacheError>;
