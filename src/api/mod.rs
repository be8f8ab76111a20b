//! API Module
//!
//! HTTP handlers and routing for the cache admin REST API.
//!
//! # Endpoints
//! - `GET|PUT|DELETE /cache/:category/:key` - Read, store or remove one key
//! - `POST /invalidate` - Remove keys by substring
//! - `POST /clear` - Reset the cache
//! - `GET /stats` - Get cache statistics
//! - `GET /categories` - List categories
//! - `GET /health` - Health check endpoint

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
