//! API Module
//!
//! HTTP handlers and routing for the cache server REST API.
//!
//! # Endpoints
//! - `PUT /kv`, `GET /kv/:key`, `DELETE /kv/:key` - Values through the `kv` definition
//! - `POST /invalidate/{key/:key, tag/:tag, pattern}` - Administrative invalidation
//! - `GET /subscribe` - Invalidation stream (server-sent events)
//! - `GET /stats` - Get cache statistics
//! - `GET /health` - Health check endpoint

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
