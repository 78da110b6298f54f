//! API Routes
//!
//! Configures the Axum router with all cache server endpoints.

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    delete_handler, get_handler, health_handler, invalidate_key_handler,
    invalidate_pattern_handler, invalidate_tag_handler, set_handler, stats_handler,
    subscribe_handler, AppState,
};

/// Creates the main router with all endpoints configured.
///
/// # Endpoints
/// - `PUT /kv` - Write a value through both tiers
/// - `GET /kv/:key` - Read a value
/// - `DELETE /kv/:key` - Delete a key without cascading
/// - `POST /invalidate/key/:key` - Invalidate a key and its cascade set
/// - `POST /invalidate/tag/:tag` - Invalidate every key carrying a tag
/// - `POST /invalidate/pattern` - Invalidate keys matching a glob
/// - `GET /subscribe` - Server-sent invalidation notifications
/// - `GET /stats` - Get cache statistics
/// - `GET /health` - Health check endpoint
///
/// # Middleware
/// - CORS: Allows any origin (configurable for production)
/// - Tracing: Logs all requests for debugging
pub fn create_router(state: AppState) -> Router {
    // Configure CORS middleware
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/kv", put(set_handler))
        .route("/kv/:key", get(get_handler).delete(delete_handler))
        .route("/invalidate/key/:key", post(invalidate_key_handler))
        .route("/invalidate/tag/:tag", post(invalidate_tag_handler))
        .route("/invalidate/pattern", post(invalidate_pattern_handler))
        .route("/subscribe", get(subscribe_handler))
        .route("/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
