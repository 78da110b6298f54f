//! Error types for the cache engine
//!
//! Provides unified error handling using thiserror.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;

// == Cache Error Enum ==
/// Unified error type for the cache engine and its HTTP surface.
///
/// The enum is `Clone` so that a single population result can be handed to
/// every caller parked on the same in-flight fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The backing store failed, timed out, or could not be reached
    #[error("Backing store unavailable: {0}")]
    BackingStoreUnavailable(String),

    /// The circuit breaker rejected the call without contacting the store
    #[error("Circuit breaker open")]
    BreakerOpen,

    /// The data-source function of a definition failed
    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    /// Stored bytes could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Malformed glob pattern
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// Definition options failed validation at registration time
    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    /// A definition with the same name is already registered
    #[error("Duplicate definition: {0}")]
    DuplicateDefinition(String),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Key not found in cache
    #[error("Key not found: {0}")]
    NotFound(String),

    /// The cache has been closed
    #[error("Cache closed")]
    Closed,
}

impl CacheError {
    /// Returns true for failures that count against the circuit breaker.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, CacheError::BackingStoreUnavailable(_))
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::NotFound(_) => StatusCode::NOT_FOUND,
            CacheError::InvalidRequest(_)
            | CacheError::InvalidPattern(_)
            | CacheError::InvalidDefinition(_) => StatusCode::BAD_REQUEST,
            CacheError::DuplicateDefinition(_) => StatusCode::CONFLICT,
            CacheError::BackingStoreUnavailable(_)
            | CacheError::BreakerOpen
            | CacheError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            CacheError::FetchFailed(_) => StatusCode::BAD_GATEWAY,
            CacheError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse::new(self.to_string()));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache engine.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_failure_classification() {
        assert!(CacheError::BackingStoreUnavailable("io".into()).is_store_failure());
        assert!(!CacheError::BreakerOpen.is_store_failure());
        assert!(!CacheError::FetchFailed("db".into()).is_store_failure());
    }

    #[test]
    fn test_status_mapping() {
        let response = CacheError::InvalidPattern("[".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = CacheError::NotFound("k".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = CacheError::BreakerOpen.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
