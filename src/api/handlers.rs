//! API Handlers
//!
//! HTTP request handlers for each cache server endpoint.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use crate::config::CacheConfig;
use crate::engine::{Cache, CacheDefinition};
use crate::error::{CacheError, Result};
use crate::invalidation::InvalidationReport;
use crate::models::{
    DeleteResponse, GetResponse, HealthResponse, InvalidationResponse, KvDocument, KvSetRequest,
    PatternRequest, SetResponse, StatsResponse, SubscribeQuery,
};
use crate::store::BackingStore;

/// Name of the definition backing the `/kv` endpoints.
pub const KV_DEFINITION: &str = "kv";

/// Application state shared across all handlers.
///
/// The cache handle is internally synchronized, so the state is cloned
/// freely without an outer lock.
#[derive(Clone)]
pub struct AppState {
    pub cache: Cache,
    /// Definition behind `/kv`, keyed by the raw key from the request
    pub kv: CacheDefinition<String, KvDocument>,
}

impl AppState {
    /// Creates a new AppState on the given cache, registering the `kv` definition.
    pub fn new(cache: Cache) -> Result<Self> {
        let default_ttl = cache.config().default_ttl();
        let kv = cache
            .define::<String, KvDocument>(KV_DEFINITION)
            .key(|key: &String| key.clone())
            .ttl_with(move |_, doc: &KvDocument| {
                doc.ttl
                    .map(std::time::Duration::from_secs)
                    .unwrap_or(default_ttl)
            })
            .tags(|_, doc: &KvDocument| doc.tags.clone())
            .cascade(|_, doc: &KvDocument| doc.cascade.clone())
            .build()?;

        Ok(Self { cache, kv })
    }

    /// Creates a new AppState from configuration and a backing store.
    pub fn from_config(config: &CacheConfig, store: Arc<dyn BackingStore>) -> Result<Self> {
        Self::new(Cache::new(config.clone(), store)?)
    }

    fn relative(&self, report: InvalidationReport) -> InvalidationResponse {
        let prefix = self.cache.qualify("");
        InvalidationResponse::new(
            report
                .keys
                .into_iter()
                .map(|key| key.strip_prefix(&prefix).map(str::to_string).unwrap_or(key))
                .collect(),
        )
    }
}

/// Handler for PUT /kv
///
/// Writes a JSON value through both tiers with optional TTL, tags and cascade keys.
pub async fn set_handler(
    State(state): State<AppState>,
    Json(req): Json<KvSetRequest>,
) -> Result<Json<SetResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(CacheError::InvalidRequest(error_msg));
    }

    let doc = KvDocument {
        value: req.value,
        ttl: req.ttl,
        tags: req.tags,
        cascade: req
            .cascade
            .iter()
            .map(|relative| state.cache.qualify(relative))
            .collect(),
    };
    state.kv.set(req.key.clone(), doc).await?;

    Ok(Json(SetResponse::new(req.key)))
}

/// Handler for GET /kv/:key
pub async fn get_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<GetResponse>> {
    match state.kv.get(key.clone()).await? {
        Some(doc) => Ok(Json(GetResponse::new(key, doc.value, doc.tags))),
        None => Err(CacheError::NotFound(key)),
    }
}

/// Handler for DELETE /kv/:key
///
/// Deleting an absent key succeeds with `deleted: false`.
pub async fn delete_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<DeleteResponse>> {
    let deleted = state.kv.delete(&key).await?;
    Ok(Json(DeleteResponse::new(key, deleted)))
}

/// Handler for POST /invalidate/key/:key (namespace-relative key)
pub async fn invalidate_key_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<InvalidationResponse>> {
    let report = state.cache.invalidate(&state.cache.qualify(&key)).await?;
    Ok(Json(state.relative(report)))
}

/// Handler for POST /invalidate/tag/:tag
pub async fn invalidate_tag_handler(
    State(state): State<AppState>,
    Path(tag): Path<String>,
) -> Result<Json<InvalidationResponse>> {
    let report = state.cache.invalidate_by_tag(&tag).await?;
    Ok(Json(state.relative(report)))
}

/// Handler for POST /invalidate/pattern
pub async fn invalidate_pattern_handler(
    State(state): State<AppState>,
    Json(req): Json<PatternRequest>,
) -> Result<Json<InvalidationResponse>> {
    let report = state.cache.invalidate_by_pattern(&req.pattern).await?;
    Ok(Json(state.relative(report)))
}

/// Handler for GET /subscribe
///
/// Streams coalesced invalidation notifications as server-sent events until
/// the client disconnects or the cache closes.
pub async fn subscribe_handler(
    State(state): State<AppState>,
    Query(query): Query<SubscribeQuery>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>>> {
    let handle = state.cache.subscribe(query.into_filter())?;
    debug!(subscriber = handle.id(), "invalidation stream opened");

    let stream = handle.map(|notification| {
        Event::default()
            .event("invalidate")
            .json_data(&notification)
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Handler for GET /stats
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse::from(state.cache.stats()))
}

/// Handler for GET /health
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::new(state.cache.breaker_state()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn state() -> AppState {
        let cache = Cache::new(CacheConfig::default(), Arc::new(MemoryStore::new())).unwrap();
        AppState::new(cache).unwrap()
    }

    fn set_request(key: &str, tags: &[&str]) -> KvSetRequest {
        KvSetRequest {
            key: key.to_string(),
            value: json!({"name": key}),
            ttl: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            cascade: vec![],
        }
    }

    #[tokio::test]
    async fn test_set_and_get_handler() {
        let state = state();

        let result = set_handler(State(state.clone()), Json(set_request("1", &["team"]))).await;
        assert!(result.is_ok());

        let response = get_handler(State(state.clone()), Path("1".to_string()))
            .await
            .unwrap();
        assert_eq!(response.value, json!({"name": "1"}));
        assert_eq!(response.tags, vec!["team"]);
    }

    #[tokio::test]
    async fn test_get_nonexistent_key() {
        let result = get_handler(State(state()), Path("nonexistent".to_string())).await;
        assert!(matches!(result, Err(CacheError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_handler_is_idempotent() {
        let state = state();
        set_handler(State(state.clone()), Json(set_request("gone", &[])))
            .await
            .unwrap();

        let first = delete_handler(State(state.clone()), Path("gone".to_string()))
            .await
            .unwrap();
        assert!(first.deleted);

        let second = delete_handler(State(state.clone()), Path("gone".to_string()))
            .await
            .unwrap();
        assert!(!second.deleted);
    }

    #[tokio::test]
    async fn test_invalidate_handlers_report_relative_keys() {
        let state = state();
        for key in ["1", "2"] {
            set_handler(State(state.clone()), Json(set_request(key, &["team"])))
                .await
                .unwrap();
        }

        let by_key = invalidate_key_handler(State(state.clone()), Path("kv:1".to_string()))
            .await
            .unwrap();
        assert_eq!(by_key.keys, vec!["kv:1"]);

        let by_tag = invalidate_tag_handler(State(state.clone()), Path("team".to_string()))
            .await
            .unwrap();
        assert_eq!(by_tag.count, 1);
        assert_eq!(by_tag.keys, vec!["kv:2"]);
    }

    #[tokio::test]
    async fn test_invalidate_pattern_rejects_malformed_glob() {
        let req = PatternRequest {
            pattern: "kv:[".to_string(),
        };
        let result = invalidate_pattern_handler(State(state()), Json(req)).await;
        assert!(matches!(result, Err(CacheError::InvalidPattern(_))));
    }

    #[tokio::test]
    async fn test_stats_handler() {
        let response = stats_handler(State(state())).await;
        assert_eq!(response.stats.hits, 0);
        assert_eq!(response.stats.misses, 0);
    }

    #[tokio::test]
    async fn test_health_handler() {
        let response = health_handler(State(state())).await;
        assert_eq!(response.status, "healthy");
    }

    #[tokio::test]
    async fn test_set_invalid_request() {
        let result = set_handler(State(state()), Json(set_request("", &[]))).await;
        assert!(matches!(result, Err(CacheError::InvalidRequest(_))));
    }
}
