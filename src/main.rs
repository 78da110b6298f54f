//! Tiered Cache - cache engine server
//!
//! Serves the cache engine over HTTP with an invalidation event stream.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tiered_cache::api::{create_router, AppState};
use tiered_cache::store::{BackingStore, MemoryStore};
use tiered_cache::{spawn_cleanup_task, Cache, CacheConfig};

/// Main entry point for the cache server.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Connect the backing store and build the cache
/// 4. Start background expiry cleanup task
/// 5. Create Axum router with all endpoints
/// 6. Start HTTP server on configured port
/// 7. Close the cache on SIGINT/SIGTERM
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tiered_cache=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Tiered Cache Server");

    let config = CacheConfig::from_env();
    config.validate()?;
    info!(
        "Configuration loaded: namespace={}, max_entries={}, default_ttl={}s, port={}, cleanup_interval={}s",
        config.namespace,
        config.max_entries,
        config.default_ttl,
        config.server_port,
        config.cleanup_interval
    );

    let store = connect_store(&config).await?;
    let cache = Cache::new(config.clone(), store)?;
    let state = AppState::new(cache.clone())?;
    info!("Cache initialized");

    let _cleanup_handle = spawn_cleanup_task(cache.clone(), config.cleanup_interval);
    info!("Background cleanup task started");

    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cache))
        .await
        .context("server error")?;

    info!("Server shutdown complete");
    Ok(())
}

#[cfg(feature = "redis")]
async fn connect_store(config: &CacheConfig) -> anyhow::Result<Arc<dyn BackingStore>> {
    match &config.redis_url {
        Some(url) => {
            let store = tiered_cache::store::RedisStore::connect(url).await?;
            info!("Backing store: redis");
            Ok(Arc::new(store))
        }
        None => {
            info!("Backing store: in-process memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_store(config: &CacheConfig) -> anyhow::Result<Arc<dyn BackingStore>> {
    if config.redis_url.is_some() {
        warn!("REDIS_URL is set but the redis feature is disabled; using the in-process store");
    }
    info!("Backing store: in-process memory");
    Ok(Arc::new(MemoryStore::new()))
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
///
/// Closing the cache stops the cleanup task and ends every open
/// invalidation stream so the server can drain.
async fn shutdown_signal(cache: Cache) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    cache.close();
    warn!("Cache closed, background tasks stopping");
}
