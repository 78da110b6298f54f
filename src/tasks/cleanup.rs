//! Expiry Cleanup Task
//!
//! Background task that periodically purges expired local entries and
//! reconciles tag index mappings whose entries can no longer be alive.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::engine::Cache;

/// Spawns a background task that periodically cleans up expired cache state.
///
/// The task sleeps for the specified interval between runs and exits on its
/// own once [`Cache::close`] is called.
///
/// # Arguments
/// * `cache` - Handle to the cache to maintain
/// * `cleanup_interval_secs` - Interval in seconds between cleanup runs
///
/// # Returns
/// A JoinHandle for the spawned task.
pub fn spawn_cleanup_task(cache: Cache, cleanup_interval_secs: u64) -> JoinHandle<()> {
    let interval = Duration::from_secs(cleanup_interval_secs.max(1));
    let mut shutdown = cache.shutdown_signal();

    tokio::spawn(async move {
        info!(
            "Starting expiry cleanup task with interval of {} seconds",
            interval.as_secs()
        );

        loop {
            let closed = *shutdown.borrow();
            if closed {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let (local, indexed) = cache.purge_expired();
            if local > 0 || indexed > 0 {
                info!(
                    "Expiry cleanup: removed {} local entries, {} index mappings",
                    local, indexed
                );
            } else {
                debug!("Expiry cleanup: nothing expired");
            }
        }

        info!("Expiry cleanup task stopped");
    })
}
