//! Single-Flight Coordinator
//!
//! At most one population per key is in flight at any time. Every caller for
//! that key parks on the same pending request and receives the same result.
//!
//! The population itself runs on a spawned task, so a caller giving up (for
//! example through a timeout higher up) never cancels work other callers are
//! still waiting for.

use std::collections::HashMap;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};

type Pending<V> = watch::Receiver<Option<Result<V>>>;

// == Single Flight ==
pub struct SingleFlight<V> {
    pending: Arc<Mutex<HashMap<String, Pending<V>>>>,
}

impl<V> SingleFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Joins the population for `key`, starting it with `work` if none is in flight.
    ///
    /// `work` is only invoked by the caller that starts the flight.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let (receiver, _) = self.join(key, work);
        Self::wait(receiver).await
    }

    /// Starts a population for `key` unless one is already in flight, without waiting.
    ///
    /// Returns true when this call started the flight.
    pub fn spawn<F, Fut>(&self, key: &str, work: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let (_, started) = self.join(key, work);
        started
    }

    /// Returns true while a population for `key` is in flight.
    pub fn in_flight(&self, key: &str) -> bool {
        self.pending.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    fn join<F, Fut>(&self, key: &str, work: F) -> (Pending<V>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let mut pending = self.pending.lock();
        if let Some(receiver) = pending.get(key) {
            debug!(key = %key, "joining in-flight population");
            return (receiver.clone(), false);
        }

        let (sender, receiver) = watch::channel(None);
        pending.insert(key.to_string(), receiver.clone());
        drop(pending);

        let table = Arc::clone(&self.pending);
        let owned_key = key.to_string();
        let fut = work();
        tokio::spawn(async move {
            // A panicking population settles like a failed one
            let result = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(key = %owned_key, panic = %message, "population panicked");
                    Err(CacheError::FetchFailed(format!("fetch panicked: {}", message)))
                }
            };
            table.lock().remove(&owned_key);
            // Nobody may be listening any more; the work has still been done.
            let _ = sender.send(Some(result));
        });

        (receiver, true)
    }

    async fn wait(mut receiver: Pending<V>) -> Result<V> {
        match receiver.wait_for(Option::is_some).await {
            Ok(settled) => match settled.as_ref() {
                Some(result) => result.clone(),
                None => Err(CacheError::FetchFailed("population settled empty".into())),
            },
            Err(_) => Err(CacheError::FetchFailed(
                "population task ended without a result".into(),
            )),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<V> Default for SingleFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> std::fmt::Debug for SingleFlight<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.pending.lock().len())
            .finish()
    }
}
