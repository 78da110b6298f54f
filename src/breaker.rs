//! Circuit Breaker Module
//!
//! Fail-fast gate in front of every backing store call.
//!
//! ```text
//! Closed --(threshold consecutive failures)--> Open
//! Open --(timeout elapsed)--> HalfOpen
//! HalfOpen --(all trial calls succeed)--> Closed
//! HalfOpen --(any trial call fails)--> Open
//! ```

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

// == Circuit State ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected without contacting the store
    Open,
    /// A limited number of trial calls probe the store
    HalfOpen,
}

// == Breaker Config ==
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub threshold: u32,
    /// How long the circuit stays open before probing
    pub timeout: Duration,
    /// Trial calls admitted while half-open
    pub half_open_requests: u32,
    /// Per-call deadline; exceeding it counts as a failure
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            timeout: Duration::from_secs(30),
            half_open_requests: 1,
            call_timeout: Duration::from_secs(1),
        }
    }
}

impl From<&CacheConfig> for BreakerConfig {
    fn from(config: &CacheConfig) -> Self {
        Self {
            threshold: config.breaker_threshold.max(1),
            timeout: Duration::from_millis(config.breaker_timeout_ms),
            half_open_requests: config.half_open_requests.max(1),
            call_timeout: config.store_timeout(),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<u64>,
    trials_admitted: u32,
    trials_succeeded: u32,
}

// == Circuit Breaker ==
/// Tracks backing store health and gates traffic.
///
/// One breaker is shared by every backing store call of a cache instance.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trials_admitted: 0,
                trials_succeeded: 0,
            }),
        }
    }

    /// Current state, applying the Open -> HalfOpen transition if the timeout has passed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    // == Admission ==
    /// Asks permission for one call. Rejected calls never reach the store.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(CacheError::BreakerOpen),
            CircuitState::HalfOpen => {
                if inner.trials_admitted < self.config.half_open_requests {
                    inner.trials_admitted += 1;
                    Ok(())
                } else {
                    Err(CacheError::BreakerOpen)
                }
            }
        }
    }

    // == Outcomes ==
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.trials_succeeded += 1;
                if inner.trials_succeeded >= self.config.half_open_requests {
                    debug!("circuit breaker closed after successful trial calls");
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    inner.trials_admitted = 0;
                    inner.trials_succeeded = 0;
                }
            }
            // A call admitted before the circuit opened; its outcome is moot
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = self.clock.now_ms();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        "circuit breaker opened, backing store calls will fail fast"
                    );
                    self.open(&mut inner, now);
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures += 1;
                warn!("circuit breaker trial call failed, reopening");
                self.open(&mut inner, now);
            }
            CircuitState::Open => {}
        }
    }

    /// Runs `op` behind the breaker with the per-call timeout.
    ///
    /// Only [`CacheError::BackingStoreUnavailable`] failures (timeouts included)
    /// count against the breaker.
    pub async fn call<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.try_acquire()?;

        let outcome = match tokio::time::timeout(self.config.call_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::BackingStoreUnavailable(format!(
                "call timed out after {:?}",
                self.config.call_timeout
            ))),
        };

        match &outcome {
            Err(e) if e.is_store_failure() => self.record_failure(),
            _ => self.record_success(),
        }
        outcome
    }

    fn open(&self, inner: &mut BreakerInner, now: u64) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.trials_admitted = 0;
        inner.trials_succeeded = 0;
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let now = self.clock.now_ms();
        let opened_at = inner.opened_at.unwrap_or(now);
        if now.saturating_sub(opened_at) >= self.config.timeout.as_millis() as u64 {
            debug!("circuit breaker half-open, admitting trial calls");
            inner.state = CircuitState::HalfOpen;
            inner.trials_admitted = 0;
            inner.trials_succeeded = 0;
        }
    }
}
