use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::time::Instant;

use crate::config::BreakerConfig;
use crate::error::HarvestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Returned instead of calling through while a breaker is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitOpen {
    pub name: String,
}

impl fmt::Display for CircuitOpen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Circuit breaker '{}' is open", self.name)
    }
}

impl From<CircuitOpen> for HarvestError {
    fn from(open: CircuitOpen) -> Self {
        HarvestError::CircuitOpen { name: open.name }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub times_opened: u64,
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    times_opened: u64,
    rejected_calls: u64,
}

/// Failure-protection state machine for one named dependency.
///
/// Closed until `failure_threshold` consecutive failures, then Open. While
/// Open, calls are rejected without running until `timeout` has passed since
/// the last failure; the next call is then let through as a probe
/// (HalfOpen). `success_threshold` consecutive successes close the breaker,
/// any failure reopens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure: None,
                times_opened: 0,
                rejected_calls: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            times_opened: inner.times_opened,
            rejected_calls: inner.rejected_calls,
        }
    }

    /// Run `operation` through the breaker. Every error counts as a failure.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpen>,
    {
        self.call_filtered(operation, |_| true).await
    }

    /// Run `operation` through the breaker, counting only errors for which
    /// `is_failure` returns true. Other errors pass through and leave the
    /// breaker's counters untouched.
    pub async fn call_filtered<T, E, F, Fut, P>(&self, operation: F, is_failure: P) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpen>,
        P: FnOnce(&E) -> bool,
    {
        self.try_acquire()?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                if is_failure(&error) {
                    self.record_failure();
                }
                Err(error)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_acquire(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.lock();
        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let timed_out = inner
            .last_failure
            .map(|at| at.elapsed() >= self.config.timeout())
            .unwrap_or(true);

        if timed_out {
            inner.consecutive_successes = 0;
            self.transition(&mut inner, CircuitState::HalfOpen, "cooldown elapsed, probing");
            Ok(())
        } else {
            inner.rejected_calls += 1;
            tracing::debug!(breaker = %self.name, "Rejecting call while circuit is open");
            Err(CircuitOpen {
                name: self.name.clone(),
            })
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    let reason = format!(
                        "{} consecutive successful probes",
                        self.config.success_threshold
                    );
                    self.transition(&mut inner, CircuitState::Closed, &reason);
                }
            }
            // A call admitted before the breaker opened; it proves nothing.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.last_failure = Some(Instant::now());
        inner.consecutive_successes = 0;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    let reason = format!(
                        "{} consecutive failures reached threshold",
                        inner.consecutive_failures
                    );
                    self.transition(&mut inner, CircuitState::Open, &reason);
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open, "probe failed");
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState, reason: &str) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;

        match to {
            CircuitState::Open => {
                inner.times_opened += 1;
                tracing::warn!(
                    breaker = %self.name,
                    from = %from,
                    to = %to,
                    reason,
                    cooldown_secs = self.config.timeout_secs,
                    "Circuit breaker opened"
                );
            }
            _ => {
                tracing::info!(
                    breaker = %self.name,
                    from = %from,
                    to = %to,
                    reason,
                    "Circuit breaker state change"
                );
            }
        }
    }
}

/// Process-wide set of breakers keyed by dependency name.
///
/// Build one at startup and hand it to call sites behind an `Arc`; breakers
/// are created lazily on first lookup and live as long as the registry.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone()))),
        )
    }

    pub fn snapshot(&self) -> Vec<CircuitBreakerStats> {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut stats: Vec<_> = breakers.values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}
