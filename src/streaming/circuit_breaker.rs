//! Per-stream circuit breaker for upstream reconnection.
//!
//! Chronic upstream failure must not turn the reconnect loop into a
//! hammering loop. After `failure_threshold` consecutive failures the
//! breaker opens and short-circuits every call until the cooldown elapses;
//! it then admits a bounded number of half-open probes whose first result
//! decides whether the circuit closes again or re-opens.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Error, Debug)]
pub enum CircuitBreakerError {
    /// The breaker is open (or its half-open probe quota is exhausted) and
    /// the operation was not attempted.
    #[error("circuit breaker is open")]
    Open,
    /// The operation ran and failed.
    #[error("{0}")]
    Service(String),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_in_flight: 0,
            }),
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// Closed: the operation runs; failures accumulate toward the threshold.
    /// Open: short-circuits with [`CircuitBreakerError::Open`] unless the
    /// cooldown has elapsed, in which case the call becomes a half-open
    /// probe. HalfOpen: at most `half_open_max_probes` operations run
    /// concurrently; the rest short-circuit.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        let probe = self.begin_call()?;
        match operation().await {
            Ok(value) => {
                self.record_success(probe);
                Ok(value)
            }
            Err(message) => {
                self.record_failure(probe);
                Err(CircuitBreakerError::Service(message))
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().expect("circuit breaker lock poisoned").state
    }

    /// Bring the breaker back to Closed with a clean slate.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("circuit breaker lock poisoned");
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.half_open_in_flight = 0;
    }

    /// The configured open-state cooldown; the reconnect loop sleeps this
    /// long when it finds the breaker open.
    pub fn cooldown(&self) -> Duration {
        self.config.cooldown
    }

    /// Admission check. Returns whether the admitted call is a half-open
    /// probe, or the sentinel error if the call must not run.
    fn begin_call(&self) -> Result<bool, CircuitBreakerError> {
        let mut state = self.state.lock().expect("circuit breaker lock poisoned");
        match state.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed_cooldown = state
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(false);
                if elapsed_cooldown {
                    info!("circuit breaker transitioning from Open to HalfOpen");
                    state.state = CircuitState::HalfOpen;
                    state.half_open_in_flight = 1;
                    Ok(true)
                } else {
                    Err(CircuitBreakerError::Open)
                }
            }
            CircuitState::HalfOpen => {
                if state.half_open_in_flight >= self.config.half_open_max_probes {
                    Err(CircuitBreakerError::Open)
                } else {
                    state.half_open_in_flight += 1;
                    Ok(true)
                }
            }
        }
    }

    fn record_success(&self, probe: bool) {
        let mut state = self.state.lock().expect("circuit breaker lock poisoned");
        if probe {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
        state.consecutive_failures = 0;
        if state.state != CircuitState::Closed {
            info!("circuit breaker transitioning to Closed after successful probe");
            state.state = CircuitState::Closed;
            state.opened_at = None;
        }
    }

    fn record_failure(&self, probe: bool) {
        let mut state = self.state.lock().expect("circuit breaker lock poisoned");
        if probe {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
        state.consecutive_failures += 1;
        match state.state {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        failures = state.consecutive_failures,
                        "circuit breaker opening after consecutive failures"
                    );
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!("circuit breaker reopening after failed probe");
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {
                // A straggler that started before the breaker opened; just
                // restart the cooldown clock.
                state.opened_at = Some(Instant::now());
            }
        }
    }
}
