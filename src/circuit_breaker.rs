//! Circuit breaker shared by every caller of one external service
//!
//! One instance per service, owned by the service root and passed around as
//! `Arc<CircuitBreaker>`. The lock is held only for the O(1) state
//! compare/update; network I/O always happens outside it.

use crate::config::BreakerConfig;
use crate::error::ProviderError;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// What the breaker allowed for one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The single recovery trial after an open period
    Trial,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    #[serde(skip)]
    pub last_transition: Instant,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_transition: Instant,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    service: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_transition: Instant::now(),
                trial_in_flight: false,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_transition: inner.last_transition,
        }
    }

    /// Decide whether a call may go out. Never blocks.
    pub fn admit(&self) -> Result<Admission, ProviderError> {
        let recovery = self.config.recovery_timeout();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                if inner.last_transition.elapsed() < recovery {
                    return Err(self.open_error());
                }
                inner.state = CircuitState::HalfOpen;
                inner.last_transition = Instant::now();
                inner.trial_in_flight = true;
                drop(inner);
                info!("Circuit {} half-open, sending recovery trial", self.service);
                Ok(Admission::Trial)
            }
            CircuitState::HalfOpen => {
                // A trial whose caller went away never reports back; let a new
                // one through once another recovery window has passed.
                if inner.trial_in_flight && inner.last_transition.elapsed() < recovery {
                    return Err(self.open_error());
                }
                inner.trial_in_flight = true;
                inner.last_transition = Instant::now();
                Ok(Admission::Trial)
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
        if inner.state != CircuitState::Closed {
            inner.state = CircuitState::Closed;
            inner.last_transition = Instant::now();
            drop(inner);
            info!("Circuit {} closed after successful trial", self.service);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.trial_in_flight = false;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.last_transition = Instant::now();
                drop(inner);
                warn!("Circuit {} trial failed, re-opening", self.service);
            }
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                inner.last_transition = Instant::now();
                let failures = inner.consecutive_failures;
                drop(inner);
                warn!(
                    "Circuit {} opened after {} consecutive failures",
                    self.service, failures
                );
            }
            _ => {}
        }
    }

    fn open_error(&self) -> ProviderError {
        ProviderError::CircuitOpen {
            service: self.service.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout_ms: recovery_ms,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold() {
        let cb = breaker(3, 1_000);
        for _ in 0..2 {
            cb.admit().unwrap();
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.admit().unwrap();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.admit().unwrap_err().is_circuit_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 1_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_one_trial_after_recovery_timeout() {
        let cb = breaker(1, 1_000);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(cb.admit().is_err());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cb.admit().unwrap(), Admission::Trial);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Second caller while the trial is in flight is rejected
        assert!(cb.admit().unwrap_err().is_circuit_open());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
        assert_eq!(cb.admit().unwrap(), Admission::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_and_resets_timer() {
        let cb = breaker(1, 1_000);
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(cb.admit().unwrap(), Admission::Trial);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(cb.admit().is_err());
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(cb.admit().unwrap(), Admission::Trial);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_is_replaced_after_another_window() {
        let cb = breaker(1, 1_000);
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(cb.admit().unwrap(), Admission::Trial);
        // Trial caller never reports back
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(cb.admit().unwrap(), Admission::Trial);
    }
}
