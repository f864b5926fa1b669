//! Retry with capped exponential backoff, run under a circuit breaker

use crate::circuit_breaker::{Admission, CircuitBreaker};
use crate::config::RetryConfig;
use crate::error::ProviderError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): base * 2^retry, capped, ±50% jitter
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_delay);
        let jitter: f64 = rand::rng().random_range(0.5..=1.5);
        exp.mul_f64(jitter)
    }

    /// Same policy with another per-attempt bound
    pub fn with_attempt_timeout(&self, attempt_timeout: Duration) -> Self {
        Self {
            attempt_timeout,
            ..self.clone()
        }
    }
}

/// Settles the breaker for one logical call. A call dropped before it reports
/// (caller timeout, cancelled request) is counted as a failure, which also
/// releases a half-open trial.
struct PendingOutcome<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl<'a> PendingOutcome<'a> {
    fn new(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            settled: false,
        }
    }

    fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for PendingOutcome<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("{} call abandoned before completing", self.breaker.service());
            self.breaker.record_failure();
        }
    }
}

/// Run `op` under the breaker with retries.
///
/// The breaker sees one outcome per call, after retries are exhausted.
/// `CircuitOpen` is returned immediately without invoking `op`. A half-open
/// trial gets a single attempt. With a `deadline`, every attempt is clamped
/// to the time left and no retry starts once its backoff would pass it.
pub async fn call_guarded<T, F, Fut>(
    breaker: &CircuitBreaker,
    policy: &RetryPolicy,
    deadline: Option<Instant>,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let service = breaker.service();
    if deadline.is_some_and(|d| d <= Instant::now()) {
        return Err(ProviderError::transient(service, "no time left for a call"));
    }
    let admission = breaker.admit()?;
    let pending = PendingOutcome::new(breaker);
    let mut attempt: u32 = 0;

    let err = loop {
        let attempt_timeout = match deadline {
            Some(d) => policy
                .attempt_timeout
                .min(d.saturating_duration_since(Instant::now())),
            None => policy.attempt_timeout,
        };
        let outcome = match tokio::time::timeout(attempt_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::transient(
                service,
                format!("attempt timed out after {}ms", attempt_timeout.as_millis()),
            )),
        };

        match outcome {
            Ok(value) => {
                pending.success();
                return Ok(value);
            }
            Err(e @ ProviderError::Rejected { .. }) => {
                // The service answered; a bad request says nothing about its health
                pending.success();
                return Err(e);
            }
            Err(e) => {
                let give_up =
                    !e.is_retryable() || attempt >= policy.max_retries || admission == Admission::Trial;
                if give_up {
                    break e;
                }
                let delay = policy.backoff_delay(attempt);
                if deadline.is_some_and(|d| Instant::now() + delay >= d) {
                    debug!("{} out of time for retry {}", service, attempt + 1);
                    break e;
                }
                debug!(
                    "{} attempt {} failed ({}), retrying in {}ms",
                    service,
                    attempt + 1,
                    e,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    };

    warn!("{} call failed after {} attempt(s): {}", service, attempt + 1, err);
    pending.failure();
    Err(err)
}
