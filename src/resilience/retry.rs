//! Bounded retry with exponential backoff and jitter
//!
//! Applied to non-streaming backend calls only. The circuit breaker wraps the
//! whole retried call, so it observes one logical outcome per request.

use crate::config::RetryConfig;
use crate::error::BackendError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Retry parameters, taken from the validated `[retry]` section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: 1,
            max_delay_ms: 1,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Un-jittered delay before retry `retry` (0-indexed)
    ///
    /// `min(max_delay_ms, initial_delay_ms * 2^retry)` with saturating math so
    /// large retry indices cannot overflow.
    pub fn base_delay_ms(&self, retry: u32) -> u64 {
        self.initial_delay_ms
            .saturating_mul(2_u64.saturating_pow(retry))
            .min(self.max_delay_ms)
    }

    /// Delay before retry `retry`, scaled by a uniform jitter in [0.5, 1.5]
    pub fn jittered_delay(&self, retry: u32) -> Duration {
        let base = self.base_delay_ms(retry) as f64;
        let jitter: f64 = rand::rng().random_range(0.5..=1.5);
        Duration::from_millis((base * jitter).round() as u64)
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries(),
            initial_delay_ms: config.initial_delay_ms(),
            max_delay_ms: config.max_delay_ms(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are exhausted
///
/// `op` receives the 0-indexed attempt number. After the final attempt the
/// last error is returned unchanged.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, BackendError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.jittered_delay(attempt);
                tracing::warn!(
                    backend = %e.backend(),
                    error = %e,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Backend call failed with retryable error, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        backend = %e.backend(),
                        error = %e,
                        attempts = attempt + 1,
                        "Backend call failed after exhausting retries"
                    );
                }
                return Err(e);
            }
        }
    }
}
