//! Per-backend circuit breaker
//!
//! Each backend has one breaker moving between three states:
//!
//! - **Closed**: calls pass through. `failure_threshold` consecutive failures
//!   open the circuit.
//! - **Open**: calls fail fast with `BackendError::CircuitOpen` without
//!   contacting the backend. Once `open_timeout_ms` has elapsed the next call
//!   becomes a trial and the breaker moves to HalfOpen.
//! - **HalfOpen**: exactly one trial call is in flight at a time; concurrent
//!   callers are rejected. `success_threshold` consecutive trial successes
//!   close the circuit, any trial failure reopens it.
//!
//! Admission happens under the breaker's mutex and produces a
//! [`BreakerPermit`]. The permit remembers the state generation it was issued
//! under, so an outcome from a call admitted before a transition is ignored.
//! A permit dropped without an outcome (the caller's future was cancelled)
//! frees the trial slot and records nothing.

use crate::config::CircuitBreakerConfig;
use crate::error::{BackendError, BreakerVerdict};
use crate::metrics::{Metrics, log_recording_failure};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Retry hint given to callers rejected while a trial is in flight
const HALF_OPEN_RETRY_HINT_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Convert state to Prometheus label string
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    pub(crate) fn gauge_value(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    /// Bumped on every transition; permits from older generations are stale
    generation: u64,
}

impl Inner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            trial_in_flight: false,
            generation: 0,
        }
    }
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub backend: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

pub struct CircuitBreaker {
    backend: String,
    failure_threshold: u32,
    success_threshold: u32,
    open_timeout: Duration,
    inner: Mutex<Inner>,
    metrics: Metrics,
}

impl CircuitBreaker {
    pub fn new(backend: impl Into<String>, config: &CircuitBreakerConfig, metrics: Metrics) -> Self {
        let backend = backend.into();
        log_recording_failure(
            &metrics,
            "set_circuit_state",
            metrics.set_circuit_state(&backend, CircuitState::Closed),
        );
        Self {
            backend,
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            open_timeout: Duration::from_millis(config.open_timeout_ms),
            inner: Mutex::new(Inner::closed()),
            metrics,
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a call attempted now would be rejected
    ///
    /// An Open breaker whose timeout has elapsed is not rejecting: the next
    /// call becomes its trial.
    pub fn is_rejecting(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => inner
                .opened_at
                .is_some_and(|at| at.elapsed() < self.open_timeout),
            CircuitState::HalfOpen => inner.trial_in_flight,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            backend: self.backend.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
        }
    }

    /// Run `f` through the breaker
    ///
    /// Fails fast with `CircuitOpen` (without calling `f`) while the circuit
    /// is open or a half-open trial is already in flight. Otherwise the
    /// outcome of `f` updates the breaker according to
    /// [`BackendError::breaker_verdict`].
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T, BackendError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let permit = self.try_acquire()?;
        let result = f().await;
        let verdict = match &result {
            Ok(_) => BreakerVerdict::Success,
            Err(e) => e.breaker_verdict(),
        };
        permit.settle(verdict);
        result
    }

    /// Admit one call, or reject it with a retry hint
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, BackendError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(self.permit(inner.generation, false)),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(self.open_timeout);
                if elapsed < self.open_timeout {
                    let remaining = self.open_timeout - elapsed;
                    return Err(self.rejection(remaining.as_millis().max(1) as u64));
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.trial_in_flight = true;
                Ok(self.permit(inner.generation, true))
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(self.rejection(HALF_OPEN_RETRY_HINT_MS));
                }
                inner.trial_in_flight = true;
                Ok(self.permit(inner.generation, true))
            }
        }
    }

    /// Return the breaker to Closed with zeroed counters
    pub fn reset(&self) {
        let mut inner = self.lock();
        let generation = inner.generation + 1;
        *inner = Inner::closed();
        inner.generation = generation;
        log_recording_failure(
            &self.metrics,
            "set_circuit_state",
            self.metrics.set_circuit_state(&self.backend, CircuitState::Closed),
        );
    }

    fn permit(&self, generation: u64, trial: bool) -> BreakerPermit<'_> {
        BreakerPermit {
            breaker: self,
            generation,
            trial,
            settled: false,
        }
    }

    fn rejection(&self, retry_after_ms: u64) -> BackendError {
        BackendError::CircuitOpen {
            backend: self.backend.clone(),
            retry_after_ms,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, generation: u64, trial: bool, verdict: BreakerVerdict) {
        let mut inner = self.lock();
        if inner.generation != generation {
            tracing::debug!(
                backend = %self.backend,
                verdict = ?verdict,
                "Ignoring outcome admitted under an earlier breaker state"
            );
            return;
        }
        if trial {
            inner.trial_in_flight = false;
        }

        match (inner.state, verdict) {
            (_, BreakerVerdict::Neutral) => {}
            (CircuitState::Closed, BreakerVerdict::Success) => {
                inner.consecutive_failures = 0;
            }
            (CircuitState::Closed, BreakerVerdict::Failure) => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                if inner.consecutive_failures >= self.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            (CircuitState::HalfOpen, BreakerVerdict::Success) => {
                inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
                if inner.consecutive_successes >= self.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            (CircuitState::HalfOpen, BreakerVerdict::Failure) => {
                self.transition(&mut inner, CircuitState::Open);
            }
            // Open admits no calls, so no current-generation outcome lands here
            (CircuitState::Open, _) => {}
        }
    }

    fn release_unsettled(&self, generation: u64, trial: bool) {
        if !trial {
            return;
        }
        let mut inner = self.lock();
        if inner.generation == generation {
            inner.trial_in_flight = false;
            tracing::debug!(
                backend = %self.backend,
                "Half-open trial cancelled before completing; slot freed"
            );
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.trial_in_flight = false;
        inner.opened_at = match to {
            CircuitState::Open => Some(Instant::now()),
            _ => None,
        };

        match to {
            CircuitState::Open => tracing::warn!(
                backend = %self.backend,
                from = from.as_str(),
                open_timeout_ms = self.open_timeout.as_millis() as u64,
                "Circuit opened; failing fast"
            ),
            CircuitState::HalfOpen => tracing::info!(
                backend = %self.backend,
                "Circuit half-open; admitting one trial call"
            ),
            CircuitState::Closed => tracing::info!(
                backend = %self.backend,
                from = from.as_str(),
                "Circuit closed; backend recovered"
            ),
        }
        log_recording_failure(
            &self.metrics,
            "record_circuit_transition",
            self.metrics.record_circuit_transition(&self.backend, to),
        );
    }
}

/// Admission ticket for one call through a breaker
///
/// Settle it with the call's verdict. Dropping it unsettled frees a trial
/// slot without recording an outcome.
#[must_use = "an unsettled permit records no outcome"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// Whether this permit is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn settle(mut self, verdict: BreakerVerdict) {
        self.settled = true;
        self.breaker.record(self.generation, self.trial, verdict);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release_unsettled(self.generation, self.trial);
        }
    }
}

/// One breaker per configured backend, keyed by backend name
///
/// Built once from configuration and shared through `AppState`.
pub struct BreakerRegistry {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new<'a>(
        backends: impl IntoIterator<Item = &'a str>,
        config: &CircuitBreakerConfig,
        metrics: &Metrics,
    ) -> Self {
        let breakers = backends
            .into_iter()
            .map(|name| {
                (
                    name.to_string(),
                    Arc::new(CircuitBreaker::new(name, config, metrics.clone())),
                )
            })
            .collect();
        Self { breakers }
    }

    pub fn get(&self, backend: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(backend).cloned()
    }

    /// States of every breaker, sorted by backend name
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.backend.cmp(&b.backend));
        snapshots
    }

    /// True when every breaker would reject a call attempted now
    pub fn all_rejecting(&self) -> bool {
        !self.breakers.is_empty() && self.breakers.values().all(|b| b.is_rejecting())
    }

    pub fn reset(&self) {
        for breaker in self.breakers.values() {
            breaker.reset();
        }
    }
}
