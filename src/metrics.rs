//! Prometheus metrics collection for Gatehouse
//!
//! This module provides metrics instrumentation for tracking:
//! - Routing decisions by backend and reason
//! - Backend invocation outcomes, failures, latency and retries
//! - Fallback attempts, outcomes and estimated cost savings
//! - Circuit breaker state and transitions
//! - Load shedding and in-flight request count
//! - Streaming relay terminations
//!
//! Metrics are exposed via the `/metrics` endpoint in Prometheus text format.

use crate::error::FailureCategory;
use crate::resilience::circuit_breaker::CircuitState;
use crate::router::RouteReason;
use crate::shedder::ShedReason;
use crate::streaming::RelayTermination;
use prometheus::{
    Counter, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;

/// Invocation outcome enum for type-safe metrics labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    /// Convert outcome to Prometheus label string
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

/// Metrics collector for Gatehouse
///
/// Cheap to clone: every handle shares one registry.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    routing_decisions: IntCounterVec,
    backend_requests: IntCounterVec,
    backend_failures: IntCounterVec,
    backend_latency: HistogramVec,
    backend_retries: IntCounterVec,
    fallback_attempts: IntCounterVec,
    fallback_outcomes: IntCounterVec,
    cost_savings: Counter,
    circuit_state: IntGaugeVec,
    circuit_transitions: IntCounterVec,
    load_shed: IntCounterVec,
    active_requests: IntGauge,
    stream_terminations: IntCounterVec,
    mid_stream_failures: IntCounterVec,
    metrics_recording_failures: IntCounterVec,
}

impl Metrics {
    /// Create a new Metrics instance
    ///
    /// Registers all metrics with a new Prometheus registry.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails (e.g., duplicate names).
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Cardinality: N backends × 4 reasons
        let routing_decisions = IntCounterVec::new(
            Opts::new(
                "gatehouse_routing_decisions_total",
                "Total routing decisions by selected primary backend and reason",
            ),
            &["backend", "reason"],
        )?;

        let backend_requests = IntCounterVec::new(
            Opts::new(
                "gatehouse_backend_requests_total",
                "Total backend invocations by backend and outcome",
            ),
            &["backend", "outcome"],
        )?;

        let backend_failures = IntCounterVec::new(
            Opts::new(
                "gatehouse_backend_failures_total",
                "Total failed backend invocations by backend and failure category",
            ),
            &["backend", "category"],
        )?;

        let backend_latency = HistogramVec::new(
            HistogramOpts::new(
                "gatehouse_backend_latency_ms",
                "Backend invocation latency in milliseconds (until response headers)",
            )
            .buckets(vec![
                10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
                60000.0,
            ]),
            &["backend"],
        )?;

        let backend_retries = IntCounterVec::new(
            Opts::new(
                "gatehouse_backend_retries_total",
                "Total retry attempts (beyond the first) by backend",
            ),
            &["backend"],
        )?;

        // Labels:
        // - from: the failed primary
        // - to: the fallback backend
        // - category: why the primary failed (telemetry only)
        let fallback_attempts = IntCounterVec::new(
            Opts::new(
                "gatehouse_fallback_attempts_total",
                "Total fallback attempts by primary, fallback backend and primary failure category",
            ),
            &["from", "to", "category"],
        )?;

        let fallback_outcomes = IntCounterVec::new(
            Opts::new(
                "gatehouse_fallback_outcomes_total",
                "Total fallback attempt outcomes",
            ),
            &["outcome"],
        )?;

        let cost_savings = Counter::with_opts(Opts::new(
            "gatehouse_estimated_cost_savings_usd_total",
            "Estimated USD saved by serving requests from the local backend instead of the cloud backend",
        ))?;

        // 0 = closed, 1 = half-open, 2 = open
        let circuit_state = IntGaugeVec::new(
            Opts::new(
                "gatehouse_circuit_state",
                "Circuit breaker state per backend (0=closed, 1=half_open, 2=open)",
            ),
            &["backend"],
        )?;

        let circuit_transitions = IntCounterVec::new(
            Opts::new(
                "gatehouse_circuit_transitions_total",
                "Total circuit breaker state transitions by backend and target state",
            ),
            &["backend", "to"],
        )?;

        let load_shed = IntCounterVec::new(
            Opts::new(
                "gatehouse_load_shed_total",
                "Total requests rejected by admission control by reason",
            ),
            &["reason"],
        )?;

        let active_requests = IntGauge::with_opts(Opts::new(
            "gatehouse_active_requests",
            "Requests currently admitted and not yet released",
        ))?;

        let stream_terminations = IntCounterVec::new(
            Opts::new(
                "gatehouse_stream_terminations_total",
                "Total streaming relay terminations by backend and mode",
            ),
            &["backend", "mode"],
        )?;

        // Mid-stream failures do not move breaker state. High rates point at
        // network timeouts or an overloaded backend.
        let mid_stream_failures = IntCounterVec::new(
            Opts::new(
                "gatehouse_mid_stream_failures_total",
                "Total upstream failures after streaming began, by backend",
            ),
            &["backend"],
        )?;

        let metrics_recording_failures = IntCounterVec::new(
            Opts::new(
                "gatehouse_metrics_recording_failures_total",
                "Total number of metrics recording operation failures by operation. \
                Indicates Prometheus internal errors - frequent failures require investigation.",
            ),
            &["operation"],
        )?;

        registry.register(Box::new(routing_decisions.clone()))?;
        registry.register(Box::new(backend_requests.clone()))?;
        registry.register(Box::new(backend_failures.clone()))?;
        registry.register(Box::new(backend_latency.clone()))?;
        registry.register(Box::new(backend_retries.clone()))?;
        registry.register(Box::new(fallback_attempts.clone()))?;
        registry.register(Box::new(fallback_outcomes.clone()))?;
        registry.register(Box::new(cost_savings.clone()))?;
        registry.register(Box::new(circuit_state.clone()))?;
        registry.register(Box::new(circuit_transitions.clone()))?;
        registry.register(Box::new(load_shed.clone()))?;
        registry.register(Box::new(active_requests.clone()))?;
        registry.register(Box::new(stream_terminations.clone()))?;
        registry.register(Box::new(mid_stream_failures.clone()))?;
        registry.register(Box::new(metrics_recording_failures.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            routing_decisions,
            backend_requests,
            backend_failures,
            backend_latency,
            backend_retries,
            fallback_attempts,
            fallback_outcomes,
            cost_savings,
            circuit_state,
            circuit_transitions,
            load_shed,
            active_requests,
            stream_terminations,
            mid_stream_failures,
            metrics_recording_failures,
        })
    }

    /// Record a routing decision
    ///
    /// Backend names come from configuration, so cardinality is bounded.
    pub fn record_routing_decision(
        &self,
        backend: &str,
        reason: RouteReason,
    ) -> Result<(), prometheus::Error> {
        self.routing_decisions
            .get_metric_with_label_values(&[backend, reason.as_str()])?
            .inc();
        Ok(())
    }

    /// Record the outcome and latency of one backend invocation
    ///
    /// # Errors
    ///
    /// Returns an error if `latency_ms` is NaN, infinite or negative. Such
    /// values corrupt histogram percentiles.
    pub fn record_backend_request(
        &self,
        backend: &str,
        outcome: Outcome,
        latency_ms: f64,
    ) -> Result<(), prometheus::Error> {
        validate_observation("latency_ms", latency_ms)?;
        self.backend_requests
            .get_metric_with_label_values(&[backend, outcome.as_str()])?
            .inc();
        self.backend_latency
            .get_metric_with_label_values(&[backend])?
            .observe(latency_ms);
        Ok(())
    }

    /// Record the category of a failed backend invocation
    pub fn record_backend_failure(
        &self,
        backend: &str,
        category: FailureCategory,
    ) -> Result<(), prometheus::Error> {
        self.backend_failures
            .get_metric_with_label_values(&[backend, category.as_str()])?
            .inc();
        Ok(())
    }

    /// Record one retry (an attempt beyond the first)
    pub fn record_retry(&self, backend: &str) -> Result<(), prometheus::Error> {
        self.backend_retries
            .get_metric_with_label_values(&[backend])?
            .inc();
        Ok(())
    }

    pub fn record_fallback_attempt(
        &self,
        from: &str,
        to: &str,
        category: FailureCategory,
    ) -> Result<(), prometheus::Error> {
        self.fallback_attempts
            .get_metric_with_label_values(&[from, to, category.as_str()])?
            .inc();
        Ok(())
    }

    pub fn record_fallback_outcome(&self, outcome: Outcome) -> Result<(), prometheus::Error> {
        self.fallback_outcomes
            .get_metric_with_label_values(&[outcome.as_str()])?
            .inc();
        Ok(())
    }

    /// Add to the estimated cost savings counter
    ///
    /// # Errors
    ///
    /// Returns an error if `usd` is NaN, infinite or negative.
    pub fn record_cost_savings(&self, usd: f64) -> Result<(), prometheus::Error> {
        validate_observation("usd", usd)?;
        self.cost_savings.inc_by(usd);
        Ok(())
    }

    /// Record a circuit breaker moving to `to`
    pub fn record_circuit_transition(
        &self,
        backend: &str,
        to: CircuitState,
    ) -> Result<(), prometheus::Error> {
        self.circuit_transitions
            .get_metric_with_label_values(&[backend, to.as_str()])?
            .inc();
        self.set_circuit_state(backend, to)
    }

    /// Publish a breaker's current state without counting a transition
    pub fn set_circuit_state(
        &self,
        backend: &str,
        state: CircuitState,
    ) -> Result<(), prometheus::Error> {
        self.circuit_state
            .get_metric_with_label_values(&[backend])?
            .set(state.gauge_value());
        Ok(())
    }

    pub fn record_load_shed(&self, reason: ShedReason) -> Result<(), prometheus::Error> {
        self.load_shed
            .get_metric_with_label_values(&[reason.as_str()])?
            .inc();
        Ok(())
    }

    /// Track one admission in the in-flight gauge
    pub fn active_request_admitted(&self) {
        self.active_requests.inc();
    }

    /// Track one release in the in-flight gauge
    pub fn active_request_released(&self) {
        self.active_requests.dec();
    }

    pub fn record_stream_termination(
        &self,
        backend: &str,
        mode: RelayTermination,
    ) -> Result<(), prometheus::Error> {
        self.stream_terminations
            .get_metric_with_label_values(&[backend, mode.as_str()])?
            .inc();
        Ok(())
    }

    /// Record an upstream failure after streaming began
    pub fn mid_stream_failure(&self, backend: &str) {
        self.mid_stream_failures
            .with_label_values(&[backend])
            .inc();
    }

    /// Record a metrics recording operation failure
    ///
    /// Called by code paths whose `record_*` call returned an error. The
    /// request continues normally; metrics are non-critical to functionality.
    pub fn metrics_recording_failure(&self, operation: &str) {
        self.metrics_recording_failures
            .with_label_values(&[operation])
            .inc();
    }

    /// Current count of fallback outcomes with the given label
    pub fn fallback_outcome_count(&self, outcome: Outcome) -> u64 {
        self.fallback_outcomes
            .get_metric_with_label_values(&[outcome.as_str()])
            .map(|c| c.get())
            .unwrap_or(0)
    }

    /// Total fallback attempts across all labels
    pub fn fallback_attempts_count(&self) -> u64 {
        self.sum_family("gatehouse_fallback_attempts_total")
    }

    pub fn backend_requests_count(&self, backend: &str, outcome: Outcome) -> u64 {
        self.backend_requests
            .get_metric_with_label_values(&[backend, outcome.as_str()])
            .map(|c| c.get())
            .unwrap_or(0)
    }

    pub fn backend_failures_count(&self, backend: &str, category: FailureCategory) -> u64 {
        self.backend_failures
            .get_metric_with_label_values(&[backend, category.as_str()])
            .map(|c| c.get())
            .unwrap_or(0)
    }

    /// Total retries recorded for `backend`
    pub fn retries_count(&self, backend: &str) -> u64 {
        self.backend_retries
            .get_metric_with_label_values(&[backend])
            .map(|c| c.get())
            .unwrap_or(0)
    }

    pub fn load_shed_count(&self, reason: ShedReason) -> u64 {
        self.load_shed
            .get_metric_with_label_values(&[reason.as_str()])
            .map(|c| c.get())
            .unwrap_or(0)
    }

    pub fn stream_termination_count(&self, backend: &str, mode: RelayTermination) -> u64 {
        self.stream_terminations
            .get_metric_with_label_values(&[backend, mode.as_str()])
            .map(|c| c.get())
            .unwrap_or(0)
    }

    pub fn active_requests(&self) -> i64 {
        self.active_requests.get()
    }

    pub fn cost_savings_usd(&self) -> f64 {
        self.cost_savings.get()
    }

    /// Get the current count of metrics recording failures across all operations
    pub fn metrics_recording_failures_count(&self) -> u64 {
        self.sum_family("gatehouse_metrics_recording_failures_total")
    }

    fn sum_family(&self, name: &str) -> u64 {
        let metric_families = self.registry.gather();
        metric_families
            .iter()
            .find(|mf| mf.name() == name)
            .map(|mf| {
                mf.get_metric()
                    .iter()
                    .map(|m| m.counter.value.unwrap_or(0.0) as u64)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Gather all metrics and encode them in Prometheus text format
    ///
    /// # Errors
    ///
    /// Returns an error if metric encoding fails.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let metric_families = self.registry.gather();
        let metric_count = metric_families.len();

        tracing::debug!(
            metric_family_count = metric_count,
            "Encoding metrics to Prometheus text format"
        );

        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();

        encoder.encode(&metric_families, &mut buffer).map_err(|e| {
            tracing::error!(
                error = %e,
                metric_family_count = metric_count,
                "Prometheus text encoder failed"
            );
            prometheus::Error::Msg(format!(
                "Failed to encode {} metric families: {}",
                metric_count, e
            ))
        })?;

        String::from_utf8(buffer).map_err(|e| {
            let valid_up_to = e.utf8_error().valid_up_to();
            tracing::error!(
                invalid_byte_index = valid_up_to,
                "Prometheus encoder produced invalid UTF-8"
            );
            prometheus::Error::Msg(format!(
                "Failed to convert metrics to UTF-8 at byte {}: {}",
                valid_up_to, e
            ))
        })
    }
}

fn validate_observation(name: &str, value: f64) -> Result<(), prometheus::Error> {
    if !value.is_finite() {
        return Err(prometheus::Error::Msg(format!(
            "{} must be finite (not NaN or Infinity), got: {}",
            name, value
        )));
    }
    if value < 0.0 {
        return Err(prometheus::Error::Msg(format!(
            "{} must be non-negative, got: {}",
            name, value
        )));
    }
    Ok(())
}

/// Log and count a failed `record_*` call
///
/// Metrics never fail a request, so recording errors end here.
pub fn log_recording_failure(
    metrics: &Metrics,
    operation: &'static str,
    result: Result<(), prometheus::Error>,
) {
    if let Err(e) = result {
        tracing::error!(
            error = %e,
            operation,
            "Metrics recording failed - observability degraded"
        );
        metrics.metrics_recording_failure(operation);
    }
}
