//! Primary-then-fallback invocation
//!
//! The coordinator routes a request, calls the primary backend through its
//! circuit breaker (with retry for non-streaming calls) and, when the primary
//! is the preferred local backend and fallback is enabled, retries the whole
//! call once against the fallback backend through that backend's own breaker.
//!
//! Failure categories are recorded for telemetry only. Any failure of the
//! local primary is eligible for fallback, including client errors.

use crate::backends::{BackendInvoker, BackendResponse, HttpInvoker};
use crate::config::Config;
use crate::error::{AppResult, BackendError, FailureCategory};
use crate::handlers::types::GatewayRequest;
use crate::metrics::{Metrics, Outcome, log_recording_failure};
use crate::middleware::RequestId;
use crate::resilience::{BreakerRegistry, RetryPolicy, with_retry};
use crate::router::{ProviderRouter, RoutingDecision, estimate_tokens};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// The primary a fallback response replaced
#[derive(Debug, Clone)]
pub struct FallbackOrigin {
    pub backend: String,
    pub category: FailureCategory,
}

/// A successful call, possibly served by the fallback backend
#[derive(Debug)]
pub struct AttemptOutcome {
    /// The backend that actually produced `response`
    pub backend: String,
    /// Time until the backend's response (headers, for streams)
    pub latency_ms: f64,
    pub response: BackendResponse,
    pub fallback_from: Option<FallbackOrigin>,
}

pub struct FallbackCoordinator {
    router: ProviderRouter,
    breakers: Arc<BreakerRegistry>,
    invokers: HashMap<String, Arc<dyn BackendInvoker>>,
    retry: RetryPolicy,
    metrics: Metrics,
    cloud_cost_per_million: f64,
}

impl FallbackCoordinator {
    /// Build a coordinator with explicitly provided invokers
    pub fn new(
        config: &Config,
        invokers: HashMap<String, Arc<dyn BackendInvoker>>,
        breakers: Arc<BreakerRegistry>,
        metrics: Metrics,
    ) -> Self {
        let cloud_cost_per_million = config
            .backend(&config.routing.cloud_backend)
            .map_or(0.0, |b| b.cost_per_million_input_tokens());
        Self {
            router: ProviderRouter::new(config, metrics.clone()),
            breakers,
            invokers,
            retry: config.retry.into(),
            metrics,
            cloud_cost_per_million,
        }
    }

    /// Build a coordinator with one `HttpInvoker` per configured backend
    pub fn from_config(
        config: &Config,
        breakers: Arc<BreakerRegistry>,
        metrics: Metrics,
    ) -> AppResult<Self> {
        let mut invokers: HashMap<String, Arc<dyn BackendInvoker>> = HashMap::new();
        for identity in &config.backends {
            let invoker = HttpInvoker::new(identity.clone())?;
            invokers.insert(identity.name().to_string(), Arc::new(invoker));
        }
        Ok(Self::new(config, invokers, breakers, metrics))
    }

    pub fn router(&self) -> &ProviderRouter {
        &self.router
    }

    /// Route and invoke, falling back from the local backend when eligible
    ///
    /// # Errors
    ///
    /// Returns the primary's error when fallback is not eligible, otherwise
    /// the fallback backend's error.
    pub async fn invoke(
        &self,
        request: &GatewayRequest,
        request_id: RequestId,
    ) -> Result<AttemptOutcome, BackendError> {
        let decision = self.router.route(request.tool_count());

        let primary_error = match self.attempt(&decision.primary, request, request_id).await {
            Ok(outcome) => {
                self.record_savings(&decision, request, request_id);
                return Ok(outcome);
            }
            Err(e) => e,
        };

        let Some(fallback) = self.fallback_target(&decision, request) else {
            tracing::warn!(
                request_id = %request_id,
                backend = %decision.primary,
                error = %primary_error,
                "Primary backend failed; fallback not eligible"
            );
            return Err(primary_error);
        };

        let category = primary_error.category();
        tracing::warn!(
            request_id = %request_id,
            from = %decision.primary,
            to = %fallback,
            category = category.as_str(),
            error = %primary_error,
            "Local backend failed; falling back"
        );
        log_recording_failure(
            &self.metrics,
            "record_fallback_attempt",
            self.metrics
                .record_fallback_attempt(&decision.primary, fallback, category),
        );

        match self.attempt(fallback, request, request_id).await {
            Ok(mut outcome) => {
                log_recording_failure(
                    &self.metrics,
                    "record_fallback_outcome",
                    self.metrics.record_fallback_outcome(Outcome::Success),
                );
                tracing::info!(
                    request_id = %request_id,
                    backend = %outcome.backend,
                    latency_ms = outcome.latency_ms,
                    "Fallback backend succeeded"
                );
                outcome.fallback_from = Some(FallbackOrigin {
                    backend: decision.primary.clone(),
                    category,
                });
                Ok(outcome)
            }
            Err(e) => {
                log_recording_failure(
                    &self.metrics,
                    "record_fallback_outcome",
                    self.metrics.record_fallback_outcome(Outcome::Failure),
                );
                tracing::error!(
                    request_id = %request_id,
                    backend = %fallback,
                    error = %e,
                    "Fallback backend failed"
                );
                Err(e)
            }
        }
    }

    fn fallback_target<'a>(
        &self,
        decision: &'a RoutingDecision,
        request: &GatewayRequest,
    ) -> Option<&'a str> {
        let primary_is_local = self.router.local_backend() == Some(decision.primary.as_str());
        let eligible =
            primary_is_local && self.router.fallback_enabled() && !request.fallback_disabled();
        decision.fallback.as_deref().filter(|_| eligible)
    }

    /// One breaker-guarded call, with retry when not streaming
    async fn attempt(
        &self,
        backend: &str,
        request: &GatewayRequest,
        request_id: RequestId,
    ) -> Result<AttemptOutcome, BackendError> {
        let (invoker, breaker) = match (self.invokers.get(backend), self.breakers.get(backend)) {
            (Some(invoker), Some(breaker)) => (invoker, breaker),
            _ => {
                return Err(BackendError::Other {
                    backend: backend.to_string(),
                    message: "backend is not configured".to_string(),
                });
            }
        };

        let started = Instant::now();
        let result = breaker
            .execute(|| async {
                if request.is_streaming() {
                    return invoker.invoke(request).await;
                }
                with_retry(&self.retry, |attempt| {
                    if attempt > 0 {
                        log_recording_failure(
                            &self.metrics,
                            "record_retry",
                            self.metrics.record_retry(backend),
                        );
                    }
                    invoker.invoke(request)
                })
                .await
            })
            .await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        // A circuit-open rejection never reached the backend
        if !matches!(result, Err(BackendError::CircuitOpen { .. })) {
            let outcome = if result.is_ok() {
                Outcome::Success
            } else {
                Outcome::Failure
            };
            log_recording_failure(
                &self.metrics,
                "record_backend_request",
                self.metrics
                    .record_backend_request(backend, outcome, latency_ms),
            );
        }

        match result {
            Ok(response) => {
                tracing::debug!(
                    request_id = %request_id,
                    backend = %backend,
                    status = response.status,
                    latency_ms,
                    "Backend call succeeded"
                );
                Ok(AttemptOutcome {
                    backend: backend.to_string(),
                    latency_ms,
                    response,
                    fallback_from: None,
                })
            }
            Err(e) => {
                log_recording_failure(
                    &self.metrics,
                    "record_backend_failure",
                    self.metrics.record_backend_failure(backend, e.category()),
                );
                Err(e)
            }
        }
    }

    fn record_savings(
        &self,
        decision: &RoutingDecision,
        request: &GatewayRequest,
        request_id: RequestId,
    ) {
        if self.router.local_backend() != Some(decision.primary.as_str())
            || self.cloud_cost_per_million <= 0.0
        {
            return;
        }
        let tokens = estimate_tokens(request.messages());
        let usd = tokens as f64 / 1_000_000.0 * self.cloud_cost_per_million;
        tracing::debug!(
            request_id = %request_id,
            estimated_tokens = tokens,
            estimated_savings_usd = usd,
            "Served by local backend"
        );
        log_recording_failure(
            &self.metrics,
            "record_cost_savings",
            self.metrics.record_cost_savings(usd),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendIdentity, ResponseBody};
    use crate::error::TransientKind;
    use async_trait::async_trait;
    use serde_json::json;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted invoker: fails the first `failures` calls with `error`
    struct Scripted {
        identity: BackendIdentity,
        failures: usize,
        error: BackendError,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BackendInvoker for Scripted {
        fn identity(&self) -> &BackendIdentity {
            &self.identity
        }

        async fn invoke(&self, _request: &GatewayRequest) -> Result<BackendResponse, BackendError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.error.clone())
            } else {
                Ok(BackendResponse {
                    status: 200,
                    body: ResponseBody::Json(json!({"served_by": self.identity.name()})),
                })
            }
        }
    }

    fn config(fallback_enabled: bool) -> Config {
        Config::from_str(&format!(
            r#"
[server]
host = "127.0.0.1"
port = 3000

[[backends]]
name = "local"
base_url = "http://localhost:11434"
api = "openai"

[[backends]]
name = "cloud"
base_url = "https://api.anthropic.com"
api = "anthropic"
cost_per_million_input_tokens = 3.0

[routing]
prefer_local = true
local_backend = "local"
local_tool_ceiling = 2
cloud_backend = "cloud"

[fallback]
enabled = {}
backend = "cloud"

[retry]
max_retries = 1
initial_delay_ms = 1
max_delay_ms = 2
"#,
            fallback_enabled
        ))
        .unwrap()
    }

    fn scripted(config: &Config, name: &str, failures: usize, error: BackendError) -> Arc<Scripted> {
        Arc::new(Scripted {
            identity: config.backend(name).unwrap().clone(),
            failures,
            error,
            calls: AtomicUsize::new(0),
        })
    }

    fn unavailable(backend: &str) -> BackendError {
        BackendError::Transient {
            backend: backend.to_string(),
            kind: TransientKind::ServerError,
            status: Some(503),
            body: Some(json!({"error": "down"})),
            message: "status 503".to_string(),
        }
    }

    fn coordinator(
        config: &Config,
        local: Arc<Scripted>,
        cloud: Arc<Scripted>,
    ) -> (FallbackCoordinator, Metrics) {
        let metrics = Metrics::new().unwrap();
        let breakers = Arc::new(BreakerRegistry::new(
            ["local", "cloud"],
            &config.circuit_breaker,
            &metrics,
        ));
        let mut invokers: HashMap<String, Arc<dyn BackendInvoker>> = HashMap::new();
        invokers.insert("local".to_string(), local);
        invokers.insert("cloud".to_string(), cloud);
        (
            FallbackCoordinator::new(config, invokers, breakers, metrics.clone()),
            metrics,
        )
    }

    fn request() -> GatewayRequest {
        serde_json::from_value(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "x".repeat(4000)}],
            "tools": [{"name": "read_file"}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_local_success_records_savings() {
        let config = config(true);
        let local = scripted(&config, "local", 0, unavailable("local"));
        let cloud = scripted(&config, "cloud", 0, unavailable("cloud"));
        let (coordinator, metrics) = coordinator(&config, local, cloud.clone());

        let outcome = coordinator.invoke(&request(), RequestId::new()).await.unwrap();
        assert_eq!(outcome.backend, "local");
        assert!(outcome.fallback_from.is_none());
        assert_eq!(cloud.calls.load(Ordering::SeqCst), 0);
        assert!(metrics.cost_savings_usd() > 0.0);
    }

    #[tokio::test]
    async fn test_failing_local_falls_back_to_cloud() {
        let config = config(true);
        let local = scripted(&config, "local", usize::MAX, unavailable("local"));
        let cloud = scripted(&config, "cloud", 0, unavailable("cloud"));
        let (coordinator, metrics) = coordinator(&config, local.clone(), cloud.clone());

        let outcome = coordinator.invoke(&request(), RequestId::new()).await.unwrap();
        assert_eq!(outcome.backend, "cloud");
        let origin = outcome.fallback_from.expect("should be tagged");
        assert_eq!(origin.backend, "local");
        assert_eq!(origin.category, FailureCategory::ServiceUnavailable);
        // 1 + max_retries attempts on the primary
        assert_eq!(local.calls.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.fallback_outcome_count(Outcome::Success), 1);
        assert_eq!(metrics.retries_count("local"), 1);
    }

    #[tokio::test]
    async fn test_fallback_disabled_returns_primary_error() {
        let config = config(false);
        let local = scripted(&config, "local", usize::MAX, unavailable("local"));
        let cloud = scripted(&config, "cloud", 0, unavailable("cloud"));
        let (coordinator, metrics) = coordinator(&config, local, cloud.clone());

        let err = coordinator.invoke(&request(), RequestId::new()).await.unwrap_err();
        assert_eq!(err.backend(), "local");
        assert_eq!(cloud.calls.load(Ordering::SeqCst), 0);
        assert_eq!(metrics.fallback_attempts_count(), 0);
    }

    #[tokio::test]
    async fn test_per_request_opt_out() {
        let config = config(true);
        let local = scripted(&config, "local", usize::MAX, unavailable("local"));
        let cloud = scripted(&config, "cloud", 0, unavailable("cloud"));
        let (coordinator, _) = coordinator(&config, local, cloud.clone());

        let mut req = request();
        req.set_fallback_disabled(true);
        let err = coordinator.invoke(&req, RequestId::new()).await.unwrap_err();
        assert_eq!(err.backend(), "local");
        assert_eq!(cloud.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_client_error_is_still_eligible() {
        let config = config(true);
        let rejected = BackendError::ClientRequest {
            backend: "local".to_string(),
            status: 400,
            body: json!({"error": "model does not support tools"}),
        };
        let local = scripted(&config, "local", usize::MAX, rejected);
        let cloud = scripted(&config, "cloud", 0, unavailable("cloud"));
        let (coordinator, _) = coordinator(&config, local.clone(), cloud);

        let outcome = coordinator.invoke(&request(), RequestId::new()).await.unwrap();
        assert_eq!(outcome.backend, "cloud");
        assert_eq!(
            outcome.fallback_from.unwrap().category,
            FailureCategory::ToolIncompatible
        );
        assert_eq!(local.calls.load(Ordering::SeqCst), 1, "4xx is never retried");
    }

    #[tokio::test]
    async fn test_both_failing_propagates_fallback_error() {
        let config = config(true);
        let local = scripted(&config, "local", usize::MAX, unavailable("local"));
        let cloud = scripted(&config, "cloud", usize::MAX, unavailable("cloud"));
        let (coordinator, metrics) = coordinator(&config, local, cloud);

        let err = coordinator.invoke(&request(), RequestId::new()).await.unwrap_err();
        assert_eq!(err.backend(), "cloud");
        assert_eq!(metrics.fallback_outcome_count(Outcome::Failure), 1);
    }

    #[tokio::test]
    async fn test_cloud_primary_never_falls_back() {
        let config = config(true);
        let local = scripted(&config, "local", 0, unavailable("local"));
        let cloud = scripted(&config, "cloud", usize::MAX, unavailable("cloud"));
        let (coordinator, _) = coordinator(&config, local.clone(), cloud);

        let many_tools: GatewayRequest = serde_json::from_value(json!({
            "messages": [{"role": "user", "content": "x"}],
            "tools": [{}, {}, {}, {}]
        }))
        .unwrap();
        let err = coordinator.invoke(&many_tools, RequestId::new()).await.unwrap_err();
        assert_eq!(err.backend(), "cloud");
        assert_eq!(local.calls.load(Ordering::SeqCst), 0);
    }
}
