//! HTTP request handlers for the Gatehouse API

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::fallback::FallbackCoordinator;
use crate::metrics::Metrics;
use crate::middleware::{load_shed_middleware, request_id_middleware};
use crate::resilience::BreakerRegistry;
use crate::shedder::{LoadShedder, ResourceProbe};
use axum::{
    Router, middleware,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod completions;
pub mod health;
pub mod messages;
pub mod metrics;
pub mod proxy;
pub mod types;

/// Application state shared across all handlers
///
/// All fields are Arc'd for cheap cloning across Axum handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    coordinator: Arc<FallbackCoordinator>,
    shedder: Arc<LoadShedder>,
    breakers: Arc<BreakerRegistry>,
    metrics: Metrics,
}

impl AppState {
    /// Build the gateway from validated configuration
    ///
    /// `probe` supplies resource readings to the load shedder; production
    /// passes a `SystemProbe`, tests a `FixedProbe`.
    pub fn new(config: Arc<Config>, probe: Arc<dyn ResourceProbe>) -> AppResult<Self> {
        let metrics = Metrics::new()
            .map_err(|e| AppError::Internal(format!("Failed to initialize metrics: {}", e)))?;
        let breakers = Arc::new(BreakerRegistry::new(
            config.backends.iter().map(|b| b.name()),
            &config.circuit_breaker,
            &metrics,
        ));
        let coordinator = Arc::new(FallbackCoordinator::from_config(
            &config,
            breakers.clone(),
            metrics.clone(),
        )?);
        let shedder = Arc::new(LoadShedder::new(
            &config.load_shedding,
            probe,
            metrics.clone(),
        ));

        Ok(Self {
            config,
            coordinator,
            shedder,
            breakers,
            metrics,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn coordinator(&self) -> &FallbackCoordinator {
        &self.coordinator
    }

    pub fn shedder(&self) -> &Arc<LoadShedder> {
        &self.shedder
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

/// Assemble the HTTP surface
///
/// Proxy routes sit behind admission control; health and metrics do not, so
/// operators can still observe a gateway that is shedding load.
pub fn router(state: AppState) -> Router {
    let proxied = Router::new()
        .route("/messages", post(messages::handler))
        .route("/v1/messages", post(messages::handler))
        .route("/chat/completions", post(completions::handler))
        .route("/v1/chat/completions", post(completions::handler))
        .route_layer(middleware::from_fn_with_state(
            state.shedder().clone(),
            load_shed_middleware,
        ));

    Router::new()
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .route("/metrics", get(metrics::handler))
        .merge(proxied)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::shedder::FixedProbe;
    use std::str::FromStr;

    pub const TEST_CONFIG: &str = r#"
[server]
host = "127.0.0.1"
port = 3000

[[backends]]
name = "local"
base_url = "http://127.0.0.1:9"
api = "openai"

[[backends]]
name = "cloud"
base_url = "http://127.0.0.1:9"
api = "anthropic"

[routing]
prefer_local = true
local_backend = "local"
cloud_backend = "cloud"
"#;

    pub fn state_with_probe(probe: Arc<FixedProbe>) -> AppState {
        let config = Config::from_str(TEST_CONFIG).expect("test config should parse");
        AppState::new(Arc::new(config), probe).expect("state should build")
    }
}
