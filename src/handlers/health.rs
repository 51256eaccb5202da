//! Health check endpoints
//!
//! `/health/live` answers as long as the process serves HTTP. `/health/ready`
//! reports 503 while the gateway would shed new work on resource pressure or
//! when every backend's circuit is open, so load balancers can steer away.

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

use crate::handlers::AppState;

/// Liveness response
#[derive(Debug, Serialize)]
pub struct LiveResponse {
    pub status: &'static str,
}

/// Per-backend circuit view in the readiness response
#[derive(Debug, Serialize)]
pub struct BreakerStatus {
    pub backend: String,
    pub state: &'static str,
    pub consecutive_failures: u32,
}

/// Readiness response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    /// "ready" or "not_ready"
    pub status: &'static str,
    /// Set when resource pressure is over a shedding threshold
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<&'static str>,
    pub active_requests: usize,
    pub heap_ratio: f64,
    pub cpu_ratio: f64,
    pub breakers: Vec<BreakerStatus>,
}

pub async fn live() -> (StatusCode, Json<LiveResponse>) {
    (StatusCode::OK, Json(LiveResponse { status: "OK" }))
}

pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let shedder = state.shedder();
    let sample = shedder.sample();
    let pressure = shedder.pressure();
    let all_rejecting = state.breakers().all_rejecting();

    let breakers = state
        .breakers()
        .snapshot()
        .into_iter()
        .map(|s| BreakerStatus {
            backend: s.backend,
            state: s.state.as_str(),
            consecutive_failures: s.consecutive_failures,
        })
        .collect();

    let ready = pressure.is_none() && !all_rejecting;
    if !ready {
        tracing::debug!(
            pressure = ?pressure.map(|p| p.as_str()),
            all_breakers_rejecting = all_rejecting,
            "Readiness check failing"
        );
    }

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            status: if ready { "ready" } else { "not_ready" },
            pressure: pressure.map(|p| p.as_str()),
            active_requests: shedder.active_requests(),
            heap_ratio: sample.heap_ratio,
            cpu_ratio: sample.cpu_ratio,
            breakers,
        }),
    )
}
