//! Prometheus metrics endpoint

use axum::{
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::handlers::AppState;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Metrics handler for Prometheus scraping
///
/// - `200 OK` with metrics in Prometheus text format
/// - `500 Internal Server Error` if encoding fails
///
/// ```bash
/// curl http://localhost:3000/metrics
/// # HELP gatehouse_backend_requests_total Backend attempts by outcome
/// # TYPE gatehouse_backend_requests_total counter
/// gatehouse_backend_requests_total{backend="local",outcome="success"} 42
/// ```
pub async fn handler(State(state): State<AppState>) -> Response {
    match state.metrics().gather() {
        Ok(output) => {
            let mut response = (StatusCode::OK, output).into_response();
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
            );
            response
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to gather metrics for Prometheus scraping");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to gather metrics: {}", e),
            )
                .into_response()
        }
    }
}
