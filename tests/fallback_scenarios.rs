//! Integration tests for local-to-cloud fallback over HTTP

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use gatehouse::{
    config::Config,
    error::FailureCategory,
    handlers::{self, AppState},
    metrics::Outcome,
    resilience::CircuitState,
    shedder::FixedProbe,
};
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

fn config_for(local_url: &str, cloud_url: &str, fallback_enabled: bool) -> Config {
    Config::from_str(&format!(
        r#"
[server]
host = "127.0.0.1"
port = 8080
request_timeout_seconds = 10

[[backends]]
name = "local"
base_url = "{local_url}"
api = "openai"
timeout_seconds = 5

[[backends]]
name = "cloud"
base_url = "{cloud_url}"
api = "anthropic"
timeout_seconds = 5
cost_per_million_input_tokens = 3.0

[routing]
prefer_local = true
local_backend = "local"
cloud_backend = "cloud"

[fallback]
enabled = {fallback_enabled}
backend = "cloud"

[circuit_breaker]
failure_threshold = 2
success_threshold = 1
open_timeout_ms = 60000

[retry]
max_retries = 1
initial_delay_ms = 1
max_delay_ms = 2
"#
    ))
    .expect("test config should be valid")
}

fn create_app(config: Config) -> (Router, AppState) {
    let state = AppState::new(Arc::new(config), Arc::new(FixedProbe::idle()))
        .expect("AppState::new should succeed");
    (handlers::router(state.clone()), state)
}

fn chat_request() -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"messages": [{"role": "user", "content": "summarize this file"}]}).to_string(),
        ))
        .unwrap()
}

async fn mount_cloud_ok(cloud: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "type": "message",
            "content": [{"type": "text", "text": "from cloud"}]
        })))
        .mount(cloud)
        .await;
}

#[tokio::test]
async fn test_local_503_falls_back_to_cloud() {
    let local = MockServer::start().await;
    let cloud = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": "loading"})))
        .expect(2) // first attempt + one retry
        .mount(&local)
        .await;
    mount_cloud_ok(&cloud).await;

    let (app, state) = create_app(config_for(&local.uri(), &cloud.uri(), true));
    let response = app.oneshot(chat_request()).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-gatehouse-provider"], "cloud");
    assert_eq!(response.headers()["x-gatehouse-fallback-from"], "local");

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["content"][0]["text"], "from cloud");

    let metrics = state.metrics();
    assert_eq!(metrics.fallback_attempts_count(), 1);
    assert_eq!(metrics.fallback_outcome_count(Outcome::Success), 1);
    assert_eq!(metrics.retries_count("local"), 1);

    // Retries collapse into one breaker outcome
    let local_breaker = state.breakers().get("local").unwrap().snapshot();
    assert_eq!(local_breaker.consecutive_failures, 1);
    assert_eq!(local_breaker.state, CircuitState::Closed);
}

#[tokio::test]
async fn test_local_client_error_is_still_eligible_for_fallback() {
    let local = MockServer::start().await;
    let cloud = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"message": "tools are not supported by this model"}
        })))
        .expect(1)
        .mount(&local)
        .await;
    mount_cloud_ok(&cloud).await;

    let (app, state) = create_app(config_for(&local.uri(), &cloud.uri(), true));
    let response = app.oneshot(chat_request()).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-gatehouse-provider"], "cloud");
    assert_eq!(state.metrics().fallback_outcome_count(Outcome::Success), 1);
}

#[tokio::test]
async fn test_opt_out_header_returns_primary_error() {
    let local = MockServer::start().await;
    let cloud = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": "busy"})))
        .mount(&local)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&cloud)
        .await;

    let (app, state) = create_app(config_for(&local.uri(), &cloud.uri(), true));
    let mut request = chat_request();
    request
        .headers_mut()
        .insert("x-gatehouse-fallback", "off".parse().unwrap());
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(state.metrics().fallback_attempts_count(), 0);
}

#[tokio::test]
async fn test_fallback_disabled_in_config() {
    let local = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": "oops"})))
        .mount(&local)
        .await;

    let (app, state) = create_app(config_for(&local.uri(), "http://127.0.0.1:9", false));
    let response = app.oneshot(chat_request()).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(state.metrics().fallback_attempts_count(), 0);
}

#[tokio::test]
async fn test_both_backends_failing_reports_fallback_error() {
    let local = MockServer::start().await;
    let cloud = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": "local down"})))
        .mount(&local)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502).set_body_json(json!({"error": "cloud down"})))
        .mount(&cloud)
        .await;

    let (app, state) = create_app(config_for(&local.uri(), &cloud.uri(), true));
    let response = app.oneshot(chat_request()).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"], "cloud down");
    assert_eq!(state.metrics().fallback_outcome_count(Outcome::Failure), 1);
}

#[tokio::test]
async fn test_open_local_circuit_goes_straight_to_cloud() {
    let local = MockServer::start().await;
    let cloud = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": "down"})))
        .expect(4) // two requests, two attempts each; the third is short-circuited
        .mount(&local)
        .await;
    mount_cloud_ok(&cloud).await;

    let (app, state) = create_app(config_for(&local.uri(), &cloud.uri(), true));
    for _ in 0..3 {
        let response = app.clone().oneshot(chat_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-gatehouse-provider"], "cloud");
    }

    assert_eq!(
        state.breakers().get("local").unwrap().state(),
        CircuitState::Open
    );
    assert_eq!(state.metrics().fallback_outcome_count(Outcome::Success), 3);

    // The short-circuited call never reached the backend
    let metrics = state.metrics();
    assert_eq!(metrics.backend_requests_count("local", Outcome::Failure), 2);
    assert_eq!(metrics.backend_requests_count("local", Outcome::Success), 0);
    assert_eq!(
        metrics.backend_failures_count("local", FailureCategory::CircuitOpen),
        1
    );
    assert_eq!(metrics.backend_requests_count("cloud", Outcome::Success), 3);
}
