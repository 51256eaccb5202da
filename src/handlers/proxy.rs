//! Shared forwarding path for both client wire formats
//!
//! Parses and validates the body, hands it to the fallback coordinator and
//! turns the outcome into an HTTP response. Streamed responses are relayed
//! by a spawned `StreamRelaySession` through a bounded channel; the session's
//! release hook is the request's "finish" signal to the load shedder.

use crate::backends::ResponseBody;
use crate::error::{AppError, BackendError, TransientKind};
use crate::fallback::AttemptOutcome;
use crate::handlers::AppState;
use crate::handlers::types::GatewayRequest;
use crate::middleware::RequestId;
use crate::shedder::AdmissionToken;
use crate::streaming::StreamRelaySession;
use axum::{
    Json,
    body::Body,
    extract::Request,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::time::Duration;
use tokio::sync::mpsc;

/// Backend that produced the response
pub const PROVIDER_HEADER: &str = "x-gatehouse-provider";
/// Primary backend replaced by a fallback
pub const FALLBACK_FROM_HEADER: &str = "x-gatehouse-fallback-from";
/// Per-request fallback control; `off` disables fallback
pub const FALLBACK_CONTROL_HEADER: &str = "x-gatehouse-fallback";

const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;
const RELAY_CHANNEL_CAPACITY: usize = 32;

/// Inbound wire format, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientApi {
    Messages,
    ChatCompletions,
}

impl ClientApi {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientApi::Messages => "messages",
            ClientApi::ChatCompletions => "chat_completions",
        }
    }
}

pub async fn forward(
    state: AppState,
    api: ClientApi,
    request: Request,
) -> Result<Response, AppError> {
    let (parts, body) = request.into_parts();
    let request_id = parts
        .extensions
        .get::<RequestId>()
        .copied()
        .unwrap_or_default();
    let token = parts.extensions.get::<AdmissionToken>().cloned();

    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| AppError::Validation(format!("failed to read request body: {}", e)))?;
    let mut gateway_request: GatewayRequest = serde_json::from_slice(&bytes)
        .map_err(|e| AppError::Validation(format!("invalid request body: {}", e)))?;
    gateway_request.validate().map_err(AppError::Validation)?;
    gateway_request.set_fallback_disabled(fallback_disabled(&parts.headers));

    tracing::info!(
        request_id = %request_id,
        api = api.as_str(),
        model = ?gateway_request.model(),
        messages = gateway_request.messages().len(),
        tool_count = gateway_request.tool_count(),
        streaming = gateway_request.is_streaming(),
        "Received request"
    );

    let timeout_secs = state.config().server.request_timeout_seconds;
    let invocation = state.coordinator().invoke(&gateway_request, request_id);
    let outcome = match tokio::time::timeout(Duration::from_secs(timeout_secs), invocation).await {
        Ok(result) => result?,
        Err(_) => {
            tracing::error!(
                request_id = %request_id,
                timeout_secs,
                "Request exceeded gateway timeout"
            );
            return Err(AppError::Backend(BackendError::Transient {
                backend: "gateway".to_string(),
                kind: TransientKind::Timeout,
                status: None,
                body: None,
                message: format!("request exceeded {}s", timeout_secs),
            }));
        }
    };

    Ok(into_http_response(&state, outcome, token, request_id))
}

/// `x-gatehouse-fallback: off` (or `false`/`0`) opts a request out of fallback
fn fallback_disabled(headers: &HeaderMap) -> bool {
    headers
        .get(FALLBACK_CONTROL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "off" | "false" | "0"))
        .unwrap_or(false)
}

fn into_http_response(
    state: &AppState,
    outcome: AttemptOutcome,
    token: Option<AdmissionToken>,
    request_id: RequestId,
) -> Response {
    let AttemptOutcome {
        backend,
        latency_ms,
        response,
        fallback_from,
    } = outcome;
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);

    let mut http_response = match response.body {
        ResponseBody::Json(value) => (status, Json(value)).into_response(),
        ResponseBody::Stream(upstream) => {
            let (sink, receiver) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
            let mut session =
                StreamRelaySession::new(backend.clone(), upstream, state.metrics().clone());
            if let Some(identity) = state.config().backend(&backend) {
                session = session.idle_timeout(identity.timeout());
            }
            if let Some(token) = token {
                session = session.on_release(move |report| {
                    if token.release() {
                        tracing::trace!(
                            request_id = %request_id,
                            termination = report.termination.as_str(),
                            "Admission released on stream finish"
                        );
                    }
                });
            }
            tokio::spawn(session.relay(sink));

            let body = futures::stream::unfold(receiver, |mut receiver| async move {
                receiver.recv().await.map(|item| (item, receiver))
            });
            let mut streamed = Response::new(Body::from_stream(body));
            *streamed.status_mut() = status;
            let headers = streamed.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            );
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            streamed
        }
    };

    tracing::info!(
        request_id = %request_id,
        backend = %backend,
        latency_ms,
        fallback_from = ?fallback_from.as_ref().map(|f| f.backend.as_str()),
        "Request served"
    );

    let headers = http_response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&backend) {
        headers.insert(PROVIDER_HEADER, value);
    }
    if let Some(origin) = fallback_from {
        if let Ok(value) = HeaderValue::from_str(&origin.backend) {
            headers.insert(FALLBACK_FROM_HEADER, value);
        }
    }
    http_response
}
