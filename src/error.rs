//! Error types for Gatehouse
//!
//! `BackendError` is the failure taxonomy of a single backend invocation.
//! `AppError` is what handlers return; it implements `IntoResponse` so every
//! failure reaches the client as a status code plus a JSON body, never as an
//! internal trace.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use thiserror::Error;

/// Which kind of transient failure a backend produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    /// The backend answered with a 5xx status
    ServerError,
    /// The relative deadline for the call elapsed
    Timeout,
    /// The TCP connection could not be established
    ConnectionRefused,
}

/// Capability a backend may lack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Tools,
    Streaming,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Tools => write!(f, "tool use"),
            Capability::Streaming => write!(f, "streaming"),
        }
    }
}

/// Telemetry classification of a failed attempt
///
/// Used for metric labels and log fields only. It never decides whether a
/// fallback is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    CircuitOpen,
    Timeout,
    ServiceUnavailable,
    ToolIncompatible,
    RateLimited,
    Other,
}

impl FailureCategory {
    /// Convert category to Prometheus label string
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::CircuitOpen => "circuit_open",
            FailureCategory::Timeout => "timeout",
            FailureCategory::ServiceUnavailable => "service_unavailable",
            FailureCategory::ToolIncompatible => "tool_incompatible",
            FailureCategory::RateLimited => "rate_limited",
            FailureCategory::Other => "other",
        }
    }
}

/// How a finished call should move its backend's circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerVerdict {
    Success,
    Failure,
    /// The backend was never really exercised (e.g. capability mismatch)
    Neutral,
}

/// Failure of one backend invocation
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("Circuit for backend '{backend}' is open; retry in {retry_after_ms}ms")]
    CircuitOpen { backend: String, retry_after_ms: u64 },

    #[error("Transient failure from backend '{backend}': {message}")]
    Transient {
        backend: String,
        kind: TransientKind,
        status: Option<u16>,
        body: Option<Value>,
        message: String,
    },

    #[error("Backend '{backend}' rejected the request with status {status}")]
    ClientRequest {
        backend: String,
        status: u16,
        body: Value,
    },

    #[error("Backend '{backend}' does not support {capability}")]
    Incompatible {
        backend: String,
        capability: Capability,
    },

    #[error("Stream from backend '{backend}' failed after {bytes_relayed} bytes: {message}")]
    StreamIo {
        backend: String,
        bytes_relayed: usize,
        message: String,
    },

    #[error("Request to backend '{backend}' failed: {message}")]
    Other { backend: String, message: String },
}

impl BackendError {
    /// Name of the backend that produced this error
    pub fn backend(&self) -> &str {
        match self {
            Self::CircuitOpen { backend, .. }
            | Self::Transient { backend, .. }
            | Self::ClientRequest { backend, .. }
            | Self::Incompatible { backend, .. }
            | Self::StreamIo { backend, .. }
            | Self::Other { backend, .. } => backend,
        }
    }

    /// Whether the retry executor may repeat the call
    ///
    /// Only 5xx, timeouts and refused connections are retried. A circuit-open
    /// rejection is never retried locally.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Effect of this error on the backend's circuit breaker
    pub fn breaker_verdict(&self) -> BreakerVerdict {
        match self {
            Self::Transient { .. } | Self::StreamIo { .. } | Self::Other { .. } => {
                BreakerVerdict::Failure
            }
            Self::ClientRequest { status: 429, .. } => BreakerVerdict::Failure,
            // The backend answered, so it is reachable
            Self::ClientRequest { .. } => BreakerVerdict::Success,
            Self::Incompatible { .. } | Self::CircuitOpen { .. } => BreakerVerdict::Neutral,
        }
    }

    /// Classify the failure for telemetry
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::CircuitOpen { .. } => FailureCategory::CircuitOpen,
            Self::Transient {
                kind: TransientKind::Timeout,
                ..
            } => FailureCategory::Timeout,
            Self::Transient {
                kind: TransientKind::ConnectionRefused,
                ..
            } => FailureCategory::ServiceUnavailable,
            Self::Transient { status, .. } => match status {
                Some(502..=504) => FailureCategory::ServiceUnavailable,
                _ => FailureCategory::Other,
            },
            Self::ClientRequest { status: 429, .. } => FailureCategory::RateLimited,
            Self::ClientRequest { body, .. } if mentions_tools(body) => {
                FailureCategory::ToolIncompatible
            }
            Self::Incompatible {
                capability: Capability::Tools,
                ..
            } => FailureCategory::ToolIncompatible,
            _ => FailureCategory::Other,
        }
    }
}

fn mentions_tools(body: &Value) -> bool {
    body.to_string().to_ascii_lowercase().contains("tool")
}

/// Main error type for the application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read config file {path}: {source}")]
    ConfigFileRead {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ConfigParseFailed {
        path: String,
        source: toml::de::Error,
    },

    #[error("Invalid configuration in {path}: {reason}")]
    ConfigValidationFailed { path: String, reason: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Gateway overloaded: {reason}")]
    Overloaded {
        reason: String,
        retry_after_seconds: u64,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Gateway-produced error body
fn error_body(error_type: &str, message: String) -> Json<Value> {
    Json(json!({
        "type": error_type,
        "message": message,
    }))
}

fn with_retry_after(mut response: Response, seconds: u64) -> Response {
    if let Ok(value) = HeaderValue::from_str(&seconds.max(1).to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

fn status_or(code: u16, fallback: StatusCode) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(fallback)
}

impl IntoResponse for BackendError {
    fn into_response(self) -> Response {
        match self {
            BackendError::CircuitOpen { retry_after_ms, .. } => {
                let message = self.to_string();
                let response = (
                    StatusCode::SERVICE_UNAVAILABLE,
                    error_body("overloaded_error", message),
                )
                    .into_response();
                with_retry_after(response, retry_after_ms.div_ceil(1000))
            }
            BackendError::ClientRequest { status, body, .. } => {
                (status_or(status, StatusCode::BAD_REQUEST), Json(body)).into_response()
            }
            BackendError::Transient {
                status: Some(status),
                body: Some(body),
                ..
            } => (status_or(status, StatusCode::BAD_GATEWAY), Json(body)).into_response(),
            BackendError::Transient {
                kind: TransientKind::Timeout,
                ..
            } => {
                let message = self.to_string();
                (StatusCode::GATEWAY_TIMEOUT, error_body("timeout_error", message)).into_response()
            }
            BackendError::Incompatible { .. } => {
                let message = self.to_string();
                (
                    StatusCode::BAD_REQUEST,
                    error_body("invalid_request_error", message),
                )
                    .into_response()
            }
            BackendError::Transient { .. }
            | BackendError::StreamIo { .. }
            | BackendError::Other { .. } => {
                let message = self.to_string();
                (StatusCode::BAD_GATEWAY, error_body("api_error", message)).into_response()
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            Self::Backend(err) => err.into_response(),
            Self::Overloaded {
                reason,
                retry_after_seconds,
            } => {
                let response = (
                    StatusCode::SERVICE_UNAVAILABLE,
                    error_body(
                        "overloaded_error",
                        format!("Gateway is overloaded ({reason}); retry later"),
                    ),
                )
                    .into_response();
                with_retry_after(response, retry_after_seconds)
            }
            Self::Validation(msg) => {
                (StatusCode::BAD_REQUEST, error_body("invalid_request_error", msg)).into_response()
            }
            other => {
                let message = other.to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    error_body("api_error", message),
                )
                    .into_response()
            }
        }
    }
}

/// Convenience type alias for Results
pub type AppResult<T> = Result<T, AppError>;
