//! Backend invocation
//!
//! A backend is one configured LLM service (local or cloud). `BackendInvoker`
//! performs exactly one call and normalizes its result into either a
//! `BackendResponse` or a `BackendError`. Retry, circuit breaking and fallback
//! are layered on top by the resilience and fallback modules.

use crate::error::{AppError, AppResult, BackendError, Capability, TransientKind};
use crate::handlers::types::GatewayRequest;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::time::{Instant, timeout_at};

/// Upstream chunks as produced by the HTTP client
pub type ByteStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// Upstream wire format of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFormat {
    /// Anthropic Messages API (`/v1/messages`)
    Anthropic,
    /// OpenAI Chat Completions API (`/v1/chat/completions`)
    #[serde(rename = "openai")]
    OpenAi,
}

impl ApiFormat {
    /// Path appended to the backend's base URL
    pub fn path(&self) -> &'static str {
        match self {
            ApiFormat::Anthropic => "/v1/messages",
            ApiFormat::OpenAi => "/v1/chat/completions",
        }
    }
}

/// Individual backend configuration
///
/// All fields are private to enforce invariants. Instances are loaded via
/// deserialization and validated via `Config::validate()`, so a
/// `BackendIdentity` is immutable once the gateway starts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendIdentity {
    name: String,
    base_url: String,
    api: ApiFormat,
    /// Replaces the client's `model` field when set
    #[serde(default)]
    model: Option<String>,
    #[serde(default = "default_true")]
    supports_tools: bool,
    #[serde(default = "default_true")]
    supports_streaming: bool,
    /// Environment variable holding the API key
    #[serde(default)]
    api_key_env: Option<String>,
    #[serde(default = "default_backend_timeout")]
    timeout_seconds: u64,
    #[serde(default)]
    cost_per_million_input_tokens: f64,
}

fn default_true() -> bool {
    true
}

fn default_backend_timeout() -> u64 {
    120
}

impl BackendIdentity {
    /// Get the backend name (also the breaker and metric key)
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn api(&self) -> ApiFormat {
        self.api
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn supports_tools(&self) -> bool {
        self.supports_tools
    }

    pub fn supports_streaming(&self) -> bool {
        self.supports_streaming
    }

    pub fn api_key_env(&self) -> Option<&str> {
        self.api_key_env.as_deref()
    }

    /// Per-call deadline, measured from dispatch until response headers
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn cost_per_million_input_tokens(&self) -> f64 {
        self.cost_per_million_input_tokens
    }

    /// Full upstream URL for this backend's wire format
    pub fn request_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.api.path())
    }

    pub(crate) fn validate(&self) -> AppResult<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(AppError::Config(format!(
                "backend '{}' has base_url '{}' which must start with \
                http:// or https://",
                self.name, self.base_url
            )));
        }
        if !(1..=600).contains(&self.timeout_seconds) {
            return Err(AppError::Config(format!(
                "backend '{}' timeout_seconds must be between 1 and 600, got {}",
                self.name, self.timeout_seconds
            )));
        }
        if !self.cost_per_million_input_tokens.is_finite() || self.cost_per_million_input_tokens < 0.0
        {
            return Err(AppError::Config(format!(
                "backend '{}' cost_per_million_input_tokens must be a \
                finite non-negative number, got {}",
                self.name, self.cost_per_million_input_tokens
            )));
        }
        if self.model.as_deref().is_some_and(|m| m.trim().is_empty()) {
            return Err(AppError::Config(format!(
                "backend '{}' model override cannot be empty",
                self.name
            )));
        }
        Ok(())
    }
}

/// Body of a successful backend response
pub enum ResponseBody {
    Json(Value),
    Stream(ByteStream),
}

/// Successful (2xx) backend response
pub struct BackendResponse {
    pub status: u16,
    pub body: ResponseBody,
}

impl std::fmt::Debug for BackendResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = match &self.body {
            ResponseBody::Json(value) => format!("Json({})", value),
            ResponseBody::Stream(_) => "Stream(..)".to_string(),
        };
        f.debug_struct("BackendResponse")
            .field("status", &self.status)
            .field("body", &body)
            .finish()
    }
}

/// Performs one request against one backend
#[async_trait]
pub trait BackendInvoker: Send + Sync {
    fn identity(&self) -> &BackendIdentity;

    /// Perform a single call with no retry
    async fn invoke(&self, request: &GatewayRequest) -> Result<BackendResponse, BackendError>;
}

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Production invoker over `reqwest`
pub struct HttpInvoker {
    identity: BackendIdentity,
    client: reqwest::Client,
    api_key: Option<String>,
}

impl HttpInvoker {
    /// Build an invoker, resolving the API key from the environment
    ///
    /// A configured but unset key variable is logged and the backend is called
    /// without credentials; local backends usually need none.
    pub fn new(identity: BackendIdentity) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                AppError::Internal(format!(
                    "Failed to create HTTP client for backend '{}': {}",
                    identity.name(),
                    e
                ))
            })?;

        let api_key = identity.api_key_env().and_then(|var| match std::env::var(var) {
            Ok(key) if !key.is_empty() => Some(key),
            _ => {
                tracing::warn!(
                    backend = %identity.name(),
                    env_var = %var,
                    "API key environment variable is unset; calling backend without credentials"
                );
                None
            }
        });

        Ok(Self {
            identity,
            client,
            api_key,
        })
    }

    fn check_capabilities(&self, request: &GatewayRequest) -> Result<(), BackendError> {
        if request.tool_count() > 0 && !self.identity.supports_tools() {
            return Err(BackendError::Incompatible {
                backend: self.identity.name().to_string(),
                capability: Capability::Tools,
            });
        }
        if request.is_streaming() && !self.identity.supports_streaming() {
            return Err(BackendError::Incompatible {
                backend: self.identity.name().to_string(),
                capability: Capability::Streaming,
            });
        }
        Ok(())
    }

    fn transport_error(&self, error: reqwest::Error) -> BackendError {
        let backend = self.identity.name().to_string();
        if error.is_timeout() {
            BackendError::Transient {
                backend,
                kind: TransientKind::Timeout,
                status: None,
                body: None,
                message: error.to_string(),
            }
        } else if error.is_connect() {
            BackendError::Transient {
                backend,
                kind: TransientKind::ConnectionRefused,
                status: None,
                body: None,
                message: error.to_string(),
            }
        } else {
            BackendError::Other {
                backend,
                message: error.to_string(),
            }
        }
    }

    fn deadline_exceeded(&self) -> BackendError {
        BackendError::Transient {
            backend: self.identity.name().to_string(),
            kind: TransientKind::Timeout,
            status: None,
            body: None,
            message: format!(
                "no response within {}s",
                self.identity.timeout().as_secs()
            ),
        }
    }
}

#[async_trait]
impl BackendInvoker for HttpInvoker {
    fn identity(&self) -> &BackendIdentity {
        &self.identity
    }

    async fn invoke(&self, request: &GatewayRequest) -> Result<BackendResponse, BackendError> {
        self.check_capabilities(request)?;

        let backend = self.identity.name();
        let payload = request
            .upstream_body(self.identity.model())
            .map_err(|e| BackendError::Other {
                backend: backend.to_string(),
                message: format!("failed to encode request: {}", e),
            })?;

        let mut builder = self.client.post(self.identity.request_url()).json(&payload);
        builder = match (self.identity.api(), &self.api_key) {
            (ApiFormat::Anthropic, key) => {
                let builder = builder.header("anthropic-version", ANTHROPIC_VERSION);
                match key {
                    Some(key) => builder.header("x-api-key", key),
                    None => builder,
                }
            }
            (ApiFormat::OpenAi, Some(key)) => builder.bearer_auth(key),
            (ApiFormat::OpenAi, None) => builder,
        };

        let deadline = Instant::now() + self.identity.timeout();
        tracing::debug!(
            backend = %backend,
            url = %self.identity.request_url(),
            streaming = request.is_streaming(),
            "Dispatching backend request"
        );

        let response = match timeout_at(deadline, builder.send()).await {
            Err(_) => return Err(self.deadline_exceeded()),
            Ok(Err(e)) => return Err(self.transport_error(e)),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if status.is_success() {
            if request.is_streaming() {
                let stream = response
                    .bytes_stream()
                    .map_err(std::io::Error::other)
                    .boxed();
                return Ok(BackendResponse {
                    status: status.as_u16(),
                    body: ResponseBody::Stream(stream),
                });
            }

            let body = match timeout_at(deadline, response.json::<Value>()).await {
                Err(_) => return Err(self.deadline_exceeded()),
                Ok(Err(e)) if e.is_decode() => {
                    return Err(BackendError::Other {
                        backend: backend.to_string(),
                        message: format!("backend returned invalid JSON: {}", e),
                    });
                }
                Ok(Err(e)) => return Err(self.transport_error(e)),
                Ok(Ok(body)) => body,
            };
            return Ok(BackendResponse {
                status: status.as_u16(),
                body: ResponseBody::Json(body),
            });
        }

        let raw = match timeout_at(deadline, response.bytes()).await {
            Err(_) => return Err(self.deadline_exceeded()),
            Ok(Err(e)) => return Err(self.transport_error(e)),
            Ok(Ok(raw)) => raw,
        };
        let body = serde_json::from_slice::<Value>(&raw).unwrap_or_else(|_| {
            json!({
                "type": "error",
                "error": { "message": String::from_utf8_lossy(&raw) }
            })
        });

        tracing::warn!(
            backend = %backend,
            status = status.as_u16(),
            "Backend returned error status"
        );

        if status.is_server_error() {
            Err(BackendError::Transient {
                backend: backend.to_string(),
                kind: TransientKind::ServerError,
                status: Some(status.as_u16()),
                body: Some(body),
                message: format!("status {}", status.as_u16()),
            })
        } else if status.is_client_error() {
            Err(BackendError::ClientRequest {
                backend: backend.to_string(),
                status: status.as_u16(),
                body,
            })
        } else {
            Err(BackendError::Other {
                backend: backend.to_string(),
                message: format!("unexpected status {}", status.as_u16()),
            })
        }
    }
}
