//! Inbound request type shared by the Anthropic and OpenAI surfaces
//!
//! The gateway forwards the client's body as-is apart from an optional model
//! override, so only the fields routing and validation need are typed. Every
//! other field is kept in `extra` and serialized back out unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maximum number of messages allowed in one request
pub const MAX_MESSAGES: usize = 1000;

/// A chat request in either client wire format
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(flatten)]
    extra: Map<String, Value>,
    /// Per-request fallback opt-out, set from the `x-gatehouse-fallback` header
    #[serde(skip)]
    fallback_disabled: bool,
}

impl GatewayRequest {
    /// Check the request against the gateway's input rules
    ///
    /// # Errors
    ///
    /// Returns a client-facing message when `messages` is empty or longer
    /// than `MAX_MESSAGES`, `temperature` is outside [0.0, 2.0], or
    /// `max_tokens` is zero.
    pub fn validate(&self) -> Result<(), String> {
        if self.messages.is_empty() {
            return Err("messages array cannot be empty".to_string());
        }
        if self.messages.len() > MAX_MESSAGES {
            return Err(format!(
                "messages array cannot exceed {} messages (got {})",
                MAX_MESSAGES,
                self.messages.len()
            ));
        }
        if let Some(temp) = self.temperature {
            if !temp.is_finite() {
                return Err("temperature must be a finite number".to_string());
            }
            if !(0.0..=2.0).contains(&temp) {
                return Err(format!("temperature must be between 0.0 and 2.0 (got {})", temp));
            }
        }
        if self.max_tokens == Some(0) {
            return Err("max_tokens must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn messages(&self) -> &[Value] {
        &self.messages
    }

    pub fn tool_count(&self) -> usize {
        self.tools.as_ref().map_or(0, Vec::len)
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub fn fallback_disabled(&self) -> bool {
        self.fallback_disabled
    }

    pub fn set_fallback_disabled(&mut self, disabled: bool) {
        self.fallback_disabled = disabled;
    }

    /// JSON body sent upstream, with `model` replaced when `model_override` is set
    pub fn upstream_body(&self, model_override: Option<&str>) -> Result<Value, serde_json::Error> {
        let mut body = serde_json::to_value(self)?;
        if let (Some(model), Value::Object(map)) = (model_override, &mut body) {
            map.insert("model".to_string(), Value::String(model.to_string()));
        }
        Ok(body)
    }
}
