//! Provider routing for Gatehouse
//!
//! Maps a request's tool count plus the `[routing]` and `[fallback]` config
//! onto an ordered `{primary, fallback}` backend choice. The decision is pure:
//! it never consults backend health, which is the circuit breakers' job.

use crate::config::{Config, FallbackConfig, RoutingConfig};
use crate::metrics::{Metrics, log_recording_failure};
use serde_json::Value;

/// Why a primary backend was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReason {
    /// `routing.force_backend` is set
    ExplicitOverride,
    /// Few enough tools for the preferred local backend
    LocalPreferred,
    /// Too many tools for local, few enough for the mid tier
    MidTier,
    /// No cheaper tier applies
    Cloud,
}

impl RouteReason {
    /// Convert to string representation for logging and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExplicitOverride => "explicit_override",
            Self::LocalPreferred => "local_preferred",
            Self::MidTier => "mid_tier",
            Self::Cloud => "cloud",
        }
    }
}

/// Result of a routing decision
///
/// Computed once per request and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub primary: String,
    pub fallback: Option<String>,
    pub reason: RouteReason,
}

pub struct ProviderRouter {
    routing: RoutingConfig,
    fallback: FallbackConfig,
    metrics: Metrics,
}

impl ProviderRouter {
    pub fn new(config: &Config, metrics: Metrics) -> Self {
        Self {
            routing: config.routing.clone(),
            fallback: config.fallback.clone(),
            metrics,
        }
    }

    /// The preferred low-cost backend, the only primary eligible for fallback
    pub fn local_backend(&self) -> Option<&str> {
        self.routing.local_backend.as_deref()
    }

    pub fn cloud_backend(&self) -> &str {
        &self.routing.cloud_backend
    }

    pub fn fallback_enabled(&self) -> bool {
        self.fallback.enabled
    }

    /// Pick the primary and fallback backend for a request with `tool_count` tools
    ///
    /// Policy, first match wins:
    /// 1. `force_backend` set: that backend, no fallback
    /// 2. `prefer_local` and `tool_count <= local_tool_ceiling`: local backend
    /// 3. a mid-tier backend exists and `tool_count <= mid_tier_tool_ceiling`: mid tier
    /// 4. otherwise the cloud backend
    pub fn decide(&self, tool_count: usize) -> RoutingDecision {
        let routing = &self.routing;

        if let Some(forced) = &routing.force_backend {
            return RoutingDecision {
                primary: forced.clone(),
                fallback: None,
                reason: RouteReason::ExplicitOverride,
            };
        }

        let (primary, reason) = match (&routing.local_backend, &routing.mid_tier_backend) {
            (Some(local), _)
                if routing.prefer_local && tool_count <= routing.local_tool_ceiling =>
            {
                (local.clone(), RouteReason::LocalPreferred)
            }
            (_, Some(mid)) if tool_count <= routing.mid_tier_tool_ceiling => {
                (mid.clone(), RouteReason::MidTier)
            }
            _ => (routing.cloud_backend.clone(), RouteReason::Cloud),
        };

        let fallback = self
            .fallback
            .backend
            .as_ref()
            .filter(|name| self.fallback.enabled && **name != primary)
            .cloned();

        RoutingDecision {
            primary,
            fallback,
            reason,
        }
    }

    /// `decide` plus the routing-decision metric
    pub fn route(&self, tool_count: usize) -> RoutingDecision {
        let decision = self.decide(tool_count);
        tracing::debug!(
            tool_count,
            primary = %decision.primary,
            fallback = ?decision.fallback,
            reason = decision.reason.as_str(),
            "Routing decision made"
        );
        log_recording_failure(
            &self.metrics,
            "record_routing_decision",
            self.metrics
                .record_routing_decision(&decision.primary, decision.reason),
        );
        decision
    }
}

/// Estimate the input token count of a message list (heuristic: chars / 4)
///
/// Counts the characters of every string value in the messages, which covers
/// both plain `content` strings and content-block arrays.
pub fn estimate_tokens(messages: &[Value]) -> usize {
    messages.iter().map(text_chars).sum::<usize>() / 4
}

fn text_chars(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.iter().map(text_chars).sum(),
        Value::Object(map) => map.values().map(text_chars).sum(),
        _ => 0,
    }
}
