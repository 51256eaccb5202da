//! Gatehouse - resilient gateway for LLM requests
//!
//! Accepts Anthropic Messages and OpenAI chat completion requests, picks a
//! backend by tool count, and forwards the request with per-backend circuit
//! breakers, bounded retries, a single local-to-cloud fallback, streaming
//! relay with guaranteed cleanup, and resource-based load shedding.

pub mod backends;
pub mod cli;
pub mod config;
pub mod error;
pub mod fallback;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod resilience;
pub mod router;
pub mod shedder;
pub mod streaming;
pub mod telemetry;
