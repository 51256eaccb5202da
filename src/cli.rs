//! Command-line interface for Gatehouse

use clap::{Parser, Subcommand};

/// Resilient gateway between LLM clients and local or cloud backends
#[derive(Parser)]
#[command(name = "gatehouse")]
#[command(version)]
#[command(about = "Resilient gateway between LLM clients and local or cloud backends")]
#[command(
    long_about = "Gatehouse accepts Anthropic Messages and OpenAI chat completion requests, \
    routes each to a local or cloud backend by tool count, and protects backends with \
    circuit breakers, retries, fallback and load shedding."
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Generate a template configuration file
    Config {
        /// Output file path (prints to stdout if not specified)
        #[arg(short, long)]
        output: Option<String>,
    },
}

/// Generate template configuration content
pub fn generate_config_template() -> &'static str {
    r#"# Gatehouse Configuration
# ========================

# ─────────────────────────────────────────────────────────────────────────────
# SERVER
# ─────────────────────────────────────────────────────────────────────────────

[server]
host = "0.0.0.0"
port = 3000

# Upper bound for one client request, including retries and fallback
request_timeout_seconds = 300

# ─────────────────────────────────────────────────────────────────────────────
# BACKENDS
# ─────────────────────────────────────────────────────────────────────────────
#
# Each backend gets its own circuit breaker. Fields:
#   - name: identifier used by [routing] and [fallback], and in metrics
#   - base_url: scheme + host; the API path is appended from `api`
#   - api: "anthropic" (/v1/messages) or "openai" (/v1/chat/completions)
#   - model: replaces the client's model field (optional)
#   - supports_tools / supports_streaming: capability flags (default true)
#   - api_key_env: environment variable holding the API key (optional)
#   - timeout_seconds: per-attempt timeout (default 120)
#   - cost_per_million_input_tokens: used to estimate savings from local routing

[[backends]]
name = "local"
base_url = "http://localhost:11434"
api = "openai"
model = "qwen2.5-coder:14b"
supports_tools = true
timeout_seconds = 120

[[backends]]
name = "cloud"
base_url = "https://api.anthropic.com"
api = "anthropic"
api_key_env = "ANTHROPIC_API_KEY"
timeout_seconds = 300
cost_per_million_input_tokens = 3.0

# ─────────────────────────────────────────────────────────────────────────────
# ROUTING
# ─────────────────────────────────────────────────────────────────────────────
#
# Requests with at most local_tool_ceiling tools go to local_backend when
# prefer_local is set; up to mid_tier_tool_ceiling go to mid_tier_backend;
# everything else goes to cloud_backend. force_backend bypasses the policy.

[routing]
prefer_local = true
local_backend = "local"
local_tool_ceiling = 2
# mid_tier_backend = "mid"
# mid_tier_tool_ceiling = 8
cloud_backend = "cloud"
# force_backend = "cloud"

# ─────────────────────────────────────────────────────────────────────────────
# RESILIENCE
# ─────────────────────────────────────────────────────────────────────────────

# When the local backend fails, retry the request once on this backend.
# Clients can opt out per request with the header `x-gatehouse-fallback: off`.
[fallback]
enabled = true
backend = "cloud"

[circuit_breaker]
failure_threshold = 5
success_threshold = 2
open_timeout_ms = 30000

# Applies to non-streaming calls; delays double from initial_delay_ms up to
# max_delay_ms with 0.5x-1.5x jitter
[retry]
max_retries = 3
initial_delay_ms = 500
max_delay_ms = 10000

# ─────────────────────────────────────────────────────────────────────────────
# LOAD SHEDDING
# ─────────────────────────────────────────────────────────────────────────────

[load_shedding]
max_heap_ratio = 0.90
max_cpu_ratio = 0.85
max_concurrent_requests = 512
retry_after_seconds = 5
sample_interval_ms = 1000
# Memory budget for the heap ratio; system memory is used when unset
# memory_limit_mb = 2048

# ─────────────────────────────────────────────────────────────────────────────
# OBSERVABILITY
# ─────────────────────────────────────────────────────────────────────────────

[observability]
# Log level: "trace", "debug", "info", "warn", "error" (RUST_LOG overrides)
log_level = "info"

# Prometheus metrics are served at /metrics on the server port
"#
}
