//! Configuration management for Gatehouse
//!
//! Parses TOML configuration files and provides typed access to settings.

use crate::backends::BackendIdentity;
use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub backends: Vec<BackendIdentity>,
    pub routing: RoutingConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub load_shedding: LoadSheddingConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_request_timeout() -> u64 {
    300
}

/// Provider routing configuration
///
/// Names refer to `[[backends]]` entries. All references are checked by
/// `Config::validate()`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    /// Route small-tool-count requests to the local backend first
    #[serde(default)]
    pub prefer_local: bool,
    /// The preferred low-cost backend; the only primary eligible for fallback
    #[serde(default)]
    pub local_backend: Option<String>,
    /// Requests with at most this many tools go to the local backend
    #[serde(default = "default_local_tool_ceiling")]
    pub local_tool_ceiling: usize,
    #[serde(default)]
    pub mid_tier_backend: Option<String>,
    #[serde(default = "default_mid_tier_tool_ceiling")]
    pub mid_tier_tool_ceiling: usize,
    /// Cloud backend of record, used when no cheaper tier applies
    pub cloud_backend: String,
    /// Send every request to this backend, bypassing the tier policy
    #[serde(default)]
    pub force_backend: Option<String>,
}

fn default_local_tool_ceiling() -> usize {
    2
}

fn default_mid_tier_tool_ceiling() -> usize {
    8
}

/// Fallback configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FallbackConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub backend: Option<String>,
}

/// Circuit breaker thresholds, shared by every backend's breaker
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_timeout_ms() -> u64 {
    30_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
        }
    }
}

/// Retry parameters for non-streaming backend calls
///
/// Validated while deserializing: an invalid `[retry]` section is rejected by
/// the TOML parser itself, so an invalid `RetryConfig` never exists.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(try_from = "RawRetryConfig")]
pub struct RetryConfig {
    max_retries: u32,
    initial_delay_ms: u64,
    max_delay_ms: u64,
}

#[derive(Deserialize)]
struct RawRetryConfig {
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    max_delay_ms: u64,
}

impl TryFrom<RawRetryConfig> for RetryConfig {
    type Error = String;

    fn try_from(raw: RawRetryConfig) -> Result<Self, Self::Error> {
        RetryConfig::new(raw.max_retries, raw.initial_delay_ms, raw.max_delay_ms)
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl RetryConfig {
    /// Create a validated retry configuration
    ///
    /// # Errors
    ///
    /// Returns an error if `max_retries` exceeds 10, if `initial_delay_ms` is
    /// zero, or if `max_delay_ms` is below `initial_delay_ms` or above 5 minutes.
    pub fn new(max_retries: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Result<Self, String> {
        if max_retries > 10 {
            return Err(format!(
                "retry.max_retries cannot exceed 10, got {}",
                max_retries
            ));
        }
        if initial_delay_ms == 0 {
            return Err("retry.initial_delay_ms must be greater than 0".to_string());
        }
        if max_delay_ms < initial_delay_ms {
            return Err(format!(
                "retry.max_delay_ms ({}) must be >= retry.initial_delay_ms ({})",
                max_delay_ms, initial_delay_ms
            ));
        }
        if max_delay_ms > 300_000 {
            return Err(format!(
                "retry.max_delay_ms cannot exceed 300000 (5 minutes), got {}",
                max_delay_ms
            ));
        }
        Ok(Self {
            max_retries,
            initial_delay_ms,
            max_delay_ms,
        })
    }

    /// Number of retries after the first attempt
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn initial_delay_ms(&self) -> u64 {
        self.initial_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Admission control thresholds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadSheddingConfig {
    /// Reject when process memory / memory budget reaches this ratio
    #[serde(default = "default_max_heap_ratio")]
    pub max_heap_ratio: f64,
    /// Reject when global CPU usage reaches this ratio
    #[serde(default = "default_max_cpu_ratio")]
    pub max_cpu_ratio: f64,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Value of the `Retry-After` header on rejection
    #[serde(default = "default_retry_after_seconds")]
    pub retry_after_seconds: u64,
    /// How often the resource sampler refreshes its readings
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// Memory budget for the heap ratio; system memory is used when unset
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
}

fn default_max_heap_ratio() -> f64 {
    0.90
}

fn default_max_cpu_ratio() -> f64 {
    0.85
}

fn default_max_concurrent_requests() -> usize {
    512
}

fn default_retry_after_seconds() -> u64 {
    5
}

fn default_sample_interval_ms() -> u64 {
    1_000
}

impl Default for LoadSheddingConfig {
    fn default() -> Self {
        Self {
            max_heap_ratio: default_max_heap_ratio(),
            max_cpu_ratio: default_max_cpu_ratio(),
            max_concurrent_requests: default_max_concurrent_requests(),
            retry_after_seconds: default_retry_after_seconds(),
            sample_interval_ms: default_sample_interval_ms(),
            memory_limit_mb: None,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path_display = path.as_ref().display().to_string();

        // Phase 1: Read file (preserves io::Error context)
        let content = std::fs::read_to_string(path.as_ref()).map_err(|source| {
            AppError::ConfigFileRead {
                path: path_display.clone(),
                source,
            }
        })?;

        // Phase 2: Parse TOML (preserves toml::de::Error context)
        let config: Self =
            toml::from_str(&content).map_err(|source| AppError::ConfigParseFailed {
                path: path_display.clone(),
                source,
            })?;

        // Phase 3: Validate parsed config
        config
            .validate()
            .map_err(|e| AppError::ConfigValidationFailed {
                path: path_display,
                reason: e.to_string(),
            })?;

        Ok(config)
    }

    /// Look up a backend by name
    pub fn backend(&self, name: &str) -> Option<&BackendIdentity> {
        self.backends.iter().find(|b| b.name() == name)
    }

    /// Validate configuration after parsing
    ///
    /// Called by `from_file()` and `from_str()`; call it explicitly when
    /// constructing or mutating a `Config` by other means.
    pub fn validate(&self) -> AppResult<()> {
        // ═══════════════════════════════════════════════════════════════════════
        // Phase 1: Backend Field Validation
        // ═══════════════════════════════════════════════════════════════════════
        if self.backends.is_empty() {
            return Err(AppError::Config(
                "no [[backends]] configured. \
                At least one backend is required.\n\n\
                Example fix - add to config.toml:\n\
                [[backends]]\n\
                name = \"local\"\n\
                base_url = \"http://localhost:11434\"\n\
                api = \"openai\""
                    .to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.name().trim().is_empty() {
                return Err(AppError::Config(
                    "backend name cannot be empty".to_string(),
                ));
            }
            if !seen.insert(backend.name()) {
                return Err(AppError::Config(format!(
                    "duplicate backend name '{}'. \
                    Backend names must be unique because breakers and metrics are keyed by name.",
                    backend.name()
                )));
            }
            backend.validate()?;
        }

        // ═══════════════════════════════════════════════════════════════════════
        // Phase 2: Routing References
        // ═══════════════════════════════════════════════════════════════════════
        let routing = &self.routing;
        self.require_backend("routing.cloud_backend", &routing.cloud_backend)?;
        for (field, value) in [
            ("routing.local_backend", &routing.local_backend),
            ("routing.mid_tier_backend", &routing.mid_tier_backend),
            ("routing.force_backend", &routing.force_backend),
            ("fallback.backend", &self.fallback.backend),
        ] {
            if let Some(name) = value {
                self.require_backend(field, name)?;
            }
        }

        if routing.prefer_local && routing.local_backend.is_none() {
            return Err(AppError::Config(
                "routing.prefer_local = true requires routing.local_backend"
                    .to_string(),
            ));
        }
        if routing.mid_tier_backend.is_some()
            && routing.mid_tier_tool_ceiling < routing.local_tool_ceiling
        {
            return Err(AppError::Config(format!(
                "routing.mid_tier_tool_ceiling ({}) must be >= \
                routing.local_tool_ceiling ({})",
                routing.mid_tier_tool_ceiling, routing.local_tool_ceiling
            )));
        }
        if self.fallback.enabled && self.fallback.backend.is_none() {
            return Err(AppError::Config(
                "fallback.enabled = true requires fallback.backend"
                    .to_string(),
            ));
        }

        // ═══════════════════════════════════════════════════════════════════════
        // Phase 3: Resilience Thresholds
        // ═══════════════════════════════════════════════════════════════════════
        let breaker = &self.circuit_breaker;
        if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
            return Err(AppError::Config(
                "circuit_breaker.failure_threshold and \
                circuit_breaker.success_threshold must be greater than 0"
                    .to_string(),
            ));
        }
        if breaker.open_timeout_ms == 0 {
            return Err(AppError::Config(
                "circuit_breaker.open_timeout_ms must be greater than 0"
                    .to_string(),
            ));
        }

        let shedding = &self.load_shedding;
        for (field, ratio) in [
            ("load_shedding.max_heap_ratio", shedding.max_heap_ratio),
            ("load_shedding.max_cpu_ratio", shedding.max_cpu_ratio),
        ] {
            if !ratio.is_finite() || ratio <= 0.0 || ratio > 1.0 {
                return Err(AppError::Config(format!(
                    "{} must be a finite number in (0.0, 1.0], got {}",
                    field, ratio
                )));
            }
        }
        if shedding.max_concurrent_requests == 0 {
            return Err(AppError::Config(
                "load_shedding.max_concurrent_requests must be greater than 0"
                    .to_string(),
            ));
        }
        if shedding.retry_after_seconds == 0 {
            return Err(AppError::Config(
                "load_shedding.retry_after_seconds must be greater than 0"
                    .to_string(),
            ));
        }
        if shedding.sample_interval_ms < 100 {
            return Err(AppError::Config(format!(
                "load_shedding.sample_interval_ms must be at least 100, got {}",
                shedding.sample_interval_ms
            )));
        }
        if shedding.memory_limit_mb == Some(0) {
            return Err(AppError::Config(
                "load_shedding.memory_limit_mb must be greater than 0"
                    .to_string(),
            ));
        }

        if self.server.request_timeout_seconds == 0 {
            return Err(AppError::Config(
                "request_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    fn require_backend(&self, field: &str, name: &str) -> AppResult<()> {
        if self.backend(name).is_some() {
            return Ok(());
        }
        let available: Vec<&str> = self.backends.iter().map(|b| b.name()).collect();
        Err(AppError::Config(format!(
            "{} refers to unknown backend '{}'. Available backends: {}",
            field,
            name,
            available.join(", ")
        )))
    }
}

impl FromStr for Config {
    type Err = AppError;

    fn from_str(toml_str: &str) -> Result<Self, Self::Err> {
        let config: Config =
            toml::from_str(toml_str).map_err(|source| AppError::ConfigParseFailed {
                path: "<string>".to_string(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }
}
