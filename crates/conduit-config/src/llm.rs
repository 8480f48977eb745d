use std::time::Duration;

use indexmap::IndexMap;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use url::Url;

/// Top-level LLM configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    /// Provider used when a caller does not name one (first provider otherwise)
    #[serde(default)]
    pub default_provider: Option<String>,
    /// LLM provider configurations keyed by name
    #[serde(default)]
    pub providers: IndexMap<String, LlmProviderConfig>,
}

/// Configuration for a single LLM provider
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmProviderConfig {
    /// Provider protocol type
    #[serde(rename = "type")]
    pub provider_type: LlmProviderType,
    /// Model identifier sent upstream
    pub model: String,
    /// Ordered credential set, consumed round-robin
    #[serde(default)]
    pub api_keys: Vec<SecretString>,
    /// Base URL override
    #[serde(default)]
    pub base_url: Option<Url>,
    /// Per-request timeout (e.g. "5m", "90s")
    #[serde(default = "default_timeout")]
    pub timeout: String,
    /// Advance the credential cursor after every successful request
    #[serde(default)]
    pub rotate_on_success: bool,
    /// Send tool declarations upstream
    #[serde(default = "default_true")]
    pub enable_tools: bool,
    /// How the model may select tools
    #[serde(default)]
    pub tool_call_mode: ToolCallMode,
    /// Estimate token usage locally when the upstream omits it
    #[serde(default = "default_true")]
    pub estimate_usage: bool,
    /// Retry and backoff behavior
    #[serde(default)]
    pub retry: RetryConfig,
    /// Client-side request pacing
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Circuit breaker thresholds
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Model generation parameters
    #[serde(default)]
    pub params: ModelParamsConfig,
    /// Google safety thresholds keyed by harm category
    #[serde(default)]
    pub safety_settings: IndexMap<String, String>,
    /// Advertised model limits
    #[serde(default)]
    pub limits: ModelLimits,
}

impl LlmProviderConfig {
    /// Parsed per-request timeout
    pub fn timeout(&self) -> anyhow::Result<Duration> {
        parse_duration("timeout", &self.timeout)
    }
}

/// Supported LLM provider protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LlmProviderType {
    /// Google Generative Language API
    Google,
    /// OpenAI-compatible chat completions API
    Openai,
    /// Self-hosted Ollama server
    Ollama,
}

/// Tool selection policy passed to the upstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallMode {
    /// Model decides whether to call tools
    #[default]
    Auto,
    /// Model must call at least one tool
    Any,
    /// Model must not call tools
    None,
}

/// Jitter applied to the exponential backoff schedule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JitterMode {
    /// Use the base schedule unchanged
    None,
    /// Uniform in `[0, delay]`
    #[default]
    Full,
    /// Half the delay plus uniform in `[0, delay / 2]`
    Equal,
    /// Uniform in `[base, previous * multiplier]`, capped
    Decorrelated,
}

/// Retry configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Maximum attempts per request, including the first
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Base backoff delay
    #[serde(default = "default_retry_delay")]
    pub delay: String,
    /// Exponential growth factor
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound for any single delay
    #[serde(default = "default_max_delay")]
    pub max_delay: String,
    /// Jitter strategy
    #[serde(default)]
    pub jitter: JitterMode,
}

impl RetryConfig {
    /// Parsed base delay
    pub fn delay(&self) -> anyhow::Result<Duration> {
        parse_duration("retry.delay", &self.delay)
    }

    /// Parsed maximum delay
    pub fn max_delay(&self) -> anyhow::Result<Duration> {
        parse_duration("retry.max_delay", &self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay: default_retry_delay(),
            multiplier: default_multiplier(),
            max_delay: default_max_delay(),
            jitter: JitterMode::default(),
        }
    }
}

/// Client-side sliding-window request pacing
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Maximum attempts started within any 60 second window
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Failures before the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time the breaker stays open before allowing a probe
    #[serde(default = "default_cooldown")]
    pub cooldown: String,
    /// Concurrent probes allowed while half-open
    #[serde(default = "default_half_open_max_attempts")]
    pub half_open_max_attempts: u32,
}

impl CircuitBreakerConfig {
    /// Parsed cooldown
    pub fn cooldown(&self) -> anyhow::Result<Duration> {
        parse_duration("circuit_breaker.cooldown", &self.cooldown)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown: default_cooldown(),
            half_open_max_attempts: default_half_open_max_attempts(),
        }
    }
}

/// Generation parameters; unset fields fall back to per-mode defaults
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelParamsConfig {
    /// Maximum tokens to generate
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Nucleus sampling threshold
    #[serde(default)]
    pub top_p: Option<f64>,
}

/// Advertised model limits
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelLimits {
    /// Context window in tokens
    #[serde(default)]
    pub max_context: Option<u32>,
    /// Maximum output tokens
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

pub(crate) fn parse_duration(field: &str, value: &str) -> anyhow::Result<Duration> {
    duration_str::parse(value).map_err(|e| anyhow::anyhow!("invalid duration for {field} '{value}': {e}"))
}

fn default_timeout() -> String {
    "300000ms".to_owned()
}

const fn default_true() -> bool {
    true
}

const fn default_attempts() -> u32 {
    3
}

fn default_retry_delay() -> String {
    "1000ms".to_owned()
}

const fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> String {
    "30s".to_owned()
}

const fn default_requests_per_minute() -> u32 {
    60
}

const fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown() -> String {
    "30000ms".to_owned()
}

const fn default_half_open_max_attempts() -> u32 {
    1
}
