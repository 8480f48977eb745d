//! Programmatic configuration builder for integration tests

use conduit_config::{
    CircuitBreakerConfig, Config, JitterMode, LlmProviderConfig, LlmProviderType, ModelLimits, ModelParamsConfig,
    RateLimitConfig, RetryConfig, ToolCallMode,
};
use indexmap::IndexMap;
use secrecy::SecretString;

/// Builder for constructing test configurations
///
/// Providers start with millisecond backoff and no jitter so retry tests stay
/// fast and deterministic.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Add an OpenAI-compatible provider pointed at a mock backend
    pub fn with_openai_provider(self, name: &str, base_url: &str, keys: &[&str]) -> Self {
        self.with_provider(name, LlmProviderType::Openai, "mock-gpt", base_url, keys)
    }

    /// Add a Google provider pointed at a mock backend
    pub fn with_google_provider(self, name: &str, base_url: &str, keys: &[&str]) -> Self {
        self.with_provider(name, LlmProviderType::Google, "mock-gemini", base_url, keys)
    }

    /// Add an Ollama provider pointed at a mock backend
    pub fn with_ollama_provider(self, name: &str, base_url: &str) -> Self {
        self.with_provider(name, LlmProviderType::Ollama, "mock-llama", base_url, &[])
    }

    fn with_provider(
        mut self,
        name: &str,
        provider_type: LlmProviderType,
        model: &str,
        base_url: &str,
        keys: &[&str],
    ) -> Self {
        self.config.llm.providers.insert(
            name.to_owned(),
            LlmProviderConfig {
                provider_type,
                model: model.to_owned(),
                api_keys: keys.iter().map(|k| SecretString::from(*k)).collect(),
                base_url: Some(base_url.parse().expect("valid URL")),
                timeout: "10s".to_owned(),
                rotate_on_success: false,
                enable_tools: true,
                tool_call_mode: ToolCallMode::Auto,
                estimate_usage: false,
                retry: RetryConfig {
                    attempts: 3,
                    delay: "1ms".to_owned(),
                    multiplier: 2.0,
                    max_delay: "10ms".to_owned(),
                    jitter: JitterMode::None,
                },
                rate_limit: RateLimitConfig::default(),
                circuit_breaker: CircuitBreakerConfig::default(),
                params: ModelParamsConfig::default(),
                safety_settings: IndexMap::new(),
                limits: ModelLimits::default(),
            },
        );
        self
    }

    /// Adjust a provider added earlier
    pub fn configure(mut self, name: &str, f: impl FnOnce(&mut LlmProviderConfig)) -> Self {
        if let Some(provider) = self.config.llm.providers.get_mut(name) {
            f(provider);
        }
        self
    }

    pub fn with_default_provider(mut self, name: &str) -> Self {
        self.config.llm.default_provider = Some(name.to_owned());
        self
    }

    /// Build the final config, validating it like a loaded file
    pub fn build(self) -> Config {
        self.config.validate().expect("test config must be valid");
        self.config
    }
}
