use std::path::Path;

use crate::llm::parse_duration;
use crate::{Config, LlmProviderType};

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Reads the file, expands `{{ env.VAR }}` placeholders, then
    /// deserializes and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, environment variable
    /// expansion fails, TOML parsing fails, or validation fails
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

        let config = Self::parse(&raw)?;
        tracing::debug!(
            path = %path.display(),
            providers = config.llm.providers.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns an error if expansion, parsing or validation fails
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let expanded =
            crate::env::expand_env(raw).map_err(|e| anyhow::anyhow!("config variable expansion failed: {e}"))?;

        let config: Self = toml::from_str(&expanded).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate that the configuration is internally consistent
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending provider and field
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.llm.providers.is_empty() {
            anyhow::bail!("at least one LLM provider must be configured");
        }

        if let Some(default) = &self.llm.default_provider
            && !self.llm.providers.contains_key(default)
        {
            anyhow::bail!("default_provider '{default}' does not name a configured provider");
        }

        for (name, provider) in &self.llm.providers {
            validate_provider(name, provider)
                .map_err(|e| anyhow::anyhow!("invalid configuration for provider '{name}': {e}"))?;
        }

        Ok(())
    }
}

fn validate_provider(name: &str, provider: &crate::LlmProviderConfig) -> anyhow::Result<()> {
    if provider.model.trim().is_empty() {
        anyhow::bail!("model must not be empty");
    }

    parse_duration("timeout", &provider.timeout)?;
    parse_duration("retry.delay", &provider.retry.delay)?;
    parse_duration("retry.max_delay", &provider.retry.max_delay)?;
    parse_duration("circuit_breaker.cooldown", &provider.circuit_breaker.cooldown)?;

    if provider.retry.attempts == 0 {
        anyhow::bail!("retry.attempts must be at least 1");
    }
    if !(provider.retry.multiplier.is_finite() && provider.retry.multiplier >= 1.0) {
        anyhow::bail!("retry.multiplier must be a finite number of at least 1.0");
    }
    if provider.rate_limit.requests_per_minute == 0 {
        anyhow::bail!("rate_limit.requests_per_minute must be at least 1");
    }
    if provider.circuit_breaker.failure_threshold == 0 {
        anyhow::bail!("circuit_breaker.failure_threshold must be at least 1");
    }
    if provider.circuit_breaker.half_open_max_attempts == 0 {
        anyhow::bail!("circuit_breaker.half_open_max_attempts must be at least 1");
    }

    if !provider.safety_settings.is_empty() && provider.provider_type != LlmProviderType::Google {
        anyhow::bail!("safety_settings are only supported by google providers");
    }

    let canonical_openai = provider
        .base_url
        .as_ref()
        .is_none_or(|url| url.host_str() == Some("api.openai.com"));
    let needs_key = match provider.provider_type {
        LlmProviderType::Google => true,
        LlmProviderType::Openai => canonical_openai,
        LlmProviderType::Ollama => false,
    };
    if needs_key && provider.api_keys.is_empty() {
        anyhow::bail!("{} provider '{name}' requires at least one api key", provider.provider_type);
    }

    Ok(())
}
