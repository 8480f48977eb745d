//! Registry of configured provider clients

use std::sync::Arc;

use conduit_config::LlmConfig;
use indexmap::IndexMap;
use serde::Serialize;

use crate::client::LlmClient;
use crate::error::LlmError;
use crate::health::HealthSnapshot;
use crate::provider::ProviderCapabilities;

/// Every configured provider, each behind its own orchestrator
#[derive(Clone)]
pub struct Conduit {
    inner: Arc<ConduitInner>,
}

struct ConduitInner {
    clients: IndexMap<String, LlmClient>,
    default_provider: Option<String>,
}

/// Health of one provider for status output
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub name: String,
    pub capabilities: ProviderCapabilities,
    pub health: HealthSnapshot,
}

impl Conduit {
    /// Build a client for every configured provider
    ///
    /// # Errors
    ///
    /// Returns an error if any provider fails to initialize
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let mut clients = IndexMap::new();

        for (name, provider_config) in &config.providers {
            clients.insert(name.clone(), LlmClient::from_config(name, provider_config)?);
        }

        if let Some(default) = &config.default_provider
            && !clients.contains_key(default)
        {
            return Err(LlmError::NotConfigured(format!("default provider '{default}' is not defined")));
        }

        tracing::info!(providers = clients.len(), "llm providers ready");

        Ok(Self {
            inner: Arc::new(ConduitInner {
                clients,
                default_provider: config.default_provider.clone(),
            }),
        })
    }

    /// Client for a named provider
    ///
    /// # Errors
    ///
    /// Returns `LlmError::NotConfigured` for unknown names
    pub fn client(&self, name: &str) -> Result<&LlmClient, LlmError> {
        self.inner
            .clients
            .get(name)
            .ok_or_else(|| LlmError::NotConfigured(format!("unknown provider '{name}'")))
    }

    /// The configured default, else the first provider
    ///
    /// # Errors
    ///
    /// Returns `LlmError::NotConfigured` when no provider is configured
    pub fn default_client(&self) -> Result<&LlmClient, LlmError> {
        match &self.inner.default_provider {
            Some(name) => self.client(name),
            None => self
                .inner
                .clients
                .values()
                .next()
                .ok_or_else(|| LlmError::NotConfigured("no providers configured".to_owned())),
        }
    }

    /// Named provider, or the default when `name` is `None`
    pub fn resolve(&self, name: Option<&str>) -> Result<&LlmClient, LlmError> {
        name.map_or_else(|| self.default_client(), |name| self.client(name))
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.inner.clients.keys().map(String::as_str)
    }

    /// Status of every provider, in configuration order
    pub fn health(&self) -> Vec<ProviderStatus> {
        self.inner
            .clients
            .iter()
            .map(|(name, client)| ProviderStatus {
                name: name.clone(),
                capabilities: client.capabilities(),
                health: client.health(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::health::CircuitState;

    fn config(value: serde_json::Value) -> LlmConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn resolves_named_default_and_first() {
        let conduit = Conduit::from_config(&config(json!({
            "providers": {
                "local": {"type": "ollama", "model": "llama3"},
                "gemini": {"type": "google", "model": "gemini-2.0-flash", "api_keys": ["k"]}
            }
        })))
        .unwrap();

        assert_eq!(conduit.providers().collect::<Vec<_>>(), ["local", "gemini"]);
        assert_eq!(conduit.default_client().unwrap().name(), "local");
        assert_eq!(conduit.resolve(Some("gemini")).unwrap().name(), "gemini");
        assert!(matches!(conduit.client("nope"), Err(LlmError::NotConfigured(_))));
    }

    #[test]
    fn explicit_default_must_exist() {
        let result = Conduit::from_config(&config(json!({
            "default_provider": "missing",
            "providers": {"local": {"type": "ollama", "model": "llama3"}}
        })));
        assert!(result.is_err());
    }

    #[test]
    fn empty_registry_has_no_default() {
        let conduit = Conduit::from_config(&LlmConfig::default()).unwrap();
        assert!(conduit.default_client().is_err());
        assert!(conduit.health().is_empty());
    }

    #[test]
    fn health_lists_every_provider() {
        let conduit = Conduit::from_config(&config(json!({
            "providers": {"local": {"type": "ollama", "model": "llama3"}}
        })))
        .unwrap();

        let status = conduit.health();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].name, "local");
        assert_eq!(status[0].health.breaker_state, CircuitState::Closed);
        assert!(status[0].health.healthy);

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value[0]["health"]["breakerState"], "CLOSED");
        assert_eq!(value[0]["capabilities"]["nativeToolProtocol"], "none");
    }
}
