//! Google Generative Language streaming driver

use std::time::Duration;

use async_trait::async_trait;
use conduit_config::{LlmProviderConfig, LlmProviderType, ToolCallMode};
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{AttemptGuard, EventStream, Provider, ProviderCapabilities, ProviderRequest, RateLimits};
use crate::convert::google::{ChunkDecoder, build_request};
use crate::error::LlmError;
use crate::protocol::google::{GenerateResponse, SafetySetting};
use crate::tools::ToolProtocol;

/// Default Google Generative Language API base URL
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const DEFAULT_MAX_CONTEXT: u32 = 1_048_576;
const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Google Generative Language API provider
pub struct GoogleProvider {
    name: String,
    client: Client,
    base_url: Url,
    model: String,
    timeout: Duration,
    tool_call_mode: ToolCallMode,
    safety_settings: Vec<SafetySetting>,
    max_context: u32,
    max_tokens: u32,
    requests_per_minute: u32,
}

impl GoogleProvider {
    /// Create from provider configuration
    ///
    /// # Errors
    ///
    /// Returns `LlmError::Internal` if the base URL or timeout is invalid.
    pub fn new(name: impl Into<String>, config: &LlmProviderConfig) -> Result<Self, LlmError> {
        let base_url = match &config.base_url {
            Some(url) => url.clone(),
            None => Url::parse(DEFAULT_BASE_URL).map_err(anyhow::Error::from)?,
        };

        Ok(Self {
            name: name.into(),
            client: Client::new(),
            base_url,
            model: config.model.clone(),
            timeout: config.timeout()?,
            tool_call_mode: config.tool_call_mode,
            safety_settings: config.safety_settings.iter().map(SafetySetting::from).collect(),
            max_context: config.limits.max_context.unwrap_or(DEFAULT_MAX_CONTEXT),
            max_tokens: config.limits.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            requests_per_minute: config.rate_limit.requests_per_minute,
        })
    }

    /// Build the streaming URL for the configured model
    fn stream_url(&self) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        format!("{base}/models/{}:streamGenerateContent?alt=sse", self.model)
    }
}

#[async_trait]
impl Provider for GoogleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            provider: LlmProviderType::Google,
            supports_function_calling: true,
            supports_system_instruction: true,
            native_tool_protocol: ToolProtocol::Google,
            max_context: self.max_context,
            max_tokens: self.max_tokens,
            rate_limits: RateLimits {
                requests_per_minute: self.requests_per_minute,
            },
        }
    }

    fn is_configured(&self) -> bool {
        !self.model.trim().is_empty()
    }

    fn requires_api_key(&self) -> bool {
        true
    }

    async fn stream(
        &self,
        request: &ProviderRequest,
        api_key: Option<&SecretString>,
        cancel: CancellationToken,
    ) -> Result<EventStream, LlmError> {
        let Some(api_key) = api_key else {
            return Err(LlmError::NotConfigured(format!("{}: missing API key", self.name)));
        };

        let body = build_request(request, &self.safety_settings, self.tool_call_mode);
        let guard = AttemptGuard::new(cancel, self.timeout);

        let builder = self
            .client
            .post(self.stream_url())
            .header("x-goog-api-key", api_key.expose_secret())
            .json(&body);

        let response = guard.send(&self.name, builder).await?;
        tracing::debug!(provider = %self.name, model = %self.model, "stream opened");

        let provider = self.name.clone();
        let mut sse = Box::pin(response.bytes_stream().eventsource());

        let decoded = async_stream::stream! {
            let mut decoder = ChunkDecoder::default();

            while let Some(event) = sse.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        yield Err(super::sse_error(e));
                        return;
                    }
                };

                let data = event.data.trim();
                if data.is_empty() {
                    continue;
                }

                let chunk = match serde_json::from_str::<GenerateResponse>(data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::debug!(provider = %provider, error = %e, "skipping unparseable SSE chunk");
                        continue;
                    }
                };

                match decoder.decode(chunk) {
                    Ok(events) => {
                        for event in events {
                            yield Ok(event);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }

            if let Some(usage) = decoder.finish() {
                yield Ok(usage);
            }
        };

        Ok(guard.guard(Box::pin(decoded)))
    }
}
