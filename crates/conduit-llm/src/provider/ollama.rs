//! Ollama `/api/chat` NDJSON streaming driver

use std::time::Duration;

use async_trait::async_trait;
use conduit_config::{LlmProviderConfig, LlmProviderType};
use futures_util::StreamExt;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{AttemptGuard, EventStream, Provider, ProviderCapabilities, ProviderRequest, RateLimits};
use crate::convert::ollama::{Decoded, build_request, decode_line};
use crate::error::LlmError;
use crate::framing;
use crate::tools::ToolProtocol;

/// Default local Ollama server
const DEFAULT_BASE_URL: &str = "http://localhost:11434";

const DEFAULT_MAX_CONTEXT: u32 = 8192;
const DEFAULT_MAX_TOKENS: u32 = 2048;

/// Ollama provider; tool calling is not offered
pub struct OllamaProvider {
    name: String,
    client: Client,
    base_url: Url,
    model: String,
    timeout: Duration,
    max_context: u32,
    max_tokens: u32,
    requests_per_minute: u32,
}

impl OllamaProvider {
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
            max_context: config.limits.max_context.unwrap_or(DEFAULT_MAX_CONTEXT),
            max_tokens: config.limits.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            requests_per_minute: config.rate_limit.requests_per_minute,
        })
    }

    fn chat_url(&self) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        format!("{base}/api/chat")
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            provider: LlmProviderType::Ollama,
            supports_function_calling: false,
            supports_system_instruction: true,
            native_tool_protocol: ToolProtocol::None,
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
        false
    }

    async fn stream(
        &self,
        request: &ProviderRequest,
        api_key: Option<&SecretString>,
        cancel: CancellationToken,
    ) -> Result<EventStream, LlmError> {
        if !request.tools.is_empty() {
            tracing::debug!(provider = %self.name, "dropping tools, not supported");
        }

        let body = build_request(&self.model, request);
        let guard = AttemptGuard::new(cancel, self.timeout);

        // Keys only matter behind an authenticating proxy
        let mut builder = self.client.post(self.chat_url()).json(&body);
        if let Some(key) = api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = guard.send(&self.name, builder).await?;
        tracing::debug!(provider = %self.name, model = %self.model, "stream opened");

        let mut lines = Box::pin(framing::lines(response.bytes_stream()));

        let decoded = async_stream::stream! {
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };

                match decode_line(&line) {
                    Ok(Decoded::Events(events)) => {
                        for event in events {
                            yield Ok(event);
                        }
                    }
                    Ok(Decoded::Done(events)) => {
                        for event in events {
                            yield Ok(event);
                        }
                        return;
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }

            yield Err(LlmError::Streaming("stream ended before the final object".to_owned()));
        };

        Ok(guard.guard(Box::pin(decoded)))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::types::{ConversationTurn, StreamEvent, Usage};

    fn provider(server: &MockServer) -> OllamaProvider {
        let config: LlmProviderConfig = serde_json::from_value(json!({
            "type": "ollama",
            "model": "llama3",
            "base_url": server.uri()
        }))
        .unwrap();
        OllamaProvider::new("local", &config).unwrap()
    }

    fn request() -> ProviderRequest {
        ProviderRequest {
            history: vec![ConversationTurn::system("be brief"), ConversationTurn::user("hi")],
            ..ProviderRequest::default()
        }
    }

    #[tokio::test]
    async fn streams_ndjson_until_done() {
        let server = MockServer::start().await;

        let body = [
            json!({"message": {"role": "assistant", "content": "Hel"}, "done": false}),
            json!({"message": {"role": "assistant", "content": "lo"}, "done": false}),
            json!({"message": {"role": "assistant", "content": ""}, "done": true, "prompt_eval_count": 7, "eval_count": 2}),
        ]
        .iter()
        .map(|line| format!("{line}\n"))
        .collect::<String>();

        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({
                "model": "llama3",
                "stream": true,
                "messages": [{"role": "system", "content": "be brief"}, {"role": "user", "content": "hi"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&server)
            .await;

        let events: Vec<_> = provider(&server)
            .stream(&request(), None, CancellationToken::new())
            .await
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Text("Hel".to_owned()),
                StreamEvent::Text("lo".to_owned()),
                StreamEvent::Usage(Usage {
                    prompt_tokens: 7,
                    completion_tokens: 2
                }),
            ]
        );
    }

    #[tokio::test]
    async fn body_without_final_object_is_stream_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "{\"message\":{\"role\":\"assistant\",\"content\":\"partial\"},\"done\":false}\n",
            ))
            .mount(&server)
            .await;

        let events: Vec<_> = provider(&server)
            .stream(&request(), None, CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;

        assert!(matches!(&events[0], Ok(StreamEvent::Text(text)) if text == "partial"));
        assert!(matches!(&events[1], Err(LlmError::Streaming(_))));
    }

    #[tokio::test]
    async fn missing_model_is_upstream_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "model \"llama3\" not found"})))
            .mount(&server)
            .await;

        let Err(err) = provider(&server)
            .stream(&request(), None, CancellationToken::new())
            .await
        else {
            panic!("expected an error");
        };
        assert_eq!(err.status(), Some(404));
    }

    #[test]
    fn advertises_no_tools() {
        let config: LlmProviderConfig = serde_json::from_value(json!({"type": "ollama", "model": "llama3"})).unwrap();
        let provider = OllamaProvider::new("local", &config).unwrap();

        assert_eq!(provider.chat_url(), "http://localhost:11434/api/chat");
        assert!(!provider.capabilities().supports_function_calling);
        assert_eq!(provider.capabilities().native_tool_protocol, ToolProtocol::None);
        assert!(!provider.requires_api_key());
    }
}
