//! OpenAI-compatible chat completions streaming driver

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
use crate::convert::openai::{ChunkDecoder, build_request, estimate_usage};
use crate::error::LlmError;
use crate::protocol::openai::StreamChunk;
use crate::tools::ToolProtocol;
use crate::types::StreamEvent;

/// Default `OpenAI` API base URL
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const DEFAULT_MAX_CONTEXT: u32 = 128_000;
const DEFAULT_MAX_TOKENS: u32 = 16_384;

/// Whether the provider is the canonical OpenAI API (vs a compatible third-party)
fn is_canonical_openai(base_url: &Url) -> bool {
    base_url.host_str().is_some_and(|h| h == "api.openai.com")
}

/// OpenAI-compatible provider
pub struct OpenAiProvider {
    name: String,
    client: Client,
    base_url: Url,
    model: String,
    timeout: Duration,
    tool_call_mode: ToolCallMode,
    estimate_usage: bool,
    max_context: u32,
    max_tokens: u32,
    requests_per_minute: u32,
}

impl OpenAiProvider {
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
            estimate_usage: config.estimate_usage,
            max_context: config.limits.max_context.unwrap_or(DEFAULT_MAX_CONTEXT),
            max_tokens: config.limits.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            requests_per_minute: config.rate_limit.requests_per_minute,
        })
    }

    /// Build the chat completions URL
    fn completions_url(&self) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        format!("{base}/chat/completions")
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            provider: LlmProviderType::Openai,
            supports_function_calling: true,
            supports_system_instruction: true,
            native_tool_protocol: ToolProtocol::OpenAi,
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

    /// Compatible self-hosted servers often run without keys
    fn requires_api_key(&self) -> bool {
        is_canonical_openai(&self.base_url)
    }

    async fn stream(
        &self,
        request: &ProviderRequest,
        api_key: Option<&SecretString>,
        cancel: CancellationToken,
    ) -> Result<EventStream, LlmError> {
        if api_key.is_none() && self.requires_api_key() {
            return Err(LlmError::NotConfigured(format!("{}: missing API key", self.name)));
        }

        // Only send stream_options to canonical OpenAI; many compatible
        // servers reject the unsupported parameter
        let mut body = build_request(&self.model, request, self.tool_call_mode, is_canonical_openai(&self.base_url));
        let guard = AttemptGuard::new(cancel, self.timeout);

        let mut builder = self.client.post(self.completions_url()).json(&body);
        if let Some(key) = api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = guard.send(&self.name, builder).await?;
        tracing::debug!(provider = %self.name, model = %self.model, "stream opened");

        let provider = self.name.clone();
        let prompt = if self.estimate_usage {
            std::mem::take(&mut body.messages)
        } else {
            Vec::new()
        };
        let estimate = self.estimate_usage;
        let mut sse = Box::pin(response.bytes_stream().eventsource());

        let decoded = async_stream::stream! {
            let mut decoder = ChunkDecoder::default();
            let mut completion = String::new();

            while let Some(event) = sse.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        yield Err(super::sse_error(e));
                        return;
                    }
                };

                let data = event.data.trim();
                if data == "[DONE]" {
                    break;
                }
                if data.is_empty() {
                    continue;
                }

                let chunk = match serde_json::from_str::<StreamChunk>(data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::debug!(provider = %provider, error = %e, "skipping unparseable SSE chunk");
                        continue;
                    }
                };

                match decoder.decode(chunk) {
                    Ok(events) => {
                        for event in events {
                            if estimate && let StreamEvent::Text(text) = &event {
                                completion.push_str(text);
                            }
                            yield Ok(event);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }

            let reported = decoder.has_usage();
            match decoder.finish() {
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

            if estimate && !reported {
                yield Ok(StreamEvent::Usage(estimate_usage(&prompt, &completion)));
            }
        };

        Ok(guard.guard(Box::pin(decoded)))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::tools::{self, ProviderTools};
    use crate::types::{ConversationTurn, Schema, ToolDeclaration, Usage};

    fn provider(server: &MockServer, estimate_usage: bool) -> OpenAiProvider {
        let config: LlmProviderConfig = serde_json::from_value(json!({
            "type": "openai",
            "model": "gpt-test",
            "base_url": format!("{}/v1", server.uri()),
            "estimate_usage": estimate_usage
        }))
        .unwrap();
        OpenAiProvider::new("openai", &config).unwrap()
    }

    fn sse(payloads: &[serde_json::Value]) -> String {
        let mut body: String = payloads.iter().map(|p| format!("data: {p}\n\n")).collect();
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn sse_response(payloads: &[serde_json::Value]) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/event-stream")
            .set_body_string(sse(payloads))
    }

    #[tokio::test]
    async fn streams_text_then_tool_calls() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-1"))
            .respond_with(sse_response(&[
                json!({"choices": [{"index": 0, "delta": {"role": "assistant", "content": "Reading"}}]}),
                json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 0, "id": "call_1", "type": "function", "function": {"name": "read_file", "arguments": ""}}
                ]}}]}),
                json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 0, "function": {"arguments": "{\"path\":\"a.rs\"}"}}
                ]}}]}),
                json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
            ]))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider(&server, false);
        let request = ProviderRequest {
            history: vec![ConversationTurn::system("rules"), ConversationTurn::user("open a.rs")],
            tools: tools::to_provider_declarations(
                ToolProtocol::OpenAi,
                &[ToolDeclaration::new("read_file", "Read", Schema::object([("path", Schema::string())]))],
            ),
            ..ProviderRequest::default()
        };
        assert!(matches!(request.tools, ProviderTools::OpenAi(_)));

        let key = SecretString::from("sk-1".to_owned());
        let events: Vec<_> = provider
            .stream(&request, Some(&key), CancellationToken::new())
            .await
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Text("Reading".to_owned()));
        let StreamEvent::FunctionCalls(calls) = &events[1] else {
            panic!("expected function calls, got {events:?}");
        };
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].args["path"], "a.rs");

        let received = &server.received_requests().await.unwrap()[0];
        let body: serde_json::Value = serde_json::from_slice(&received.body).unwrap();
        assert_eq!(body["messages"][0], json!({"role": "system", "content": "rules"}));
        assert_eq!(body["tool_choice"], "auto");
        assert!(body.get("stream_options").is_none());
    }

    #[tokio::test]
    async fn estimates_usage_when_server_omits_it() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(sse_response(&[
                json!({"choices": [{"delta": {"content": "hello world"}, "finish_reason": "stop"}]}),
            ]))
            .mount(&server)
            .await;

        let provider = provider(&server, true);
        let request = ProviderRequest {
            history: vec![ConversationTurn::user("say hello")],
            ..ProviderRequest::default()
        };
        let events: Vec<_> = provider
            .stream(&request, None, CancellationToken::new())
            .await
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;

        let Some(StreamEvent::Usage(Usage {
            prompt_tokens,
            completion_tokens,
        })) = events.last()
        else {
            panic!("expected trailing usage, got {events:?}");
        };
        assert!(*prompt_tokens > 0);
        assert!(*completion_tokens > 0);
    }

    #[tokio::test]
    async fn truncated_tool_call_is_stream_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(sse_response(&[json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "read_file", "arguments": "{\"pa"}}
            ]}}]})]))
            .mount(&server)
            .await;

        let provider = provider(&server, false);
        let request = ProviderRequest {
            history: vec![ConversationTurn::user("go")],
            ..ProviderRequest::default()
        };
        let events: Vec<_> = provider
            .stream(&request, None, CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Err(LlmError::Streaming(msg)) if msg.contains("malformed response")));
    }

    #[tokio::test]
    async fn rate_limit_status_is_surfaced() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"message": "Rate limit reached", "type": "requests"}
            })))
            .mount(&server)
            .await;

        let provider = provider(&server, false);
        let Err(err) = provider
            .stream(&ProviderRequest::default(), None, CancellationToken::new())
            .await
        else {
            panic!("expected an error");
        };
        assert_eq!(err.status(), Some(429));
    }

    #[test]
    fn only_canonical_endpoint_requires_key() {
        let config: LlmProviderConfig = serde_json::from_value(json!({"type": "openai", "model": "gpt-4o"})).unwrap();
        let canonical = OpenAiProvider::new("openai", &config).unwrap();
        assert!(canonical.requires_api_key());
        assert_eq!(canonical.completions_url(), "https://api.openai.com/v1/chat/completions");

        let config: LlmProviderConfig = serde_json::from_value(json!({
            "type": "openai",
            "model": "local",
            "base_url": "http://localhost:1234/v1"
        }))
        .unwrap();
        assert!(!OpenAiProvider::new("local", &config).unwrap().requires_api_key());
    }
}
