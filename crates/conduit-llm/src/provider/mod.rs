//! Provider trait and streaming drivers

pub mod google;
pub mod ollama;
pub mod openai;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use conduit_config::LlmProviderType;
use futures_util::{Stream, StreamExt};
use secrecy::SecretString;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::LlmError;
use crate::tools::{ProviderTools, ToolProtocol};
use crate::types::{ConversationTurn, ModelParams, Role, StreamEvent};

/// Boxed stream of normalized events
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send>>;

/// Longest upstream error body kept on [`LlmError::Upstream`]
const MAX_ERROR_BODY: usize = 2048;

/// Capabilities advertised by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCapabilities {
    pub provider: LlmProviderType,
    pub supports_function_calling: bool,
    pub supports_system_instruction: bool,
    pub native_tool_protocol: ToolProtocol,
    pub max_context: u32,
    pub max_tokens: u32,
    pub rate_limits: RateLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimits {
    pub requests_per_minute: u32,
}

/// Everything a driver needs for one attempt
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    pub history: Vec<ConversationTurn>,
    pub tools: ProviderTools,
    /// System prompt used when the history has no leading system turn
    pub custom_rules: Option<String>,
    pub params: ModelParams,
}

impl ProviderRequest {
    /// System prompt from the leading system turns, else the custom rules
    pub fn system_prompt(&self) -> Option<String> {
        let leading: Vec<String> = self
            .history
            .iter()
            .take_while(|turn| turn.role == Role::System)
            .map(ConversationTurn::joined_text)
            .filter(|text| !text.trim().is_empty())
            .collect();

        if leading.is_empty() {
            self.custom_rules.clone().filter(|rules| !rules.trim().is_empty())
        } else {
            Some(leading.join("\n\n"))
        }
    }

    /// Turns other than system turns, in order
    pub fn conversation(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.history.iter().filter(|turn| turn.role != Role::System)
    }
}

/// Implemented by each upstream protocol
#[async_trait]
pub trait Provider: Send + Sync {
    /// Configured provider name
    fn name(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities;

    /// Whether the driver has what it needs apart from credentials
    fn is_configured(&self) -> bool;

    /// Whether every request must carry an API key
    fn requires_api_key(&self) -> bool;

    /// Start one streaming attempt
    ///
    /// The returned stream stops with [`LlmError::Aborted`] once `cancel`
    /// fires and with [`LlmError::Timeout`] once the driver's deadline passes.
    async fn stream(
        &self,
        request: &ProviderRequest,
        api_key: Option<&SecretString>,
        cancel: CancellationToken,
    ) -> Result<EventStream, LlmError>;
}

/// Map an SSE decoding failure
pub(crate) fn sse_error(error: eventsource_stream::EventStreamError<reqwest::Error>) -> LlmError {
    match error {
        eventsource_stream::EventStreamError::Transport(e) => LlmError::transport(&e),
        other => LlmError::Streaming(format!("failed to parse stream: {other}")),
    }
}

/// Cancellation and deadline shared by every await of one attempt
#[derive(Debug, Clone)]
pub(crate) struct AttemptGuard {
    cancel: CancellationToken,
    deadline: Instant,
    timeout: Duration,
}

impl AttemptGuard {
    pub(crate) fn new(cancel: CancellationToken, timeout: Duration) -> Self {
        Self {
            cancel,
            deadline: Instant::now() + timeout,
            timeout,
        }
    }

    /// Await `future` unless the attempt is cancelled or times out first
    pub(crate) async fn race<F: Future>(&self, future: F) -> Result<F::Output, LlmError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(LlmError::Aborted),
            () = tokio::time::sleep_until(self.deadline) => Err(LlmError::Timeout(self.timeout)),
            output = future => Ok(output),
        }
    }

    /// Wrap `inner` so every read is raced against cancel and deadline
    ///
    /// Dropping the inner stream releases the response body and with it the
    /// connection.
    pub(crate) fn guard(self, mut inner: EventStream) -> EventStream {
        let guard = self;
        Box::pin(async_stream::stream! {
            loop {
                match guard.race(inner.next()).await {
                    Ok(Some(Ok(event))) => yield Ok(event),
                    Ok(Some(Err(e))) | Err(e) => {
                        yield Err(e);
                        break;
                    }
                    Ok(None) => break,
                }
            }
        })
    }

    /// Send `builder` and turn non-success statuses into [`LlmError::Upstream`]
    pub(crate) async fn send(&self, provider: &str, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, LlmError> {
        let response = self.race(builder.send()).await?.map_err(|e| {
            tracing::warn!(provider, error = %e, "upstream request failed");
            LlmError::transport(&e)
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = self.race(response.text()).await?.unwrap_or_default();
        tracing::warn!(provider, status = status.as_u16(), "upstream returned error");

        Err(LlmError::Upstream {
            status: status.as_u16(),
            body: body.chars().take(MAX_ERROR_BODY).collect(),
        })
    }
}
