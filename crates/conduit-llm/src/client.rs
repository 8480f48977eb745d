//! Single entry point for callers: prompt assembly, tool preparation and
//! supervised streaming

use std::sync::Arc;

use conduit_config::{LlmProviderConfig, LlmProviderType};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::credentials::CredentialSet;
use crate::error::{LlmError, RequestError};
use crate::health::HealthSnapshot;
use crate::orchestrator::{Orchestrator, OrchestratorSettings, ResponseStream};
use crate::prompt::{Mode, PromptBuilder, PromptContext};
use crate::provider::google::GoogleProvider;
use crate::provider::ollama::OllamaProvider;
use crate::provider::openai::OpenAiProvider;
use crate::provider::{Provider, ProviderCapabilities, ProviderRequest};
use crate::tools::{self, ProviderTools};
use crate::types::{ConversationTurn, ModelParams, Role, StreamEvent, ToolDeclaration};

/// One chat request
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub history: Vec<ConversationTurn>,
    pub tools: Vec<ToolDeclaration>,
    pub mode: Mode,
    /// Appended to the system prompt as user rules
    pub custom_rules: Option<String>,
    pub cancel: CancellationToken,
    pub prompt_context: PromptContext,
}

impl ChatRequest {
    pub fn new(history: Vec<ConversationTurn>) -> Self {
        Self {
            history,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolDeclaration>) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_custom_rules(mut self, rules: impl Into<String>) -> Self {
        self.custom_rules = Some(rules.into());
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_prompt_context(mut self, context: PromptContext) -> Self {
        self.prompt_context = context;
        self
    }
}

/// Build the driver for a configured provider
///
/// # Errors
///
/// Returns an error if the provider configuration is invalid
pub fn build_provider(name: &str, config: &LlmProviderConfig) -> Result<Arc<dyn Provider>, LlmError> {
    let provider: Arc<dyn Provider> = match config.provider_type {
        LlmProviderType::Google => Arc::new(GoogleProvider::new(name, config)?),
        LlmProviderType::Openai => Arc::new(OpenAiProvider::new(name, config)?),
        LlmProviderType::Ollama => Arc::new(OllamaProvider::new(name, config)?),
    };
    Ok(provider)
}

/// Chat client bound to one supervised provider
#[derive(Clone)]
pub struct LlmClient {
    orchestrator: Orchestrator,
    prompts: PromptBuilder,
    enable_tools: bool,
    params: ModelParams,
}

impl LlmClient {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            prompts: PromptBuilder::default(),
            enable_tools: true,
            params: ModelParams::default(),
        }
    }

    /// Client for a configured provider
    pub fn from_config(name: &str, config: &LlmProviderConfig) -> Result<Self, LlmError> {
        let provider = build_provider(name, config)?;
        let settings = OrchestratorSettings::from_config(config)?;
        let credentials = CredentialSet::new(config.api_keys.clone());

        tracing::debug!(
            provider = name,
            provider_type = %config.provider_type,
            model = %config.model,
            keys = credentials.len(),
            "provider client created"
        );

        Ok(Self {
            enable_tools: config.enable_tools,
            params: ModelParams::from(&config.params),
            ..Self::new(Orchestrator::new(provider, credentials, settings))
        })
    }

    #[must_use]
    pub fn with_prompt_builder(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    /// Generation parameters that override the per-mode defaults
    #[must_use]
    pub const fn with_params(mut self, params: ModelParams) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub const fn with_tools_enabled(mut self, enable_tools: bool) -> Self {
        self.enable_tools = enable_tools;
        self
    }

    pub fn name(&self) -> &str {
        self.orchestrator.name()
    }

    pub fn capabilities(&self) -> ProviderCapabilities {
        self.orchestrator.capabilities()
    }

    pub fn health(&self) -> HealthSnapshot {
        self.orchestrator.health()
    }

    pub const fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Driver-ready request for `request`
    ///
    /// A system turn carrying the built prompt is inserted at the head of the
    /// history unless the caller supplied one.
    pub fn prepare(&self, request: &ChatRequest) -> ProviderRequest {
        let pack = self
            .prompts
            .build(request.mode, request.custom_rules.as_deref(), &request.prompt_context);

        let mut history = Vec::with_capacity(request.history.len() + 1);
        if request.history.first().is_none_or(|turn| turn.role != Role::System) {
            history.push(ConversationTurn::system(pack.system_prompt));
        }
        history.extend(request.history.iter().cloned());

        let capabilities = self.capabilities();
        let tools = if self.enable_tools && capabilities.supports_function_calling {
            tools::to_provider_declarations(capabilities.native_tool_protocol, &request.tools)
        } else {
            if !request.tools.is_empty() {
                tracing::debug!(provider = self.name(), count = request.tools.len(), "tools disabled, not sending");
            }
            ProviderTools::None
        };

        ProviderRequest {
            history,
            tools,
            custom_rules: request.custom_rules.clone(),
            params: self.params.or(pack.model_params),
        }
    }

    /// Stream the model's response to `request`
    pub fn send_message_stream(&self, request: ChatRequest) -> ResponseStream {
        let prepared = self.prepare(&request);
        self.orchestrator.send_message_stream(prepared, request.cancel)
    }

    /// Send `prompt` as a new user turn and collect the text of the reply
    ///
    /// Non-text events are ignored.
    pub async fn send_prompt(&self, prompt: &str, mut options: ChatRequest) -> Result<String, RequestError> {
        options.history.push(ConversationTurn::user(prompt));

        let mut stream = self.send_message_stream(options);
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            if let StreamEvent::Text(delta) = event? {
                text.push_str(&delta);
            }
        }
        Ok(text)
    }
}
