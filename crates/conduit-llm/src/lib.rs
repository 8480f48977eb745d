//! Multi-provider LLM streaming for Conduit
//!
//! Normalizes Google, OpenAI-compatible and Ollama streaming chat behind one
//! event model, and supervises every request with rate pacing, a circuit
//! breaker, classified retries and API key rotation.

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod classify;
pub mod client;
pub mod convert;
pub mod credentials;
pub mod error;
pub mod framing;
pub mod health;
pub mod orchestrator;
pub mod prompt;
pub mod protocol;
pub mod provider;
pub mod retry;
pub mod state;
pub mod throttle;
pub mod tools;
pub mod types;

pub use classify::{ErrorClassification, ErrorKind, classify, classify_error};
pub use client::{ChatRequest, LlmClient};
pub use error::{LlmError, RequestError, Severity};
pub use health::{CircuitState, HealthSnapshot};
pub use orchestrator::{Orchestrator, OrchestratorSettings, ResponseStream};
pub use prompt::{Mode, PromptBuilder, PromptContext, PromptPack, Slot};
pub use provider::{Provider, ProviderCapabilities, ProviderRequest};
pub use state::{Conduit, ProviderStatus};
pub use types::{ConversationTurn, FunctionCall, FunctionResponse, Part, Role, Schema, StreamEvent, ToolDeclaration, Usage};
