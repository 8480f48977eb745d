//! Neutral conversation to OpenAI chat messages, and stream chunks back to
//! events

use std::collections::{BTreeMap, HashSet};

use conduit_config::ToolCallMode;
use serde_json::{Value, json};
use tiktoken_rs::o200k_base;

use crate::error::LlmError;
use crate::protocol::openai::{
    ChatMessage, ChatRequest, FunctionCall, StreamChunk, StreamOptions, ToolCall, ToolCallFragment, Usage as WireUsage,
};
use crate::provider::ProviderRequest;
use crate::tools::{self, ProviderTools, RawArgs, RawCall, ToolProtocol};
use crate::types::{ConversationTurn, Role, StreamEvent, Usage};

/// Build the request body
pub fn build_request(
    model: &str,
    request: &ProviderRequest,
    tool_call_mode: ToolCallMode,
    include_usage: bool,
) -> ChatRequest {
    let tools = match &request.tools {
        ProviderTools::OpenAi(tools) => tools.clone(),
        ProviderTools::Google(_) => {
            tracing::debug!("ignoring tools prepared for a different protocol");
            Vec::new()
        }
        ProviderTools::None => Vec::new(),
    };

    let tool_choice = (!tools.is_empty()).then_some(match tool_call_mode {
        ToolCallMode::Auto => "auto",
        ToolCallMode::Any => "required",
        ToolCallMode::None => "none",
    });

    ChatRequest {
        model: model.to_owned(),
        messages: build_messages(request),
        stream: true,
        stream_options: include_usage.then_some(StreamOptions { include_usage: true }),
        temperature: request.params.temperature,
        top_p: request.params.top_p,
        max_tokens: request.params.max_tokens,
        tools,
        tool_choice,
    }
}

/// System message first, then the conversation, trimmed to a list the
/// server accepts
pub fn build_messages(request: &ProviderRequest) -> Vec<ChatMessage> {
    let mut messages = Vec::new();

    if let Some(system) = request.system_prompt() {
        messages.push(ChatMessage::new("system", system));
    }

    for turn in request.conversation() {
        push_turn(&mut messages, turn);
    }

    sanitize(messages)
}

fn push_turn(messages: &mut Vec<ChatMessage>, turn: &ConversationTurn) {
    match turn.role {
        Role::User => {
            for response in turn.function_responses() {
                let content = match &response.response {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                messages.push(ChatMessage::tool_result(response.id.clone(), content));
            }

            let text = turn.joined_text();
            if !text.is_empty() {
                messages.push(ChatMessage::new("user", text));
            }
        }
        Role::Model => {
            let calls: Vec<_> = turn.function_calls().cloned().collect();
            let tool_calls: Vec<ToolCall> = tools::to_provider_calls(ToolProtocol::OpenAi, &calls)
                .into_iter()
                .map(|call| ToolCall {
                    id: call.id.unwrap_or_default(),
                    tool_type: "function".to_owned(),
                    function: FunctionCall {
                        name: call.name,
                        arguments: match call.args {
                            RawArgs::Encoded(text) => text,
                            RawArgs::Structured(map) => Value::Object(map).to_string(),
                        },
                    },
                })
                .collect();

            let text = turn.joined_text();
            if text.is_empty() && tool_calls.is_empty() {
                return;
            }

            messages.push(ChatMessage {
                role: "assistant".to_owned(),
                content: (!text.is_empty()).then_some(text),
                tool_calls,
                tool_call_id: None,
            });
        }
        Role::System => {}
    }
}

/// Cut the list at the first break in assistant/tool pairing
///
/// Every assistant message with `tool_calls` must be followed by exactly one
/// `tool` message per call id before anything else, and a `tool` message
/// must answer a call of the assistant message just before it.
pub fn sanitize(mut messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut pending: HashSet<String> = HashSet::new();
    let mut open_at: Option<usize> = None;
    let mut cut: Option<usize> = None;

    for (index, message) in messages.iter().enumerate() {
        if message.role == "tool" {
            let answered = message
                .tool_call_id
                .as_ref()
                .is_some_and(|id| pending.remove(id));
            if !answered {
                cut = Some(open_at.filter(|_| !pending.is_empty()).unwrap_or(index));
                break;
            }
            if pending.is_empty() {
                open_at = None;
            }
            continue;
        }

        if let Some(start) = open_at {
            cut = Some(start);
            break;
        }

        if message.role == "assistant" && !message.tool_calls.is_empty() {
            pending = message.tool_calls.iter().map(|call| call.id.clone()).collect();
            open_at = Some(index);
        }
    }

    if cut.is_none() {
        cut = open_at;
    }

    if let Some(at) = cut {
        tracing::warn!(
            kept = at,
            dropped = messages.len() - at,
            "trimming history at unpaired tool call"
        );
        messages.truncate(at);
    }

    messages
}

/// Tool call assembled from fragments sharing one `index`
#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl PartialCall {
    fn is_complete(&self) -> bool {
        let args = self.arguments.trim();
        self.id.is_some()
            && self.name.is_some()
            && (args.is_empty() || serde_json::from_str::<Value>(args).is_ok())
    }
}

/// Collects streamed tool call fragments until they form whole calls
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u32, PartialCall>,
}

impl ToolCallAccumulator {
    /// Merge one fragment
    ///
    /// Ids and names arrive once (some servers repeat them); arguments are
    /// appended in arrival order.
    pub fn push(&mut self, fragment: ToolCallFragment) {
        let call = self.calls.entry(fragment.index).or_default();

        if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
            call.id.get_or_insert(id);
        }
        if let Some(function) = fragment.function {
            if let Some(name) = function.name.filter(|name| !name.is_empty()) {
                call.name.get_or_insert(name);
            }
            if let Some(arguments) = function.arguments {
                call.arguments.push_str(&arguments);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Drain every call as one event, in index order
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Streaming`] if any call lacks an id or name or
    /// its arguments are not valid JSON
    pub fn flush(&mut self) -> Result<Option<StreamEvent>, LlmError> {
        if self.calls.is_empty() {
            return Ok(None);
        }

        let calls = std::mem::take(&mut self.calls);
        if let Some((index, call)) = calls.iter().find(|(_, call)| !call.is_complete()) {
            tracing::warn!(
                index,
                has_id = call.id.is_some(),
                has_name = call.name.is_some(),
                "incomplete tool call at end of turn"
            );
            return Err(LlmError::Streaming(format!("malformed response: incomplete tool call at index {index}")));
        }

        let raw = calls
            .into_values()
            .map(|call| RawCall {
                id: call.id,
                name: call.name.unwrap_or_default(),
                args: RawArgs::Encoded(call.arguments),
            })
            .collect();

        Ok(Some(StreamEvent::FunctionCalls(tools::from_provider_calls(ToolProtocol::OpenAi, raw))))
    }
}

/// Stateful decoder for the chunk sequence of one response
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    tool_calls: ToolCallAccumulator,
    usage: Option<WireUsage>,
}

impl ChunkDecoder {
    /// Events carried by one chunk
    ///
    /// Tool calls are held back until the choice reports a finish reason.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Upstream`] for an inline error object and
    /// [`LlmError::Streaming`] for incomplete tool calls
    pub fn decode(&mut self, chunk: StreamChunk) -> Result<Vec<StreamEvent>, LlmError> {
        if let Some(error) = chunk.error {
            let status = error
                .get("code")
                .and_then(Value::as_u64)
                .and_then(|code| u16::try_from(code).ok())
                .unwrap_or(500);
            return Err(LlmError::Upstream {
                status,
                body: json!({ "error": error }).to_string(),
            });
        }

        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        let mut events = Vec::new();
        for choice in chunk.choices.into_iter().take(1) {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                events.push(StreamEvent::Text(content));
            }
            for fragment in choice.delta.tool_calls {
                self.tool_calls.push(fragment);
            }
            if choice.finish_reason.is_some() {
                events.extend(self.tool_calls.flush()?);
            }
        }

        Ok(events)
    }

    pub const fn has_usage(&self) -> bool {
        self.usage.is_some()
    }

    /// Flush calls left open at `[DONE]` and report usage if the server sent it
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Streaming`] for incomplete tool calls
    pub fn finish(mut self) -> Result<Vec<StreamEvent>, LlmError> {
        let mut events: Vec<StreamEvent> = self.tool_calls.flush()?.into_iter().collect();
        if let Some(usage) = self.usage {
            events.push(StreamEvent::Usage(Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            }));
        }
        Ok(events)
    }
}

/// Local usage estimate for servers that do not report it
pub fn estimate_usage(messages: &[ChatMessage], completion: &str) -> Usage {
    let prompt: String = messages
        .iter()
        .flat_map(|message| {
            message
                .content
                .iter()
                .map(String::as_str)
                .chain(message.tool_calls.iter().map(|call| call.function.arguments.as_str()))
        })
        .collect::<Vec<_>>()
        .join("\n");

    Usage {
        prompt_tokens: estimate_tokens(&prompt),
        completion_tokens: estimate_tokens(completion),
    }
}

/// Estimate token count using tiktoken
fn estimate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let count = o200k_base().map_or_else(|_| text.len() / 4, |bpe| bpe.encode_with_special_tokens(text).len());
    u32::try_from(count).unwrap_or(u32::MAX)
}
