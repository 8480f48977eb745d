//! Neutral conversation to Google `generateContent` shape, and stream chunks
//! back to events

use conduit_config::ToolCallMode;
use serde_json::{Value, json};

use crate::error::LlmError;
use crate::protocol::google::{
    Content, ContentPart, FunctionCall, FunctionCallingConfig, FunctionDeclaration, FunctionResponse,
    GenerateRequest, GenerateResponse, GenerationConfig, SafetySetting, Tool, ToolConfig, UsageMetadata,
};
use crate::provider::ProviderRequest;
use crate::tools::{self, ProviderTools, RawArgs, RawCall, ToolProtocol};
use crate::types::{ConversationTurn, ModelParams, Part, Role, StreamEvent, ToolDeclaration, Usage};

/// Build the request body
///
/// The system prompt travels in `systemInstruction`, never in `contents`.
pub fn build_request(
    request: &ProviderRequest,
    safety_settings: &[SafetySetting],
    tool_call_mode: ToolCallMode,
) -> GenerateRequest {
    let tools = match &request.tools {
        ProviderTools::Google(declarations) if !declarations.is_empty() => vec![Tool {
            function_declarations: declarations.iter().map(declaration).collect(),
        }],
        ProviderTools::OpenAi(_) => {
            tracing::debug!("ignoring tools prepared for a different protocol");
            Vec::new()
        }
        _ => Vec::new(),
    };

    let tool_config = (!tools.is_empty()).then(|| ToolConfig {
        function_calling_config: FunctionCallingConfig {
            mode: match tool_call_mode {
                ToolCallMode::Auto => "AUTO",
                ToolCallMode::Any => "ANY",
                ToolCallMode::None => "NONE",
            },
        },
    });

    GenerateRequest {
        contents: history_to_contents(request.conversation()),
        system_instruction: request.system_prompt().map(|text| Content {
            role: None,
            parts: vec![ContentPart::text(text)],
        }),
        generation_config: generation_config(request.params),
        tools,
        tool_config,
        safety_settings: safety_settings.to_vec(),
    }
}

fn generation_config(params: ModelParams) -> Option<GenerationConfig> {
    (params != ModelParams::default()).then_some(GenerationConfig {
        temperature: params.temperature,
        top_p: params.top_p,
        max_output_tokens: params.max_tokens,
    })
}

fn declaration(tool: &ToolDeclaration) -> FunctionDeclaration {
    let empty = tool.parameters.schema_type.is_none() && tool.parameters.properties.is_empty();

    FunctionDeclaration {
        name: tool.name.clone(),
        description: tool.description.clone(),
        parameters: (!empty)
            .then(|| serde_json::to_value(&tool.parameters).ok())
            .flatten(),
    }
}

/// Map turns to `contents`
///
/// A user turn is split: its function responses become a standalone
/// `function` message placed before the remaining user text.
pub fn history_to_contents<'a>(turns: impl Iterator<Item = &'a ConversationTurn>) -> Vec<Content> {
    let mut contents = Vec::new();

    for turn in turns {
        match turn.role {
            Role::User => {
                let responses: Vec<ContentPart> = turn
                    .function_responses()
                    .map(|response| ContentPart {
                        function_response: Some(FunctionResponse {
                            id: Some(response.id.clone()),
                            name: response.name.clone(),
                            response: as_object(&response.response),
                        }),
                        ..ContentPart::default()
                    })
                    .collect();
                if !responses.is_empty() {
                    contents.push(Content {
                        role: Some("function".to_owned()),
                        parts: responses,
                    });
                }

                let texts = text_parts(turn);
                if !texts.is_empty() {
                    contents.push(Content {
                        role: Some("user".to_owned()),
                        parts: texts,
                    });
                }
            }
            Role::Model => {
                let parts: Vec<ContentPart> = turn
                    .parts
                    .iter()
                    .filter_map(|part| match part {
                        Part::Text(text) if !text.is_empty() => Some(ContentPart::text(text.clone())),
                        Part::FunctionCall(call) => Some(ContentPart {
                            function_call: Some(FunctionCall {
                                id: Some(call.id.clone()),
                                name: call.name.clone(),
                                args: call.args.clone(),
                            }),
                            ..ContentPart::default()
                        }),
                        _ => None,
                    })
                    .collect();
                if !parts.is_empty() {
                    contents.push(Content {
                        role: Some("model".to_owned()),
                        parts,
                    });
                }
            }
            Role::System => {}
        }
    }

    contents
}

fn text_parts(turn: &ConversationTurn) -> Vec<ContentPart> {
    turn.parts
        .iter()
        .filter_map(|part| match part {
            Part::Text(text) if !text.is_empty() => Some(ContentPart::text(text.clone())),
            _ => None,
        })
        .collect()
}

/// Google only accepts objects as function responses
fn as_object(value: &Value) -> Value {
    match value {
        Value::Object(_) => value.clone(),
        other => json!({ "content": other }),
    }
}

/// Stateful decoder for the chunk sequence of one response
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    usage: Option<UsageMetadata>,
}

impl ChunkDecoder {
    /// Events carried by one chunk, in part order
    ///
    /// Function calls within a chunk are grouped into a single event placed
    /// after the chunk's text.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Upstream`] when the chunk reports an error
    pub fn decode(&mut self, chunk: GenerateResponse) -> Result<Vec<StreamEvent>, LlmError> {
        if let Some(error) = chunk.error {
            let status = error
                .get("code")
                .and_then(Value::as_u64)
                .and_then(|c| u16::try_from(c).ok())
                .unwrap_or(500);
            return Err(LlmError::Upstream {
                status,
                body: json!({ "error": error }).to_string(),
            });
        }

        if chunk.usage_metadata.is_some() {
            self.usage = chunk.usage_metadata;
        }

        let mut events = Vec::new();
        let mut calls = Vec::new();

        let parts = chunk
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| {
                if candidate.content.is_none() {
                    tracing::debug!(finish_reason = ?candidate.finish_reason, "candidate without content");
                }
                candidate.content
            })
            .map(|content| content.parts)
            .unwrap_or_default();

        for part in parts {
            if part.thought == Some(true) {
                continue;
            }
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                events.push(StreamEvent::Text(text));
            }
            if let Some(call) = part.function_call {
                calls.push(RawCall {
                    id: call.id,
                    name: call.name,
                    args: RawArgs::Structured(call.args),
                });
            }
        }

        if !calls.is_empty() {
            events.push(StreamEvent::FunctionCalls(tools::from_provider_calls(ToolProtocol::Google, calls)));
        }

        Ok(events)
    }

    /// Usage event from the last metadata seen, if any
    pub fn finish(self) -> Option<StreamEvent> {
        self.usage.map(|usage| {
            StreamEvent::Usage(Usage {
                prompt_tokens: usage.prompt_token_count,
                completion_tokens: usage.candidates_token_count,
            })
        })
    }
}

impl From<(&String, &String)> for SafetySetting {
    fn from((category, threshold): (&String, &String)) -> Self {
        Self {
            category: category.clone(),
            threshold: threshold.clone(),
        }
    }
}
