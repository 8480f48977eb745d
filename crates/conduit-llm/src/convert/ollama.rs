//! Neutral conversation to Ollama chat messages, and NDJSON objects back to
//! events

use crate::error::LlmError;
use crate::protocol::ollama::{ChatChunk, ChatRequest, Message, Options};
use crate::provider::ProviderRequest;
use crate::types::{Role, StreamEvent, Usage};

/// Build the request body
///
/// Only text travels; function call and response parts are dropped.
pub fn build_request(model: &str, request: &ProviderRequest) -> ChatRequest {
    let mut messages = Vec::new();

    if let Some(system) = request.system_prompt() {
        messages.push(Message {
            role: "system".to_owned(),
            content: system,
        });
    }

    for turn in request.conversation() {
        let content = turn.joined_text();
        if content.is_empty() {
            continue;
        }
        let role = match turn.role {
            Role::Model => "assistant",
            Role::User | Role::System => "user",
        };
        messages.push(Message {
            role: role.to_owned(),
            content,
        });
    }

    ChatRequest {
        model: model.to_owned(),
        messages,
        stream: true,
        options: Options {
            temperature: request.params.temperature,
            top_p: request.params.top_p,
            num_predict: request.params.max_tokens,
        },
    }
}

/// Events for one line of the body
///
/// # Errors
///
/// Returns [`LlmError::Streaming`] when the line is not a JSON object and
/// [`LlmError::Upstream`] when the server reports an error mid-stream
pub fn decode_line(line: &str) -> Result<Decoded, LlmError> {
    let chunk: ChatChunk = serde_json::from_str(line)
        .map_err(|e| LlmError::Streaming(format!("failed to parse stream line: {e}")))?;

    if let Some(error) = chunk.error {
        return Err(LlmError::Upstream {
            status: 500,
            body: serde_json::json!({ "error": error }).to_string(),
        });
    }

    let text = chunk
        .message
        .map(|message| message.content)
        .filter(|content| !content.is_empty())
        .map(StreamEvent::Text);

    if chunk.done {
        tracing::debug!(done_reason = ?chunk.done_reason, "ollama stream finished");
        let usage = StreamEvent::Usage(Usage {
            prompt_tokens: chunk.prompt_eval_count.unwrap_or_default(),
            completion_tokens: chunk.eval_count.unwrap_or_default(),
        });
        return Ok(Decoded::Done(text.into_iter().chain([usage]).collect()));
    }

    Ok(Decoded::Events(text.into_iter().collect()))
}

/// Outcome of decoding one line
#[derive(Debug, PartialEq)]
pub enum Decoded {
    Events(Vec<StreamEvent>),
    /// Final object; nothing after it is read
    Done(Vec<StreamEvent>),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::{ConversationTurn, FunctionResponse, ModelParams, Part};

    #[test]
    fn request_carries_text_only() {
        let request = ProviderRequest {
            history: vec![
                ConversationTurn::user("hi"),
                ConversationTurn::model("hello"),
                ConversationTurn {
                    role: Role::User,
                    parts: vec![Part::FunctionResponse(FunctionResponse {
                        id: "c1".to_owned(),
                        name: "ls".to_owned(),
                        response: json!({}),
                    })],
                },
            ],
            custom_rules: Some("be brief".to_owned()),
            params: ModelParams {
                max_tokens: Some(64),
                temperature: None,
                top_p: None,
            },
            ..ProviderRequest::default()
        };

        let value = serde_json::to_value(build_request("llama3", &request)).unwrap();
        assert_eq!(
            value,
            json!({
                "model": "llama3",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hi"},
                    {"role": "assistant", "content": "hello"}
                ],
                "stream": true,
                "options": {"num_predict": 64}
            })
        );
    }

    #[test]
    fn options_are_omitted_when_unset() {
        let request = ProviderRequest {
            history: vec![ConversationTurn::user("hi")],
            ..ProviderRequest::default()
        };
        let value = serde_json::to_value(build_request("llama3", &request)).unwrap();
        assert!(value.get("options").is_none());
    }

    #[test]
    fn content_lines_then_done_with_counters() {
        assert_eq!(
            decode_line(r#"{"message":{"role":"assistant","content":"Hel"},"done":false}"#).unwrap(),
            Decoded::Events(vec![StreamEvent::Text("Hel".to_owned())])
        );
        assert_eq!(
            decode_line(r#"{"message":{"role":"assistant","content":""},"done":true,"done_reason":"stop","prompt_eval_count":12,"eval_count":3}"#)
                .unwrap(),
            Decoded::Done(vec![StreamEvent::Usage(Usage {
                prompt_tokens: 12,
                completion_tokens: 3
            })])
        );
    }

    #[test]
    fn garbage_and_error_lines_fail() {
        assert!(matches!(decode_line("not json"), Err(LlmError::Streaming(_))));

        let err = decode_line(r#"{"error":"model 'nope' not found"}"#).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
