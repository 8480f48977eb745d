use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role of a conversation participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instruction
    System,
    /// User input, including tool results
    User,
    /// Model output, including tool calls
    Model,
}

/// One turn of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Author of the turn
    pub role: Role,
    /// Ordered content parts
    pub parts: Vec<Part>,
}

impl ConversationTurn {
    /// Turn with a single text part
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![Part::Text(text.into())],
        }
    }

    /// System turn carrying `text`
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    /// User turn carrying `text`
    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    /// Model turn carrying `text`
    pub fn model(text: impl Into<String>) -> Self {
        Self::text(Role::Model, text)
    }

    /// Concatenation of all text parts
    pub fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Function calls declared by this turn, in order
    pub fn function_calls(&self) -> impl Iterator<Item = &FunctionCall> {
        self.parts.iter().filter_map(|part| match part {
            Part::FunctionCall(call) => Some(call),
            _ => None,
        })
    }

    /// Function responses carried by this turn, in order
    pub fn function_responses(&self) -> impl Iterator<Item = &FunctionResponse> {
        self.parts.iter().filter_map(|part| match part {
            Part::FunctionResponse(response) => Some(response),
            _ => None,
        })
    }
}

/// Content part within a turn
///
/// Serialized externally tagged: `{"text": …}`, `{"functionCall": {…}}`,
/// `{"functionResponse": {…}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Part {
    /// Plain text
    Text(String),
    /// Tool invocation requested by the model
    FunctionCall(FunctionCall),
    /// Result of a tool invocation, supplied by the caller
    FunctionResponse(FunctionResponse),
}

/// Provider-agnostic tool call
///
/// `args` is always a decoded mapping; `id` stays stable for the lifetime of
/// the request that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Call identifier
    pub id: String,
    /// Tool name
    pub name: String,
    /// Decoded arguments
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// Tool result matching an earlier [`FunctionCall`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    /// Identifier of the call being answered
    pub id: String,
    /// Tool name
    pub name: String,
    /// Arbitrary result payload
    pub response: Value,
}
