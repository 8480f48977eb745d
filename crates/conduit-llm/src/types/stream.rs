use serde::{Deserialize, Serialize};

use super::FunctionCall;

/// Normalized event yielded by every driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamEvent {
    /// Content delta
    Text(String),
    /// Complete tool calls, arguments fully decoded
    FunctionCalls(Vec<FunctionCall>),
    /// Token accounting, emitted at most once at the end of a stream
    Usage(Usage),
}

/// Token usage for one request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub const fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn events_serialize_with_camel_case_tags() {
        assert_eq!(
            serde_json::to_value(StreamEvent::Text("he".to_owned())).unwrap(),
            json!({"text": "he"})
        );
        assert_eq!(
            serde_json::to_value(StreamEvent::Usage(Usage {
                prompt_tokens: 3,
                completion_tokens: 5
            }))
            .unwrap(),
            json!({"usage": {"promptTokens": 3, "completionTokens": 5}})
        );
        assert_eq!(
            serde_json::to_value(StreamEvent::FunctionCalls(vec![])).unwrap(),
            json!({"functionCalls": []})
        );
    }
}
