//! Tool declaration and tool call translation between the neutral shape and
//! provider wire shapes

use indexmap::IndexMap;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::protocol::openai;
use crate::types::{FunctionCall, Schema, ToolDeclaration};

/// Native tool calling dialect of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ToolProtocol {
    /// Function declarations in the neutral schema shape, structured call args
    Google,
    /// `{"type": "function"}` tools, JSON-text call args streamed in fragments
    #[serde(rename = "openai")]
    #[strum(serialize = "openai")]
    OpenAi,
    /// No tool calling
    None,
}

impl ToolProtocol {
    /// Prefix for synthesized call ids
    pub const fn call_id_prefix(self) -> &'static str {
        match self {
            Self::Google => "gcall",
            Self::OpenAi => "call",
            Self::None => "tool",
        }
    }
}

/// Tool declarations ready for a specific driver
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ProviderTools {
    #[default]
    None,
    Google(Vec<ToolDeclaration>),
    OpenAi(Vec<openai::Tool>),
}

impl ProviderTools {
    pub const fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::Google(tools) => tools.is_empty(),
            Self::OpenAi(tools) => tools.is_empty(),
        }
    }
}

/// Arguments as a provider delivers them
#[derive(Debug, Clone, PartialEq)]
pub enum RawArgs {
    Structured(Map<String, Value>),
    /// JSON text, possibly malformed
    Encoded(String),
}

/// Tool call as a provider delivers it
#[derive(Debug, Clone, PartialEq)]
pub struct RawCall {
    pub id: Option<String>,
    pub name: String,
    pub args: RawArgs,
}

/// Convert neutral declarations for `protocol`
pub fn to_provider_declarations(protocol: ToolProtocol, tools: &[ToolDeclaration]) -> ProviderTools {
    if tools.is_empty() {
        return ProviderTools::None;
    }

    match protocol {
        ToolProtocol::Google => ProviderTools::Google(tools.to_vec()),
        ToolProtocol::OpenAi => ProviderTools::OpenAi(
            tools
                .iter()
                .map(|tool| openai::Tool {
                    tool_type: "function".to_owned(),
                    function: openai::FunctionDefinition {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: openai_parameters(&tool.parameters),
                    },
                })
                .collect(),
        ),
        ToolProtocol::None => ProviderTools::None,
    }
}

/// Schema with every `type` tag lowercased
pub fn openai_parameters(schema: &Schema) -> Value {
    if schema.schema_type.is_none() && schema.properties.is_empty() {
        return serde_json::json!({"type": "object", "properties": {}});
    }

    schema.fold(&mut |node: &Schema, properties: IndexMap<String, Value>, items: Option<Value>| {
        let mut out = node.extra.clone();
        if let Some(schema_type) = &node.schema_type {
            out.insert("type".to_owned(), Value::String(schema_type.to_lowercase()));
        }
        if let Some(description) = &node.description {
            out.insert("description".to_owned(), Value::String(description.clone()));
        }
        if !node.enum_values.is_empty() {
            out.insert("enum".to_owned(), Value::Array(node.enum_values.clone()));
        }
        if !properties.is_empty() {
            out.insert("properties".to_owned(), Value::Object(properties.into_iter().collect()));
        }
        if let Some(items) = items {
            out.insert("items".to_owned(), items);
        }
        if !node.required.is_empty() {
            out.insert(
                "required".to_owned(),
                Value::Array(node.required.iter().cloned().map(Value::String).collect()),
            );
        }
        Value::Object(out)
    })
}

/// Normalize provider calls
///
/// Calls without a usable id get a synthesized one; encoded arguments that
/// fail to parse become an empty mapping.
pub fn from_provider_calls(protocol: ToolProtocol, calls: Vec<RawCall>) -> Vec<FunctionCall> {
    if protocol == ToolProtocol::None {
        return Vec::new();
    }

    calls
        .into_iter()
        .enumerate()
        .map(|(index, call)| FunctionCall {
            id: call
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| synthesize_call_id(protocol.call_id_prefix(), index)),
            args: decode_args(&call.name, call.args),
            name: call.name,
        })
        .collect()
}

/// Express normalized calls the way `protocol` delivers them
pub fn to_provider_calls(protocol: ToolProtocol, calls: &[FunctionCall]) -> Vec<RawCall> {
    let encode = |call: &FunctionCall| match protocol {
        ToolProtocol::OpenAi => RawArgs::Encoded(Value::Object(call.args.clone()).to_string()),
        _ => RawArgs::Structured(call.args.clone()),
    };

    match protocol {
        ToolProtocol::None => Vec::new(),
        _ => calls
            .iter()
            .map(|call| RawCall {
                id: Some(call.id.clone()),
                name: call.name.clone(),
                args: encode(call),
            })
            .collect(),
    }
}

fn decode_args(name: &str, args: RawArgs) -> Map<String, Value> {
    match args {
        RawArgs::Structured(map) => map,
        RawArgs::Encoded(text) if text.trim().is_empty() => Map::new(),
        RawArgs::Encoded(text) => match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                tracing::debug!(tool = name, "tool arguments are not a JSON object, using empty arguments");
                Map::new()
            }
        },
    }
}

/// `<prefix>_<index>_<millis base36>_<8 random alphanumerics>`
pub fn synthesize_call_id(prefix: &str, index: usize) -> String {
    let millis = u64::try_from(jiff::Timestamp::now().as_millisecond()).unwrap_or_default();
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();

    format!("{prefix}_{index}_{}_{suffix}", base36(millis))
}

fn base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if value == 0 {
        return "0".to_owned();
    }

    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[usize::try_from(value % 36).unwrap_or_default()]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
