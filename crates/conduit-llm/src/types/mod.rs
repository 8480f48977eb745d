//! Provider-agnostic conversation, tool and event types

mod message;
mod params;
mod stream;
mod tool;

pub use message::{ConversationTurn, FunctionCall, FunctionResponse, Part, Role};
pub use params::ModelParams;
pub use stream::{StreamEvent, Usage};
pub use tool::{Schema, ToolDeclaration};
