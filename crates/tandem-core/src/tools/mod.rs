//! Tool variants and dispatch
//!
//! An agent's tools are a closed set of three backends:
//! - `ScriptTool` - user-defined function from the embedding language
//! - `RemoteTool` - tool hosted by a remote tool server
//! - `NativeTool` - built-in function bound in Rust

pub mod kind;
pub mod native;
pub mod registry;
pub mod remote;
pub mod script;

pub use kind::{tool_kind, ToolKind};
pub use native::NativeTool;
pub use registry::{AgentTool, ToolDispatcher, DEFAULT_TOOL_TIMEOUT};
pub use remote::{RemoteTool, RemoteToolInfo, ToolServerClient};
pub use script::{ScriptFunction, ScriptParam, ScriptTool};

use serde_json::Value;

/// Render a tool's return value for the conversation.
///
/// Strings pass through untouched; anything else is serialized to JSON.
pub(crate) fn stringify_output(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
