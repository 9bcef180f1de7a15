//! ACP wire types (JSON-RPC 2.0 over newline-delimited stdio)
//!
//! Only the client side of the protocol is modelled: the requests we send
//! to an external agent and the notifications and requests it sends back.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::config::ToolServerSpec;
use crate::ai::types::{ToolArgs, ToolCallStatus};

/// ACP protocol version spoken by this client
pub const PROTOCOL_VERSION: u16 = 1;

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_SESSION_NEW: &str = "session/new";
pub const METHOD_SESSION_PROMPT: &str = "session/prompt";
pub const METHOD_SESSION_CANCEL: &str = "session/cancel";
pub const METHOD_SESSION_UPDATE: &str = "session/update";
pub const METHOD_REQUEST_PERMISSION: &str = "session/request_permission";

/// JSON-RPC "method not found"
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Outgoing JSON-RPC request
#[derive(Debug, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: i64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// Outgoing JSON-RPC notification
#[derive(Debug, Serialize)]
pub struct RpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Outgoing reply to a request the agent made
#[derive(Debug, Serialize)]
pub struct RpcReply {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

impl RpcReply {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcErrorBody {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

/// Any message read from the agent: response, notification, or request
#[derive(Debug, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: u16,
    pub client_capabilities: ClientCapabilities,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    pub fs: FileSystemCapability,
    pub terminal: bool,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemCapability {
    pub read_text_file: bool,
    pub write_text_file: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: u16,
    #[serde(default)]
    pub agent_capabilities: Value,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct EnvVariable {
    pub name: String,
    pub value: String,
}

/// Tool server entry in `session/new`
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct McpServerParam {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<EnvVariable>,
}

impl From<&ToolServerSpec> for McpServerParam {
    fn from(spec: &ToolServerSpec) -> Self {
        let mut env: Vec<EnvVariable> = spec
            .env
            .iter()
            .map(|(name, value)| EnvVariable {
                name: name.clone(),
                value: value.clone(),
            })
            .collect();
        env.sort_by(|a, b| a.name.cmp(&b.name));

        Self {
            name: spec.name.clone(),
            command: spec.command.clone(),
            args: spec.args.clone(),
            env,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionParams {
    pub cwd: PathBuf,
    pub mcp_servers: Vec<McpServerParam>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResult {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Unsupported,
}

impl ContentBlock {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Unsupported => None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptParams {
    pub session_id: String,
    pub prompt: Vec<ContentBlock>,
}

/// Why the agent ended its turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AcpStopReason {
    EndTurn,
    MaxTokens,
    MaxTurnRequests,
    Refusal,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WireUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cached_read_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResult {
    pub stop_reason: AcpStopReason,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelParams {
    pub session_id: String,
}

/// `session/update` notification params
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNotification {
    pub session_id: String,
    pub update: WireSessionUpdate,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WireToolStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl From<WireToolStatus> for ToolCallStatus {
    fn from(status: WireToolStatus) -> Self {
        match status {
            WireToolStatus::Pending | WireToolStatus::InProgress => ToolCallStatus::Pending,
            WireToolStatus::Completed => ToolCallStatus::Completed,
            WireToolStatus::Failed => ToolCallStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolCallContent {
    Content {
        content: ContentBlock,
    },
    Diff {
        path: String,
    },
    #[serde(other)]
    Unsupported,
}

/// Session update variants this client acts on
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum WireSessionUpdate {
    AgentMessageChunk {
        content: ContentBlock,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        status: Option<WireToolStatus>,
        #[serde(default)]
        raw_input: Option<Value>,
        #[serde(default)]
        content: Option<Vec<ToolCallContent>>,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallUpdate {
        tool_call_id: String,
        #[serde(default)]
        status: Option<WireToolStatus>,
        #[serde(default)]
        content: Option<Vec<ToolCallContent>>,
    },
    #[serde(other)]
    Ignored,
}

/// Join the textual parts of tool call content
pub fn tool_content_text(content: &[ToolCallContent]) -> String {
    content
        .iter()
        .filter_map(|c| match c {
            ToolCallContent::Content { content } => content.as_text().map(str::to_string),
            ToolCallContent::Diff { path } => Some(format!("[diff: {}]", path)),
            ToolCallContent::Unsupported => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Arguments from a tool call's raw input; non-object input is wrapped as `input`
pub fn raw_input_args(raw_input: Option<Value>) -> ToolArgs {
    match raw_input {
        Some(Value::Object(map)) => map,
        Some(Value::Null) | None => ToolArgs::new(),
        Some(other) => {
            let mut map = ToolArgs::new();
            map.insert("input".to_string(), other);
            map
        }
    }
}

/// `session/request_permission` params (fields we read)
#[derive(Debug, Deserialize)]
pub struct PermissionRequest {
    #[serde(default)]
    pub options: Vec<PermissionOption>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    pub option_id: String,
    #[serde(default)]
    pub kind: Option<String>,
}

/// Pick the first offered option, or cancel when none are offered
pub fn auto_permission_outcome(request: &PermissionRequest) -> Value {
    match request.options.first() {
        Some(option) => serde_json::json!({
            "outcome": { "outcome": "selected", "optionId": option.option_id }
        }),
        None => serde_json::json!({ "outcome": { "outcome": "cancelled" } }),
    }
}

/// Environment map rendered for logs with credentials masked
pub fn masked_env(env: &HashMap<String, String>) -> Vec<String> {
    let mut entries: Vec<String> = env
        .iter()
        .map(|(k, v)| {
            let upper = k.to_ascii_uppercase();
            if upper.contains("KEY") || upper.contains("TOKEN") || upper.contains("SECRET") {
                let head: String = v.chars().take(4).collect();
                format!("{}={}...", k, head)
            } else {
                format!("{}={}", k, v)
            }
        })
        .collect();
    entries.sort();
    entries
}
