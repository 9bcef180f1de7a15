//! Lifecycle events and the tool override protocol
//!
//! Every event has a stable name and a JSON payload. Payload field names are
//! part of the contract with script-level listeners and must not change.

use serde_json::{json, Value};

use super::result::TurnResult;
use crate::ai::types::{ToolCall, ToolCallUpdate, Usage};

pub const EVENT_START: &str = "agent.start";
pub const EVENT_END: &str = "agent.end";
pub const EVENT_ITERATION_START: &str = "agent.iteration.start";
pub const EVENT_ITERATION_END: &str = "agent.iteration.end";
pub const EVENT_CHUNK: &str = "agent.chunk";
pub const EVENT_TOOL_START: &str = "agent.tool.start";
pub const EVENT_TOOL_END: &str = "agent.tool.end";

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    // ── Invocation ─────────────────────────────────────────────────────
    /// Invocation began; `message` is the latest user message.
    Start { message: String },

    /// Invocation finished. Fired exactly once per invocation.
    End { result: TurnResult },

    // ── Iterations ─────────────────────────────────────────────────────
    IterationStart { iteration: usize },

    /// `usage` is what this iteration's model call reported, if anything.
    IterationEnd {
        iteration: usize,
        usage: Option<Usage>,
    },

    // ── Streaming ──────────────────────────────────────────────────────
    Chunk { content: String },

    // ── Tools (interceptable) ──────────────────────────────────────────
    ToolStart { call: ToolCall },

    ToolEnd { update: ToolCallUpdate },
}

impl AgentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::Start { .. } => EVENT_START,
            AgentEvent::End { .. } => EVENT_END,
            AgentEvent::IterationStart { .. } => EVENT_ITERATION_START,
            AgentEvent::IterationEnd { .. } => EVENT_ITERATION_END,
            AgentEvent::Chunk { .. } => EVENT_CHUNK,
            AgentEvent::ToolStart { .. } => EVENT_TOOL_START,
            AgentEvent::ToolEnd { .. } => EVENT_TOOL_END,
        }
    }

    /// Whether a listener's return value is inspected for an override
    pub fn is_interceptable(&self) -> bool {
        matches!(self, AgentEvent::ToolStart { .. } | AgentEvent::ToolEnd { .. })
    }

    pub fn payload(&self) -> Value {
        match self {
            AgentEvent::Start { message } => json!({ "message": message }),
            AgentEvent::End { result } => json!({
                "result": {
                    "stopReason": result.stop_reason.as_str(),
                    "durationMs": result.duration.as_millis() as u64,
                    "totalInputTokens": result.usage.prompt_tokens,
                    "totalOutputTokens": result.usage.completion_tokens,
                    "error": result.error,
                }
            }),
            AgentEvent::IterationStart { iteration } => json!({ "iteration": iteration }),
            AgentEvent::IterationEnd { iteration, usage } => {
                let mut payload = json!({ "iteration": iteration });
                if let Some(usage) = usage {
                    payload["usage"] = json!({
                        "inputTokens": usage.prompt_tokens,
                        "outputTokens": usage.completion_tokens,
                        "cachedTokens": usage.cached_tokens,
                    });
                }
                payload
            }
            AgentEvent::Chunk { content } => json!({ "content": content }),
            AgentEvent::ToolStart { call } => json!({
                "toolCall": {
                    "id": call.id,
                    "name": call.name,
                    "args": call.arguments,
                }
            }),
            AgentEvent::ToolEnd { update } => json!({
                "toolCall": {
                    "id": update.id,
                    "name": update.name,
                    "args": update.arguments,
                    "durationMs": update.duration.map(|d| d.as_millis() as u64),
                    "output": update.output,
                    "error": update.error,
                }
            }),
        }
    }
}

/// Replacement tool outcome returned by a tool-start or tool-end listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOverride {
    pub result: String,
    pub error: Option<String>,
}

impl ToolOverride {
    /// An override is an object with a string `result`; anything else is ignored.
    /// A string `error` alongside it marks the outcome as a failure.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let result = object.get("result")?.as_str()?;
        let error = object
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Self {
            result: result.to_string(),
            error,
        })
    }

    pub fn into_outcome(self) -> Result<String, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result),
        }
    }
}
