//! Error types shared across the crate

use std::time::Duration;

use thiserror::Error;

/// Loop-level failures. Each one terminates an agent invocation.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent '{agent}': {reason}")]
    Config { agent: String, reason: String },

    #[error("agent '{agent}': unknown model provider '{provider}'")]
    UnknownProvider { agent: String, provider: String },

    #[error("model call failed: {0:#}")]
    Provider(anyhow::Error),

    #[error("agent execution cancelled")]
    Cancelled,

    #[error("max iterations ({limit}) exceeded")]
    MaxIterationsExceeded { limit: usize },

    #[error("external agent failed: {0}")]
    ExternalAgent(#[from] AcpError),
}

impl AgentError {
    pub fn config(agent: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            agent: agent.into(),
            reason: reason.into(),
        }
    }
}

/// Per-call tool failures. These never abort the loop.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool '{0}' not found")]
    NotFound(String),

    #[error("missing required argument '{param}' for tool '{tool}'")]
    MissingArgument { param: String, tool: String },

    #[error("{0}")]
    Execution(String),

    #[error("tool '{tool}' timed out after {}s", .timeout.as_secs())]
    Timeout { tool: String, timeout: Duration },

    #[error("schema unavailable for tool '{tool}': {reason}")]
    Schema { tool: String, reason: String },
}

impl From<anyhow::Error> for ToolError {
    fn from(err: anyhow::Error) -> Self {
        ToolError::Execution(format!("{:#}", err))
    }
}

/// External agent (ACP) client and session failures
#[derive(Debug, Error)]
pub enum AcpError {
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("{operation} timed out after {}s", .timeout.as_secs())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("agent returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("connection to external agent closed")]
    ConnectionClosed,

    #[error("session {0} is closed")]
    SessionClosed(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for AcpError {
    fn from(err: serde_json::Error) -> Self {
        AcpError::Protocol(err.to_string())
    }
}
