//! Tool dispatch for an agent's configured tools
//!
//! Lookup walks the agent's tool list in order; the first name match wins
//! regardless of variant.

use std::time::{Duration, Instant};

use crate::ai::types::{AiTool, ToolCall};
use crate::error::ToolError;

use super::kind::{tool_kind, ToolKind};
use super::native::NativeTool;
use super::remote::RemoteTool;
use super::script::ScriptTool;

/// Default tool execution timeout (2 minutes)
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// One of the three tool backends
#[derive(Clone)]
pub enum AgentTool {
    Script(ScriptTool),
    Remote(RemoteTool),
    Native(NativeTool),
}

impl AgentTool {
    pub fn name(&self) -> &str {
        match self {
            AgentTool::Script(t) => t.name(),
            AgentTool::Remote(t) => t.name(),
            AgentTool::Native(t) => t.name(),
        }
    }

    pub fn kind(&self) -> ToolKind {
        tool_kind(self.name())
    }

    /// Provider-agnostic advertisement for this tool
    pub async fn advertise(&self) -> Result<AiTool, ToolError> {
        match self {
            AgentTool::Script(t) => Ok(t.advertise()),
            AgentTool::Remote(t) => t.advertise().await,
            AgentTool::Native(t) => Ok(t.advertise()),
        }
    }

    pub async fn execute(&self, call: &ToolCall) -> Result<String, ToolError> {
        match self {
            AgentTool::Script(t) => t.execute(&call.arguments).await,
            AgentTool::Remote(t) => t.execute(&call.arguments).await,
            AgentTool::Native(t) => t.execute(&call.arguments).await,
        }
    }
}

impl From<ScriptTool> for AgentTool {
    fn from(tool: ScriptTool) -> Self {
        AgentTool::Script(tool)
    }
}

impl From<RemoteTool> for AgentTool {
    fn from(tool: RemoteTool) -> Self {
        AgentTool::Remote(tool)
    }
}

impl From<NativeTool> for AgentTool {
    fn from(tool: NativeTool) -> Self {
        AgentTool::Native(tool)
    }
}

/// Resolves and runs tool calls against one agent's tool list
pub struct ToolDispatcher<'a> {
    tools: &'a [AgentTool],
    timeout: Duration,
}

impl<'a> ToolDispatcher<'a> {
    pub fn new(tools: &'a [AgentTool]) -> Self {
        Self {
            tools,
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn find(&self, name: &str) -> Option<&'a AgentTool> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Advertise every tool; remote tools whose schema cannot be fetched are left out
    pub async fn advertisements(&self) -> Vec<AiTool> {
        let mut ads = Vec::with_capacity(self.tools.len());
        for tool in self.tools {
            match tool.advertise().await {
                Ok(ad) => ads.push(ad),
                Err(e) => {
                    tracing::warn!(tool = tool.name(), error = %e, "Skipping tool advertisement");
                }
            }
        }
        ads
    }

    /// Execute a tool call with timeout
    pub async fn execute(&self, call: &ToolCall) -> Result<String, ToolError> {
        let tool = self
            .find(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;

        let start = Instant::now();
        let result = match tokio::time::timeout(self.timeout, tool.execute(call)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    tool = %call.name,
                    timeout_secs = self.timeout.as_secs(),
                    "Tool execution timed out"
                );
                Err(ToolError::Timeout {
                    tool: call.name.clone(),
                    timeout: self.timeout,
                })
            }
        };

        tracing::debug!(
            tool = %call.name,
            id = %call.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Tool executed"
        );
        result
    }
}
