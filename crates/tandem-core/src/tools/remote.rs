//! Tools hosted by a remote tool server (MCP-style)
//!
//! Only the server's two-method contract is consumed: schema lookup and call.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use super::stringify_output;
use crate::ai::types::{AiTool, ToolArgs};
use crate::error::ToolError;

/// Self-description of a remote tool
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteToolInfo {
    pub description: String,
    pub input_schema: Value,
}

/// The remote tool server manager
#[async_trait]
pub trait ToolServerClient: Send + Sync {
    async fn get_tool_info(&self, server: &str, tool: &str) -> Result<RemoteToolInfo>;

    async fn call_tool(&self, server: &str, tool: &str, args: ToolArgs) -> Result<Value>;
}

#[derive(Clone)]
pub struct RemoteTool {
    server: String,
    tool: String,
    client: Arc<dyn ToolServerClient>,
}

impl RemoteTool {
    pub fn new(
        server: impl Into<String>,
        tool: impl Into<String>,
        client: Arc<dyn ToolServerClient>,
    ) -> Self {
        Self {
            server: server.into(),
            tool: tool.into(),
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.tool
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Fetch the schema from the server
    pub async fn advertise(&self) -> Result<AiTool, ToolError> {
        let info = self
            .client
            .get_tool_info(&self.server, &self.tool)
            .await
            .map_err(|e| ToolError::Schema {
                tool: self.tool.clone(),
                reason: format!("{:#}", e),
            })?;

        Ok(AiTool {
            name: self.tool.clone(),
            description: info.description,
            input_schema: info.input_schema,
        })
    }

    /// Forward the full argument map verbatim
    pub async fn execute(&self, args: &ToolArgs) -> Result<String, ToolError> {
        tracing::debug!(server = %self.server, tool = %self.tool, "Calling remote tool");
        let value = self
            .client
            .call_tool(&self.server, &self.tool, args.clone())
            .await?;
        Ok(stringify_output(value))
    }
}
