//! Agent and model configuration

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AgentError;
use crate::tools::AgentTool;

/// Iteration cap applied when none (or a non-positive one) is configured
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// Default bound on the external agent's initialize handshake
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Provider binding plus provider-specific request fields.
///
/// Agents hold it behind an `Arc`, so several agents may share one model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// Name of the registered provider that serves this model
    pub provider: String,
    /// Provider-side model identifier
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Use the streaming path when calling this model
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Merged verbatim into the request body
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra_body: Map<String, Value>,
}

impl ModelConfig {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            ..Default::default()
        }
    }
}

/// A remote tool server handed to an external agent session
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolServerSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// How to launch an external agent that runs whole turns itself
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalAgentConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,
    #[serde(default)]
    pub tool_servers: Vec<ToolServerSpec>,
}

fn default_init_timeout_secs() -> u64 {
    DEFAULT_INIT_TIMEOUT.as_secs()
}

impl ExternalAgentConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            init_timeout_secs: default_init_timeout_secs(),
            tool_servers: Vec::new(),
        }
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }
}

/// Everything the loop needs to run one agent
#[derive(Clone, Default)]
pub struct AgentConfig {
    pub name: String,
    pub model: Option<Arc<ModelConfig>>,
    pub system_prompt: Option<String>,
    /// Searched in order when resolving a tool call
    pub tools: Vec<AgentTool>,
    pub max_iterations: Option<i64>,
    pub metadata: Map<String, Value>,
    /// When set, turns are delegated to this external agent process
    pub external: Option<ExternalAgentConfig>,
    /// Fields the loop does not interpret
    pub extensions: Map<String, Value>,
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("system_prompt", &self.system_prompt)
            .field(
                "tools",
                &self.tools.iter().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .field("max_iterations", &self.max_iterations)
            .field("external", &self.external)
            .finish()
    }
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, model: Arc<ModelConfig>) -> Self {
        Self {
            name: name.into(),
            model: Some(model),
            ..Default::default()
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tool(mut self, tool: AgentTool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: i64) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_external(mut self, external: ExternalAgentConfig) -> Self {
        self.external = Some(external);
        self
    }

    /// The model reference, or a configuration error naming this agent
    pub fn require_model(&self) -> Result<&Arc<ModelConfig>, AgentError> {
        self.model
            .as_ref()
            .ok_or_else(|| AgentError::config(&self.name, "model is required"))
    }

    /// Configured cap, falling back to the default for missing or non-positive values
    pub fn effective_max_iterations(&self) -> usize {
        match self.max_iterations {
            Some(n) if n > 0 => n as usize,
            _ => DEFAULT_MAX_ITERATIONS,
        }
    }

    /// System prompt when configured and non-empty
    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref().filter(|p| !p.is_empty())
    }
}
