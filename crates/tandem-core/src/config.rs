//! Agent catalog loading
//!
//! Parses a TOML file of named models and agents:
//!
//! ```toml
//! [models.fast]
//! provider = "openai"
//! model = "gpt-4o-mini"
//! api_key_env = "OPENAI_API_KEY"
//!
//! [agents.forecaster]
//! model = "fast"
//! system_prompt = "Answer weather questions."
//! tools = ["weather"]
//!
//! [agents.coder.external]
//! command = "claude-code-acp"
//! ```
//!
//! Tools are code, not config: names in `tools` resolve against a catalog of
//! `AgentTool`s supplied by the caller.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::agent::config::{AgentConfig, ExternalAgentConfig, ModelConfig};
use crate::error::AgentError;
use crate::tools::AgentTool;

/// Raw catalog file
#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    models: HashMap<String, ModelEntry>,
    #[serde(default)]
    agents: HashMap<String, AgentEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    #[serde(flatten)]
    config: ModelConfig,
    /// Environment variable holding the credential
    #[serde(default)]
    api_key_env: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgentEntry {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    system_prompt: Option<String>,
    /// Kept loose so a non-array value can be reported by agent name
    #[serde(default)]
    tools: Option<Value>,
    #[serde(default)]
    max_iterations: Option<i64>,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default)]
    external: Option<ExternalAgentConfig>,
    #[serde(flatten)]
    extensions: Map<String, Value>,
}

/// Resolved models and agents
#[derive(Debug, Default)]
pub struct AgentCatalog {
    models: HashMap<String, Arc<ModelConfig>>,
    agents: BTreeMap<String, AgentConfig>,
}

impl AgentCatalog {
    /// Load and resolve a catalog file
    pub async fn load(path: &Path, tools: &[AgentTool]) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&text, tools).with_context(|| format!("invalid catalog {}", path.display()))
    }

    pub fn parse(text: &str, tools: &[AgentTool]) -> Result<Self> {
        let file: CatalogFile = toml::from_str(text).context("failed to parse TOML")?;

        let models: HashMap<String, Arc<ModelConfig>> = file
            .models
            .into_iter()
            .map(|(id, entry)| (id.clone(), Arc::new(resolve_model(&id, entry))))
            .collect();

        let mut agents = BTreeMap::new();
        for (name, entry) in file.agents {
            let agent = resolve_agent(&name, entry, &models, tools)?;
            agents.insert(name, agent);
        }

        debug!(models = models.len(), agents = agents.len(), "Loaded agent catalog");
        Ok(Self { models, agents })
    }

    pub fn agent(&self, name: &str) -> Option<&AgentConfig> {
        self.agents.get(name)
    }

    pub fn agent_names(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    pub fn model(&self, id: &str) -> Option<&Arc<ModelConfig>> {
        self.models.get(id)
    }
}

fn resolve_model(id: &str, entry: ModelEntry) -> ModelConfig {
    let mut config = entry.config;
    if config.api_key.is_none() {
        if let Some(var) = entry.api_key_env {
            match std::env::var(&var) {
                Ok(key) => config.api_key = Some(key),
                Err(_) => warn!(model = id, var = %var, "API key environment variable not set"),
            }
        }
    }
    config
}

fn resolve_agent(
    name: &str,
    entry: AgentEntry,
    models: &HashMap<String, Arc<ModelConfig>>,
    catalog: &[AgentTool],
) -> Result<AgentConfig, AgentError> {
    // External agents bring their own model
    let model = match (&entry.model, &entry.external) {
        (Some(id), _) => Some(
            models
                .get(id)
                .cloned()
                .ok_or_else(|| AgentError::config(name, format!("unknown model '{}'", id)))?,
        ),
        (None, Some(_)) => None,
        (None, None) => return Err(AgentError::config(name, "model is required")),
    };

    let tool_names: Vec<String> = match entry.tools {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(AgentError::config(
                    name,
                    format!("tool names must be strings, got {}", other),
                )),
            })
            .collect::<Result<_, _>>()?,
        Some(_) => return Err(AgentError::config(name, "tools must be an array")),
    };

    let tools = tool_names
        .iter()
        .map(|tool_name| {
            catalog
                .iter()
                .find(|t| t.name() == tool_name)
                .cloned()
                .ok_or_else(|| AgentError::config(name, format!("unknown tool '{}'", tool_name)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AgentConfig {
        name: name.to_string(),
        model,
        system_prompt: entry.system_prompt,
        tools,
        max_iterations: entry.max_iterations,
        metadata: entry.metadata,
        external: entry.external,
        extensions: entry.extensions,
    })
}
