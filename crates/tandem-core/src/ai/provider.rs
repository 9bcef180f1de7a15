//! Model provider abstraction
//!
//! Every backend implements synchronous chat completion; streaming is
//! optional and falls back to replaying the synchronous response through the
//! sink. Both paths return the same aggregate `ChatResponse`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::types::{AiTool, FinishReason, Message, ToolCall, Usage};
use crate::agent::config::ModelConfig;

/// One request to a model
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: Arc<ModelConfig>,
    /// Full message list, system prompt first when configured
    pub messages: Vec<Message>,
    pub tools: Vec<AiTool>,
}

/// Aggregate model response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    pub finish_reason: FinishReason,
    pub usage: Option<Usage>,
    pub tool_calls: Vec<ToolCall>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: content.into(),
            finish_reason: FinishReason::ToolCalls,
            usage: None,
            tool_calls,
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Receives incremental output while a streaming call is in flight
#[async_trait]
pub trait StreamSink: Send + Sync {
    async fn on_text(&self, delta: &str);

    /// Tool call name and id are known; arguments may still be streaming.
    async fn on_tool_call_start(&self, id: &str, name: &str);
}

/// A pluggable model backend
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Stable name used for registry lookup
    fn name(&self) -> &str;

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;

    async fn chat_stream(&self, request: ChatRequest, sink: &dyn StreamSink) -> Result<ChatResponse> {
        let response = self.chat(request).await?;
        if !response.content.is_empty() {
            sink.on_text(&response.content).await;
        }
        for call in &response.tool_calls {
            sink.on_tool_call_start(&call.id, &call.name).await;
        }
        Ok(response)
    }
}

/// Providers indexed by name
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name, replacing any previous one
    pub fn register(&mut self, provider: Arc<dyn ModelProvider>) {
        let name = provider.name().to_string();
        tracing::debug!(provider = %name, "Registered model provider");
        self.providers.insert(name, provider);
    }

    pub fn with(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ModelProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}
