//! Conversation types and model provider adapters

pub mod mock;
pub mod openai;
pub mod provider;
pub mod types;

pub use provider::{ChatRequest, ChatResponse, ModelProvider, ProviderRegistry, StreamSink};
pub use types::{AiTool, ContentPart, FinishReason, Message, Role, ToolCall, Usage};
