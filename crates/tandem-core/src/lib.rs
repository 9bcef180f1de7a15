//! Tandem core library
//!
//! Drives multi-turn conversations between a model backend and a set of
//! callable tools, optionally delegating whole turns to an external agent
//! process over ACP.
//!
//! ## Modules
//! - `agent` - Agentic loop, lifecycle events, override protocol
//! - `ai` - Conversation types and model provider adapters
//! - `tools` - Tool variants and dispatch
//! - `acp` - External agent clients, sessions, and their registry
//! - `config` - TOML agent/model catalogs

pub mod acp;
pub mod agent;
pub mod ai;
pub mod config;
pub mod error;
pub mod tools;

pub use agent::{AgentCallbacks, AgentConfig, AgentLoop, AgentRun, ModelConfig, StopReason};
pub use ai::types::{Message, Role, ToolCall};
pub use error::{AcpError, AgentError, ToolError};
pub use tools::AgentTool;
