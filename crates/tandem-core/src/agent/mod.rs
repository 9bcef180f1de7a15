//! Agent loop, lifecycle events, and the override protocol
//!
//! - `orchestrator` - `AgentLoop::execute`, the loop controller
//! - `bus` - caller callbacks and event fan-out
//! - `events` - event names, payloads, tool overrides
//! - `external` - turn delegation to an external agent

pub mod bus;
pub mod config;
pub mod events;
mod external;
pub mod orchestrator;
pub mod result;

pub use bus::{AgentCallbacks, EventBus, NoopCallbacks};
pub use config::{AgentConfig, ExternalAgentConfig, ModelConfig, ToolServerSpec};
pub use events::{AgentEvent, ToolOverride};
pub use orchestrator::AgentLoop;
pub use result::{AgentFailure, AgentRun, StopReason, TurnResult};
