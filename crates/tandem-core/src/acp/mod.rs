//! External agents over the Agent Client Protocol
//!
//! - `registry` - one client per agent name, with session tracking
//! - `client` - JSON-RPC client and receive loop
//! - `session` - prompts, streamed updates, history
//! - `resolve` - command lookup before spawning

pub mod client;
pub mod protocol;
pub mod registry;
pub mod resolve;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use client::AcpClient;
pub use protocol::AcpStopReason;
pub use registry::{AgentConnector, ClientRegistry, ClientSpec, StdioConnector};
pub use resolve::{resolve_command, ShellExecutor, ShellOutput, SystemShell};
pub use session::{AcpSession, PromptOutcome, SessionUpdate, UpdateHandler};
pub use transport::{StdioTransport, Transport};
