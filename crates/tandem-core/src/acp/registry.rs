//! Registry of external agent clients and their sessions
//!
//! One client per agent name, created on first use and replaced when its
//! process has died. All state sits behind a single `RwLock`: lookups take
//! the read side, creation and removal the write side.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::client::AcpClient;
use super::resolve::{resolve_command, ShellExecutor, SystemShell, DEFAULT_RESOLVE_TIMEOUT};
use super::session::AcpSession;
use super::transport::StdioTransport;
use crate::agent::config::{ExternalAgentConfig, ToolServerSpec};
use crate::error::AcpError;

/// How to launch one external agent
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub init_timeout: Duration,
}

impl From<&ExternalAgentConfig> for ClientSpec {
    fn from(config: &ExternalAgentConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            cwd: config.cwd.clone(),
            init_timeout: config.init_timeout(),
        }
    }
}

/// Produces initialized clients
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, agent_name: &str, spec: &ClientSpec) -> Result<Arc<AcpClient>, AcpError>;
}

/// Spawns the agent as a subprocess and performs the handshake
pub struct StdioConnector {
    shell: Arc<dyn ShellExecutor>,
    resolve_timeout: Duration,
}

impl StdioConnector {
    pub fn new(shell: Arc<dyn ShellExecutor>) -> Self {
        Self {
            shell,
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
        }
    }
}

impl Default for StdioConnector {
    fn default() -> Self {
        Self::new(Arc::new(SystemShell))
    }
}

#[async_trait]
impl AgentConnector for StdioConnector {
    async fn connect(&self, agent_name: &str, spec: &ClientSpec) -> Result<Arc<AcpClient>, AcpError> {
        let command = resolve_command(self.shell.as_ref(), &spec.command, self.resolve_timeout).await?;
        let cwd = match &spec.cwd {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().map_err(|e| AcpError::Spawn {
                command: spec.command.clone(),
                reason: format!("no working directory: {}", e),
            })?,
        };

        let transport = StdioTransport::spawn(&command, &spec.args, &spec.env, &cwd).await?;
        let client = AcpClient::start(agent_name, Arc::new(transport));

        if let Err(e) = client.initialize(spec.init_timeout).await {
            client.close().await;
            return Err(e);
        }
        Ok(Arc::new(client))
    }
}

/// A live client and the sessions opened on it
pub(crate) struct ClientEntry {
    pub(crate) client: Arc<AcpClient>,
    pub(crate) sessions: HashMap<String, Arc<AcpSession>>,
}

/// Process-wide map from agent name to client
pub struct ClientRegistry {
    state: Arc<RwLock<HashMap<String, ClientEntry>>>,
    connector: Arc<dyn AgentConnector>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(Arc::new(StdioConnector::default()))
    }
}

impl ClientRegistry {
    pub fn new(connector: Arc<dyn AgentConnector>) -> Self {
        Self {
            state: Arc::new(RwLock::new(HashMap::new())),
            connector,
        }
    }

    /// Return the live client for `agent_name`, connecting if needed.
    ///
    /// A client whose process has exited is closed and replaced, and its
    /// sessions are marked closed.
    pub async fn get_or_create_client(
        &self,
        agent_name: &str,
        spec: &ClientSpec,
    ) -> Result<Arc<AcpClient>, AcpError> {
        {
            let state = self.state.read().await;
            if let Some(entry) = state.get(agent_name) {
                if entry.client.is_connected().await {
                    return Ok(Arc::clone(&entry.client));
                }
            }
        }

        let mut state = self.state.write().await;
        if let Some(entry) = state.get(agent_name) {
            if entry.client.is_connected().await {
                return Ok(Arc::clone(&entry.client));
            }
        }

        if let Some(stale) = state.remove(agent_name) {
            warn!(agent = agent_name, "External agent disconnected, reconnecting");
            for session in stale.sessions.values() {
                session.mark_closed();
            }
            stale.client.close().await;
        }

        info!(agent = agent_name, command = %spec.command, "Connecting external agent");
        let client = self.connector.connect(agent_name, spec).await?;
        state.insert(
            agent_name.to_string(),
            ClientEntry {
                client: Arc::clone(&client),
                sessions: HashMap::new(),
            },
        );
        Ok(client)
    }

    /// Open a session on `client` and track it under `agent_name`
    pub async fn new_session(
        &self,
        agent_name: &str,
        client: &Arc<AcpClient>,
        cwd: &Path,
        tool_servers: &[ToolServerSpec],
    ) -> Result<Arc<AcpSession>, AcpError> {
        let session_id = client.new_session(cwd, tool_servers).await?;
        let session = Arc::new(AcpSession::new(
            session_id.clone(),
            agent_name.to_string(),
            Arc::clone(client),
            Arc::downgrade(&self.state),
        ));

        let mut state = self.state.write().await;
        match state.get_mut(agent_name) {
            Some(entry) if Arc::ptr_eq(&entry.client, client) => {
                entry.sessions.insert(session_id, Arc::clone(&session));
            }
            _ => warn!(
                agent = agent_name,
                session = %session_id,
                "Client no longer registered; session is untracked"
            ),
        }
        Ok(session)
    }

    pub async fn get_session(&self, agent_name: &str, session_id: &str) -> Option<Arc<AcpSession>> {
        let state = self.state.read().await;
        state
            .get(agent_name)
            .and_then(|entry| entry.sessions.get(session_id))
            .cloned()
    }

    pub async fn close_session(&self, session: &AcpSession) -> Result<(), AcpError> {
        session.close().await
    }

    pub async fn session_count(&self, agent_name: &str) -> usize {
        let state = self.state.read().await;
        state.get(agent_name).map_or(0, |entry| entry.sessions.len())
    }

    pub async fn client_count(&self) -> usize {
        self.state.read().await.len()
    }

    /// Close every session and client
    pub async fn shutdown(&self) {
        let entries: Vec<(String, ClientEntry)> = self.state.write().await.drain().collect();
        for (name, entry) in entries {
            debug!(agent = %name, sessions = entry.sessions.len(), "Shutting down external agent");
            for session in entry.sessions.values() {
                session.mark_closed();
            }
            entry.client.close().await;
        }
    }
}
