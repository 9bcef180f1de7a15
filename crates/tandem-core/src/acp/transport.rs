//! ACP stdio transport
//!
//! External agents speak newline-delimited JSON-RPC over stdin/stdout.
//! The `Transport` trait lets the client run over an in-memory channel in tests.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::protocol::masked_env;
use crate::error::AcpError;

/// Line-oriented message channel to an external agent
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: &str) -> Result<()>;

    /// Next JSON message; errors once the peer is gone
    async fn receive(&self) -> Result<String>;

    async fn is_alive(&self) -> bool;

    async fn close(&self);
}

/// Subprocess transport for a local external agent
pub struct StdioTransport {
    command: String,
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Child>,
}

impl StdioTransport {
    /// Spawn the agent process with piped stdio
    pub async fn spawn(
        command: &Path,
        args: &[String],
        env: &HashMap<String, String>,
        working_dir: &Path,
    ) -> Result<Self, AcpError> {
        let shown = command.display().to_string();
        tracing::info!(command = %shown, ?args, cwd = %working_dir.display(), "Spawning external agent");
        if !env.is_empty() {
            tracing::debug!(env = ?masked_env(env), "External agent environment");
        }

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .current_dir(working_dir)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AcpError::CommandNotFound(shown.clone())
            } else {
                AcpError::Spawn {
                    command: shown.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let stdin = child.stdin.take().ok_or_else(|| AcpError::Spawn {
            command: shown.clone(),
            reason: "no stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| AcpError::Spawn {
            command: shown.clone(),
            reason: "no stdout".to_string(),
        })?;

        Ok(Self {
            command: shown,
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(child),
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(message.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        tracing::trace!(command = %self.command, "Sent: {}", message);
        Ok(())
    }

    async fn receive(&self) -> Result<String> {
        let mut stdout = self.stdout.lock().await;

        loop {
            let mut line = String::new();
            let bytes = stdout.read_line(&mut line).await?;

            if bytes == 0 {
                let mut child = self.child.lock().await;
                return match child.try_wait() {
                    Ok(Some(status)) => Err(anyhow!("{} exited with {}", self.command, status)),
                    Ok(None) => Err(anyhow!("{} closed stdout", self.command)),
                    Err(e) => Err(anyhow!("error checking {} status: {}", self.command, e)),
                };
            }

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('{') {
                tracing::trace!(command = %self.command, "Received: {}", line);
                return Ok(line.to_string());
            }

            // Agents sometimes print banners or logs to stdout
            tracing::debug!(command = %self.command, "Skipping non-JSON line: {}", line);
        }
    }

    async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    async fn close(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            tracing::debug!(command = %self.command, error = %e, "Agent process already gone");
        }
    }
}
