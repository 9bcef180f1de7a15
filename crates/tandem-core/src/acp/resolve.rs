//! Command resolution for external agents
//!
//! Bare command names are looked up through the user's shell first, so
//! version-manager shims and login-shell PATH tweaks are honored, then
//! through a PATH search.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::error::AcpError;

/// Bound on the shell lookup
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Runs a command line through a shell
#[async_trait]
pub trait ShellExecutor: Send + Sync {
    async fn run(&self, command_line: &str, timeout: Duration) -> Result<ShellOutput>;
}

/// `sh -c` (or `cmd /C` on Windows)
pub struct SystemShell;

#[async_trait]
impl ShellExecutor for SystemShell {
    async fn run(&self, command_line: &str, timeout: Duration) -> Result<ShellOutput> {
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(command_line);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(command_line);
            c
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("'{}' timed out after {}s", command_line, timeout.as_secs()))??;

        Ok(ShellOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }
}

/// Resolve an external agent command to an executable path
pub async fn resolve_command(
    shell: &dyn ShellExecutor,
    command: &str,
    timeout: Duration,
) -> Result<PathBuf, AcpError> {
    if command.contains('/') || command.contains('\\') {
        return Ok(PathBuf::from(command));
    }

    let lookup = if cfg!(windows) {
        format!("where {}", command)
    } else {
        format!("command -v {}", shell_words::quote(command))
    };

    match shell.run(&lookup, timeout).await {
        Ok(output) if output.exit_code == Some(0) => {
            if let Some(path) = output.stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
                tracing::debug!(command, path, "Resolved command through shell");
                return Ok(PathBuf::from(path));
            }
        }
        Ok(output) => {
            tracing::debug!(command, exit_code = ?output.exit_code, "Shell lookup found nothing");
        }
        Err(e) => {
            tracing::debug!(command, error = %e, "Shell lookup failed");
        }
    }

    which::which(command).map_err(|_| AcpError::CommandNotFound(command.to_string()))
}
