//! SSH executor backed by the system `ssh` client.
//!
//! Passwords are fed through `sshpass -e` (via the `SSHPASS` environment
//! variable, never argv). RouterOS ships with an `admin` user and an empty
//! password, so when the supplied password is rejected the executor makes
//! exactly one more attempt with the default password.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{CommandOutput, RemoteExecutor};
use crate::error::TransportError;
use crate::session::Credentials;

/// `sshpass` exit code for a rejected password.
const SSHPASS_BAD_PASSWORD: i32 = 5;

/// `ssh` exit code for its own (non-remote) failures.
const SSH_CLIENT_ERROR: i32 = 255;

/// Connection settings for [`SshExecutor`].
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub username: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Password tried when the supplied one is rejected (or none was given).
    pub default_password: String,
    /// Path or name of the `ssh` binary.
    pub ssh_program: String,
    /// Path or name of the `sshpass` binary.
    pub sshpass_program: String,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            port: 22,
            connect_timeout: Duration::from_secs(10),
            default_password: String::new(),
            ssh_program: "ssh".to_string(),
            sshpass_program: "sshpass".to_string(),
        }
    }
}

/// Runs RouterOS commands over SSH.
#[derive(Debug, Clone, Default)]
pub struct SshExecutor {
    settings: SshSettings,
}

impl SshExecutor {
    #[must_use]
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    fn command(&self, address: IpAddr, command: &str, password: &str) -> Command {
        let mut cmd = Command::new(&self.settings.sshpass_program);
        cmd.arg("-e")
            .arg(&self.settings.ssh_program)
            .args(["-p", &self.settings.port.to_string()])
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "LogLevel=ERROR"])
            .args(["-o", "PubkeyAuthentication=no"])
            .args(["-o", "PreferredAuthentications=password,keyboard-interactive"])
            .args(["-o", "NumberOfPasswordPrompts=1"])
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.settings.connect_timeout.as_secs().max(1)
            ))
            .arg(format!("{}@{}", self.settings.username, address))
            .arg(command)
            .env("SSHPASS", password)
            .kill_on_drop(true);
        cmd
    }

    async fn attempt(
        &self,
        address: IpAddr,
        command: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        debug!(%address, command, "Executing command");

        let mut cmd = self.command(address, command, password);
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| TransportError::ConnectionTimeout)?
            .map_err(|e| TransportError::Spawn(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let exit_status = classify_exit(output.status.code(), &stderr)?;

        if exit_status == 0 {
            info!(%address, "Command executed successfully");
            if !stdout.is_empty() {
                debug!("Command output: {stdout}");
            }
        } else {
            warn!(%address, exit_status, "Command failed");
            if !stderr.is_empty() {
                warn!("Command error: {stderr}");
            }
        }

        Ok(CommandOutput {
            exit_status,
            stdout,
            stderr,
        })
    }
}

/// Passwords to try, in order: the supplied one, then the default if it differs.
fn attempt_plan<'a>(credentials: &'a Credentials, default_password: &'a str) -> Vec<&'a str> {
    let supplied = credentials.secret();
    if credentials.is_empty() || supplied == default_password {
        vec![default_password]
    } else {
        vec![supplied, default_password]
    }
}

/// Map the client's exit status to the remote exit status or a transport error.
fn classify_exit(code: Option<i32>, stderr: &str) -> Result<i32, TransportError> {
    let Some(code) = code else {
        return Err(TransportError::Spawn("ssh client terminated by signal".into()));
    };

    let lower = stderr.to_ascii_lowercase();
    match code {
        SSHPASS_BAD_PASSWORD => Err(TransportError::AuthenticationFailed),
        SSH_CLIENT_ERROR if lower.contains("permission denied") => {
            Err(TransportError::AuthenticationFailed)
        }
        SSH_CLIENT_ERROR if lower.contains("timed out") => Err(TransportError::ConnectionTimeout),
        SSH_CLIENT_ERROR => {
            let reason = stderr
                .lines()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("ssh connection failed")
                .trim()
                .to_string();
            Err(TransportError::NetworkUnreachable(reason))
        }
        code => Ok(code),
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(
        &self,
        address: IpAddr,
        command: &str,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        let deadline = Instant::now() + timeout;
        let plan = attempt_plan(credentials, &self.settings.default_password);
        let last = plan.len() - 1;

        info!(%address, user = %self.settings.username, "Attempting SSH connection");
        for (i, password) in plan.into_iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::ConnectionTimeout);
            }
            match self.attempt(address, command, password, remaining).await {
                Err(TransportError::AuthenticationFailed) if i < last => {
                    info!(%address, "Supplied password rejected, trying default password");
                }
                other => return other,
            }
        }
        Err(TransportError::AuthenticationFailed)
    }
}
