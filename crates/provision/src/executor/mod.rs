//! Remote command execution on the device.

mod ssh;

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::session::Credentials;

pub use ssh::{SshExecutor, SshSettings};

/// Result of a command that reached the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// Runs one command against a device.
///
/// Implementations own any credential fallback; callers see a single
/// outcome per call.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(
        &self,
        address: IpAddr,
        command: &str,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError>;
}
