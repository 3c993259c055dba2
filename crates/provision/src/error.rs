//! Error taxonomy for provisioning.
//!
//! Collaborator errors are caught at the orchestrator step boundary and
//! turned into exactly one terminal status event. [`ProvisionError::kind`] is
//! the stable tag carried on that event.

use thiserror::Error;

use crate::session::{SessionId, SessionState};

/// Errors from locating a device on the network.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Every scan strategy finished without seeing the address.
    #[error("Device not found on the network")]
    NotFound,

    /// The scan did not finish within its time budget.
    #[error("Network scan timed out after {0} seconds")]
    ScanTimeout(u64),

    /// Scanning could not run at all (missing tooling, bad subnet).
    #[error("Network scan unavailable: {0}")]
    Unavailable(String),
}

/// Errors from running a command on the device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Neither the supplied nor the default credential was accepted.
    #[error("SSH authentication failed")]
    AuthenticationFailed,

    /// Connecting or running the command exceeded its timeout.
    #[error("SSH connection timed out")]
    ConnectionTimeout,

    /// The device refused the connection or had no route.
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// The command ran and exited non-zero.
    #[error("Remote command exited with status {exit_status}: {stderr}")]
    CommandFailed { exit_status: i32, stderr: String },

    /// The local client process could not be started.
    #[error("Failed to start SSH client: {0}")]
    Spawn(String),
}

/// Errors from rendering or storing configuration payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// Parameters could not be turned into a configuration.
    #[error("Invalid configuration parameters: {0}")]
    InvalidParameters(String),

    /// The rendered payload could not be stored.
    #[error("Failed to persist configuration: {0}")]
    PersistFailed(String),
}

/// Errors from session registry operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No session with this id.
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// The backing store rejected the operation.
    #[error("Session store error: {0}")]
    Store(String),
}

/// Errors from the status bus.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatusError {
    /// No event log for this session.
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// A log (and its publisher) already exists for this session.
    #[error("Event log already open for session {0}")]
    AlreadyOpen(SessionId),

    /// A terminal event was already recorded.
    #[error("Session {0} already reached a terminal event")]
    Closed(SessionId),
}

impl From<StatusError> for RegistryError {
    fn from(err: StatusError) -> Self {
        match err {
            StatusError::SessionNotFound(id) => Self::SessionNotFound(id),
            other => Self::Store(other.to_string()),
        }
    }
}

/// Why a provisioning session stopped short of completion.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Connection failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Personalization failed: {0}")]
    Render(#[from] RenderError),

    /// No device-side fetch was observed within the grace interval.
    #[error("Device did not fetch its configuration within {0} seconds")]
    FetchTimedOut(u64),

    #[error("Provisioning cancelled")]
    Cancelled,
}

impl ProvisionError {
    /// Stable tag for the error event.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Discovery(DiscoveryError::NotFound) => "not_found",
            Self::Discovery(DiscoveryError::ScanTimeout(_)) => "scan_timeout",
            Self::Discovery(DiscoveryError::Unavailable(_)) => "scan_unavailable",
            Self::Transport(TransportError::AuthenticationFailed) => "authentication_failed",
            Self::Transport(TransportError::ConnectionTimeout) => "connection_timeout",
            Self::Transport(TransportError::NetworkUnreachable(_)) => "network_unreachable",
            Self::Transport(TransportError::CommandFailed { .. }) => "command_failed",
            Self::Transport(TransportError::Spawn(_)) => "transport_unavailable",
            Self::Render(RenderError::InvalidParameters(_)) => "invalid_parameters",
            Self::Render(RenderError::PersistFailed(_)) => "persist_failed",
            Self::FetchTimedOut(_) => "fetch_timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal state this failure drives the session into.
    #[must_use]
    pub fn terminal_state(&self) -> SessionState {
        match self {
            Self::Discovery(_) => SessionState::DiscoveryFailed,
            Self::Transport(_) => SessionState::ConnectionFailed,
            Self::Render(_) => SessionState::PersonalizeFailed,
            Self::FetchTimedOut(_) => SessionState::FetchTimedOut,
            Self::Cancelled => SessionState::Cancelled,
        }
    }
}
