//! Provisioning session types.
//!
//! A [`Session`] is immutable once created. Its progress lives in the
//! session's event log: every [`StatusEvent`] records the [`SessionState`] it
//! entered, so a [`SessionSnapshot`] derives the current state from the
//! latest event.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mac::HardwareAddress;
use crate::status::{EventKind, StatusEvent};

/// Opaque session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an id received from a caller.
    pub fn parse(input: &str) -> Option<Self> {
        Uuid::parse_str(input).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Remote shell secret supplied by the caller.
///
/// Empty means "use the device default". The secret never appears in `Debug`
/// output or serialized snapshots.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    password: Option<String>,
}

impl Credentials {
    /// Credentials carrying a password; an empty string is treated as none.
    #[must_use]
    pub fn password(password: impl Into<String>) -> Self {
        let password = password.into();
        Self {
            password: (!password.is_empty()).then_some(password),
        }
    }

    /// No secret: the executor uses its default.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.password.is_none()
    }

    /// The secret, or `""` when empty.
    #[must_use]
    pub fn secret(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = if self.is_empty() { "<empty>" } else { "<redacted>" };
        f.debug_struct("Credentials").field("password", &shown).finish()
    }
}

/// Parameters for the personalized configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkParams {
    /// LAN address with prefix, e.g. `192.168.50.1/24`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_address_with_prefix: Option<String>,
    /// PPPoE username.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_username: Option<String>,
    /// PPPoE password. Never serialized.
    #[serde(default, skip_serializing)]
    pub tunnel_password: Option<String>,
    /// Free-form parameters handed verbatim to the renderer.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_params: BTreeMap<String, serde_json::Value>,
}

/// Provisioning state machine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    /// Registered, orchestrator not started yet.
    Created,
    /// Scanning the network for the hardware address.
    Discovering,
    /// Device address resolved.
    Discovered,
    DiscoveryFailed,
    /// Sending the bootstrap fetch command.
    Connecting,
    /// Device accepted the bootstrap command.
    BaseDelivered,
    ConnectionFailed,
    /// Rendering the device-specific configuration.
    Personalizing,
    PersonalizeFailed,
    /// Grace interval for the device-side fetch.
    AwaitingFetch,
    /// Delivery mechanism completed.
    Completed,
    FetchTimedOut,
    Cancelled,
}

impl SessionState {
    /// No further events follow a terminal state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::DiscoveryFailed
                | Self::ConnectionFailed
                | Self::PersonalizeFailed
                | Self::Completed
                | Self::FetchTimedOut
                | Self::Cancelled
        )
    }

    /// Percentage shown to callers; `None` for failure states, which keep the
    /// progress reached before failing.
    #[must_use]
    pub fn progress(self) -> Option<u8> {
        match self {
            Self::Created => Some(0),
            Self::Discovering => Some(20),
            Self::Discovered => Some(30),
            Self::Connecting => Some(40),
            Self::BaseDelivered => Some(60),
            Self::Personalizing => Some(70),
            Self::AwaitingFetch => Some(80),
            Self::Completed => Some(100),
            Self::DiscoveryFailed
            | Self::ConnectionFailed
            | Self::PersonalizeFailed
            | Self::FetchTimedOut
            | Self::Cancelled => None,
        }
    }
}

/// One provisioning attempt.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub hardware_address: HardwareAddress,
    pub credentials: Credentials,
    pub network_params: NetworkParams,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Create a session with a fresh id.
    #[must_use]
    pub fn new(
        hardware_address: HardwareAddress,
        credentials: Credentials,
        network_params: NetworkParams,
    ) -> Self {
        Self {
            id: SessionId::new(),
            hardware_address,
            credentials,
            network_params,
            created_at: Utc::now(),
        }
    }
}

/// Read-only view of a session for callers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub hardware_address: HardwareAddress,
    pub network_params: NetworkParams,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
    /// Latest message, if any event was recorded.
    pub current_message: Option<String>,
    pub current_kind: Option<EventKind>,
    pub last_sequence: u64,
    pub total_updates: usize,
    pub progress: u8,
    pub is_complete: bool,
    pub is_error: bool,
    /// Seconds between creation and the latest event.
    pub duration_secs: f64,
}

impl SessionSnapshot {
    /// Build a snapshot from the session and its full event log.
    #[must_use]
    pub fn from_events(session: &Session, events: &[StatusEvent]) -> Self {
        let latest = events.last();
        let state = latest.map_or(SessionState::Created, |e| e.state);
        let progress = events
            .iter()
            .filter_map(|e| e.state.progress())
            .last()
            .unwrap_or(0);
        let duration_secs = latest.map_or(0.0, |e| seconds_between(session.created_at, e.occurred_at));

        Self {
            session_id: session.id,
            hardware_address: session.hardware_address,
            network_params: session.network_params.clone(),
            created_at: session.created_at,
            state,
            current_message: latest.map(|e| e.message.clone()),
            current_kind: latest.map(|e| e.kind),
            last_sequence: latest.map_or(0, |e| e.sequence),
            total_updates: events.len(),
            progress,
            is_complete: latest.is_some_and(|e| e.kind.is_terminal()),
            is_error: latest.is_some_and(|e| e.kind == EventKind::Error),
            duration_secs,
        }
    }
}

/// An event annotated with its offset from session creation.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    #[serde(flatten)]
    pub event: StatusEvent,
    pub relative_secs: f64,
}

impl TimelineEntry {
    #[must_use]
    pub fn build(session: &Session, events: Vec<StatusEvent>) -> Vec<Self> {
        events
            .into_iter()
            .map(|event| Self {
                relative_secs: seconds_between(session.created_at, event.occurred_at),
                event,
            })
            .collect()
    }
}

#[allow(clippy::cast_precision_loss)]
fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}
