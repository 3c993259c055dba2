//! Configuration payload rendering and storage.

mod routeros;
mod store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::RenderError;
use crate::mac::HardwareAddress;
use crate::session::NetworkParams;

pub use routeros::{RenderSettings, RouterOsRenderer};
pub use store::{ConfigStore, MemoryConfigStore};

/// Name of the base payload as served to devices.
pub const BASE_CONFIG_NAME: &str = "base.rsc";

/// Identifies a stored payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "hardware_address")]
pub enum ConfigKey {
    /// Shared bootstrap configuration.
    Base,
    /// Device-specific configuration.
    Personalized(HardwareAddress),
}

impl ConfigKey {
    /// File name the device requests.
    #[must_use]
    pub fn file_name(&self) -> String {
        match self {
            Self::Base => BASE_CONFIG_NAME.to_string(),
            Self::Personalized(hw) => format!("{hw}.rsc"),
        }
    }

    #[must_use]
    pub fn hardware_address(&self) -> Option<HardwareAddress> {
        match self {
            Self::Base => None,
            Self::Personalized(hw) => Some(*hw),
        }
    }
}

/// A rendered configuration script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPayload {
    pub key: ConfigKey,
    pub name: String,
    pub body: String,
    pub rendered_at: DateTime<Utc>,
}

impl ConfigPayload {
    #[must_use]
    pub fn new(key: ConfigKey, body: String) -> Self {
        Self {
            name: key.file_name(),
            key,
            body,
            rendered_at: Utc::now(),
        }
    }
}

/// Listing metadata for a stored payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigEntry {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_address: Option<HardwareAddress>,
    /// Body length in bytes.
    pub size: usize,
    pub modified_at: DateTime<Utc>,
    /// Last time the device downloaded this payload.
    pub fetched_at: Option<DateTime<Utc>>,
}

impl From<&ConfigPayload> for ConfigEntry {
    fn from(payload: &ConfigPayload) -> Self {
        Self {
            name: payload.name.clone(),
            hardware_address: payload.key.hardware_address(),
            size: payload.body.len(),
            modified_at: payload.rendered_at,
            fetched_at: None,
        }
    }
}

/// Produces and retrieves configuration payloads.
///
/// Rendering the same key again overwrites the previous payload.
#[async_trait]
pub trait ConfigRenderer: Send + Sync {
    /// Render the bootstrap script pointing devices at `server_address`
    /// (`host:port`).
    async fn render_base(&self, server_address: &str) -> Result<ConfigPayload, RenderError>;

    /// Render and store the device-specific script.
    async fn render_personalized(
        &self,
        hardware_address: &HardwareAddress,
        params: &NetworkParams,
    ) -> Result<ConfigPayload, RenderError>;

    async fn lookup(&self, hardware_address: &HardwareAddress) -> Option<ConfigPayload>;

    async fn lookup_base(&self) -> Option<ConfigPayload>;

    /// Stored payloads, sorted by name.
    async fn list(&self) -> Vec<ConfigEntry>;

    /// Drop a personalized payload; `false` if none was stored.
    async fn remove(&self, hardware_address: &HardwareAddress) -> bool;
}
