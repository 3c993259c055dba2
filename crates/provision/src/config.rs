//! Service configuration.
//!
//! Every field has a default, so an absent file or an empty one yields a
//! working configuration. CLI flags override individual values after load.
//!
//! ```toml
//! listen = "0.0.0.0:5000"
//! public_address = "192.168.88.10:5000"
//!
//! [orchestrator]
//! grace_interval_secs = 45
//! require_fetch_confirmation = true
//!
//! [discovery]
//! subnet = "192.168.88.0/24"
//! interface = "eth1"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::executor::SshSettings;
use crate::locator::ArpLocatorConfig;
use crate::net::Ipv4Cidr;
use crate::orchestrator::{OrchestratorConfig, DEFAULT_BOOTSTRAP_COMMAND};
use crate::render::RenderSettings;

/// Errors loading the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisionerConfig {
    /// HTTP listen address.
    pub listen: SocketAddr,
    /// `host:port` devices use to reach this server. Detected when absent.
    pub public_address: Option<String>,
    pub sessions: SessionsSection,
    pub orchestrator: OrchestratorSection,
    pub discovery: DiscoverySection,
    pub ssh: SshSection,
    pub render: RenderSection,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 5000)),
            public_address: None,
            sessions: SessionsSection::default(),
            orchestrator: OrchestratorSection::default(),
            discovery: DiscoverySection::default(),
            ssh: SshSection::default(),
            render: RenderSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionsSection {
    /// Sessions older than this are evicted.
    pub retention_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            retention_secs: 24 * 60 * 60,
            reap_interval_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorSection {
    pub discovery_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub render_timeout_secs: u64,
    pub grace_interval_secs: u64,
    pub require_fetch_confirmation: bool,
    /// Confirmation-mode wait; twice the grace interval when absent.
    pub fetch_confirmation_timeout_secs: Option<u64>,
    /// RouterOS command sent over SSH; `{base_url}` is substituted.
    pub bootstrap_command: String,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            discovery_timeout_secs: 90,
            command_timeout_secs: 30,
            render_timeout_secs: 10,
            grace_interval_secs: 30,
            require_fetch_confirmation: false,
            fetch_confirmation_timeout_secs: None,
            bootstrap_command: DEFAULT_BOOTSTRAP_COMMAND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoverySection {
    /// Subnet to sweep; the /24 around the server address when absent.
    pub subnet: Option<String>,
    /// Interface handed to `arp-scan`.
    pub interface: Option<String>,
    pub arp_scan_timeout_secs: u64,
    pub ping_timeout_secs: u64,
    pub max_parallel_pings: usize,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            subnet: None,
            interface: None,
            arp_scan_timeout_secs: 30,
            ping_timeout_secs: 1,
            max_parallel_pings: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshSection {
    pub username: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
    /// Tried when the supplied password is rejected.
    pub default_password: String,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            port: 22,
            connect_timeout_secs: 10,
            default_password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenderSection {
    pub timezone: String,
    pub wan_vlan_id: u16,
}

impl Default for RenderSection {
    fn default() -> Self {
        Self {
            timezone: "Europe/Rome".to_string(),
            wan_vlan_id: 835,
        }
    }
}

impl ProvisionerConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(subnet) = &self.discovery.subnet {
            Ipv4Cidr::parse(subnet).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        if self.render.wan_vlan_id == 0 || self.render.wan_vlan_id > 4094 {
            return Err(ConfigError::Invalid(format!(
                "wan_vlan_id {} out of range 1-4094",
                self.render.wan_vlan_id
            )));
        }
        if self.orchestrator.bootstrap_command.trim().is_empty() {
            return Err(ConfigError::Invalid("bootstrap_command is empty".into()));
        }
        if let Some(window) = self.orchestrator.fetch_confirmation_timeout_secs {
            if window < self.orchestrator.grace_interval_secs {
                return Err(ConfigError::Invalid(format!(
                    "fetch_confirmation_timeout_secs {window} is shorter than grace_interval_secs {}",
                    self.orchestrator.grace_interval_secs
                )));
            }
        }
        if self.discovery.max_parallel_pings == 0 {
            return Err(ConfigError::Invalid("max_parallel_pings must be at least 1".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.sessions.retention_secs)
    }

    #[must_use]
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.sessions.reap_interval_secs)
    }

    /// Orchestrator settings with devices pointed at `public_address`.
    #[must_use]
    pub fn orchestrator_config(&self, public_address: &str) -> OrchestratorConfig {
        let section = &self.orchestrator;
        OrchestratorConfig {
            discovery_timeout: Duration::from_secs(section.discovery_timeout_secs),
            command_timeout: Duration::from_secs(section.command_timeout_secs),
            render_timeout: Duration::from_secs(section.render_timeout_secs),
            grace_interval: Duration::from_secs(section.grace_interval_secs),
            require_fetch_confirmation: section.require_fetch_confirmation,
            fetch_confirmation_timeout: Duration::from_secs(
                section
                    .fetch_confirmation_timeout_secs
                    .unwrap_or(section.grace_interval_secs.saturating_mul(2)),
            ),
            bootstrap_command: section.bootstrap_command.clone(),
            base_url: format!("http://{public_address}"),
        }
    }

    #[must_use]
    pub fn ssh_settings(&self) -> SshSettings {
        SshSettings {
            username: self.ssh.username.clone(),
            port: self.ssh.port,
            connect_timeout: Duration::from_secs(self.ssh.connect_timeout_secs),
            default_password: self.ssh.default_password.clone(),
            ..SshSettings::default()
        }
    }

    #[must_use]
    pub fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            timezone: self.render.timezone.clone(),
            wan_vlan_id: self.render.wan_vlan_id,
            fetch_interval_secs: self.orchestrator.grace_interval_secs,
        }
    }

    /// Locator settings; `fallback_subnet` is used when none is configured.
    pub fn locator_config(&self, fallback_subnet: Ipv4Cidr) -> Result<ArpLocatorConfig, ConfigError> {
        let subnet = match &self.discovery.subnet {
            Some(subnet) => Ipv4Cidr::parse(subnet).map_err(|e| ConfigError::Invalid(e.to_string()))?,
            None => fallback_subnet,
        };
        let mut config = ArpLocatorConfig::new(subnet);
        config.interface.clone_from(&self.discovery.interface);
        config.arp_scan_timeout = Duration::from_secs(self.discovery.arp_scan_timeout_secs);
        config.ping_timeout = Duration::from_secs(self.discovery.ping_timeout_secs);
        config.max_parallel_pings = self.discovery.max_parallel_pings;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = ProvisionerConfig::from_toml("").unwrap();
        assert_eq!(config.listen.port(), 5000);
        assert_eq!(config.sessions.retention_secs, 86_400);
        assert_eq!(config.orchestrator.grace_interval_secs, 30);
        assert!(!config.orchestrator.require_fetch_confirmation);
        assert_eq!(config.ssh.username, "admin");
        assert_eq!(config.render.wan_vlan_id, 835);
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = ProvisionerConfig::from_toml(
            r#"
            listen = "127.0.0.1:8080"
            public_address = "192.168.88.10:8080"

            [orchestrator]
            grace_interval_secs = 5
            require_fetch_confirmation = true

            [discovery]
            subnet = "192.168.88.0/24"
            interface = "eth1"
            "#,
        )
        .unwrap();

        let orchestrator = config.orchestrator_config("192.168.88.10:8080");
        assert_eq!(orchestrator.grace_interval, Duration::from_secs(5));
        assert!(orchestrator.require_fetch_confirmation);
        // one extra device poll interval past the grace interval
        assert_eq!(orchestrator.fetch_confirmation_timeout, Duration::from_secs(10));
        assert!(orchestrator
            .bootstrap_command()
            .contains("url=http://192.168.88.10:8080/config/base.rsc"));

        let locator = config
            .locator_config(Ipv4Cidr::parse("10.0.0.0/24").unwrap())
            .unwrap();
        assert_eq!(locator.subnet.to_string(), "192.168.88.0/24");
        assert_eq!(locator.interface.as_deref(), Some("eth1"));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            ProvisionerConfig::from_toml("[discovery]\nsubnet = \"nope\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ProvisionerConfig::from_toml("[render]\nwan_vlan_id = 5000"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ProvisionerConfig::from_toml(
                "[orchestrator]\ngrace_interval_secs = 30\nfetch_confirmation_timeout_secs = 10"
            ),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ProvisionerConfig::from_toml("unknown_key = 1"),
            Err(ConfigError::Parse { .. })
        ));
    }
}
