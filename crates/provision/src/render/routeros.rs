//! RouterOS script renderer.
//!
//! Both scripts are Handlebars templates compiled into the binary. Values
//! interpolated inside RouterOS string literals are escaped first, and the
//! engine itself does no HTML escaping.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use handlebars::{no_escape, Handlebars, TemplateError};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use super::{ConfigEntry, ConfigKey, ConfigPayload, ConfigRenderer, ConfigStore};
use crate::error::RenderError;
use crate::mac::HardwareAddress;
use crate::net::Ipv4Cidr;
use crate::session::NetworkParams;

const BASE_TEMPLATE: &str = include_str!("../../templates/base.rsc.hbs");
const PERSONALIZED_TEMPLATE: &str = include_str!("../../templates/personalized.rsc.hbs");

/// LAN used until the personalized configuration replaces it.
const DEFAULT_LAN: &str = "192.168.188.1/24";

/// Largest prefix that still leaves room for the DHCP pool offsets.
const MAX_LAN_PREFIX: u8 = 27;

const POOL_START_OFFSET: u32 = 20;
const BASE_POOL_END_OFFSET: u32 = 30;
const POOL_END_OFFSET: u32 = 250;

/// Site-wide values baked into every script.
#[derive(Debug, Clone)]
pub struct RenderSettings {
    /// RouterOS time zone name.
    pub timezone: String,
    /// VLAN carrying the PPPoE uplink on ether1.
    pub wan_vlan_id: u16,
    /// Interval of the device-side scheduler that fetches the personalized script.
    pub fetch_interval_secs: u64,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            timezone: "Europe/Rome".to_string(),
            wan_vlan_id: 835,
            fetch_interval_secs: 30,
        }
    }
}

#[derive(Debug, Serialize)]
struct LanContext {
    cidr: String,
    address: String,
    network: String,
    prefix: u8,
    pool_start: String,
    pool_end: String,
}

impl LanContext {
    fn new(cidr: Ipv4Cidr, pool_end_offset: u32) -> Result<Self, RenderError> {
        if cidr.prefix() > MAX_LAN_PREFIX {
            return Err(RenderError::InvalidParameters(format!(
                "LAN prefix /{} leaves no room for a DHCP pool",
                cidr.prefix()
            )));
        }
        let pool_start = cidr
            .host(POOL_START_OFFSET)
            .ok_or_else(|| RenderError::InvalidParameters(format!("no DHCP pool in {cidr}")))?;
        // stop short of the broadcast address on small networks
        let pool_end = cidr
            .host(pool_end_offset)
            .filter(|end| cidr.hosts().last().is_some_and(|last| *end <= last))
            .or_else(|| cidr.hosts().last())
            .ok_or_else(|| RenderError::InvalidParameters(format!("no DHCP pool in {cidr}")))?;

        Ok(Self {
            cidr: cidr.to_string(),
            address: cidr.address().to_string(),
            network: cidr.network().to_string(),
            prefix: cidr.prefix(),
            pool_start: pool_start.to_string(),
            pool_end: pool_end.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct BaseContext<'a> {
    generated_at: String,
    server_address: &'a str,
    timezone: &'a str,
    wan_vlan_id: u16,
    fetch_delay_secs: u64,
    lan: LanContext,
}

#[derive(Debug, Serialize)]
struct WifiContext {
    ssid: String,
    password: String,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
struct PortForward {
    external_port: u16,
    address: String,
    port: u16,
}

#[derive(Debug, Serialize)]
struct PersonalizedContext<'a> {
    generated_at: String,
    hardware_address: String,
    identity: String,
    timezone: &'a str,
    pppoe_user: String,
    pppoe_password: String,
    lan: LanContext,
    wifi: Option<WifiContext>,
    vlan_ids: Vec<u16>,
    bandwidth_limit: Option<String>,
    port_forwards: Vec<PortForward>,
}

/// Renders RouterOS `.rsc` scripts into a [`ConfigStore`].
pub struct RouterOsRenderer {
    templates: Handlebars<'static>,
    store: Arc<dyn ConfigStore>,
    settings: RenderSettings,
}

impl RouterOsRenderer {
    /// Compile the embedded templates.
    pub fn new(store: Arc<dyn ConfigStore>, settings: RenderSettings) -> Result<Self, TemplateError> {
        let mut templates = Handlebars::new();
        templates.register_escape_fn(no_escape);
        templates.set_strict_mode(true);
        templates.register_template_string("base", BASE_TEMPLATE)?;
        templates.register_template_string("personalized", PERSONALIZED_TEMPLATE)?;

        Ok(Self {
            templates,
            store,
            settings,
        })
    }

    fn render<T: Serialize>(&self, template: &str, context: &T) -> Result<String, RenderError> {
        self.templates
            .render(template, context)
            .map_err(|e| RenderError::InvalidParameters(format!("template {template}: {e}")))
    }

    fn personalized_context(
        &self,
        hardware_address: &HardwareAddress,
        params: &NetworkParams,
    ) -> Result<PersonalizedContext<'_>, RenderError> {
        let lan_input = params
            .network_address_with_prefix
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_LAN);
        let cidr = Ipv4Cidr::parse(lan_input)
            .map_err(|e| RenderError::InvalidParameters(e.to_string()))?;

        let extra = &params.additional_params;
        let wifi = match (string_param(extra, "wifi_ssid"), string_param(extra, "wifi_password")) {
            (Some(ssid), Some(password)) => Some(WifiContext {
                ssid: quote(&ssid),
                password: quote(&password),
            }),
            _ => None,
        };

        Ok(PersonalizedContext {
            generated_at: timestamp(),
            hardware_address: hardware_address.to_string(),
            identity: format!("RouterBoard-{}", hardware_address.compact()),
            timezone: &self.settings.timezone,
            pppoe_user: quote(params.tunnel_username.as_deref().unwrap_or("")),
            pppoe_password: quote(params.tunnel_password.as_deref().unwrap_or("")),
            lan: LanContext::new(cidr, POOL_END_OFFSET)?,
            wifi,
            vlan_ids: extra.get("vlan_ids").map(parse_vlan_ids).unwrap_or_default(),
            bandwidth_limit: string_param(extra, "bandwidth_limit")
                .filter(|limit| is_bare_token(limit)),
            port_forwards: extra
                .get("port_forwards")
                .map(parse_port_forwards)
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl ConfigRenderer for RouterOsRenderer {
    async fn render_base(&self, server_address: &str) -> Result<ConfigPayload, RenderError> {
        if server_address.is_empty() || !is_bare_token(server_address) {
            return Err(RenderError::InvalidParameters(format!(
                "invalid server address: {server_address:?}"
            )));
        }
        let lan = Ipv4Cidr::parse(DEFAULT_LAN).map_err(|e| RenderError::InvalidParameters(e.to_string()))?;
        let context = BaseContext {
            generated_at: timestamp(),
            server_address,
            timezone: &self.settings.timezone,
            wan_vlan_id: self.settings.wan_vlan_id,
            fetch_delay_secs: self.settings.fetch_interval_secs.max(1),
            lan: LanContext::new(lan, BASE_POOL_END_OFFSET)?,
        };

        let payload = ConfigPayload::new(ConfigKey::Base, self.render("base", &context)?);
        self.store.put(payload.clone()).await?;
        info!(server_address, "Generated base RouterOS configuration");
        Ok(payload)
    }

    async fn render_personalized(
        &self,
        hardware_address: &HardwareAddress,
        params: &NetworkParams,
    ) -> Result<ConfigPayload, RenderError> {
        let context = self.personalized_context(hardware_address, params)?;
        let body = self.render("personalized", &context)?;
        let payload = ConfigPayload::new(ConfigKey::Personalized(*hardware_address), body);
        self.store.put(payload.clone()).await?;
        info!(
            hardware_address = %hardware_address,
            lan = %context.lan.cidr,
            "Generated personalized configuration"
        );
        Ok(payload)
    }

    async fn lookup(&self, hardware_address: &HardwareAddress) -> Option<ConfigPayload> {
        let found = self
            .store
            .get(&ConfigKey::Personalized(*hardware_address))
            .await;
        if found.is_none() {
            warn!(hardware_address = %hardware_address, "No personalized config found");
        }
        found
    }

    async fn lookup_base(&self) -> Option<ConfigPayload> {
        self.store.get(&ConfigKey::Base).await
    }

    async fn list(&self) -> Vec<ConfigEntry> {
        let mut entries: Vec<ConfigEntry> = self.store.list().await.iter().map(ConfigEntry::from).collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    async fn remove(&self, hardware_address: &HardwareAddress) -> bool {
        let removed = self
            .store
            .remove(&ConfigKey::Personalized(*hardware_address))
            .await;
        if removed {
            info!(hardware_address = %hardware_address, "Removed personalized config");
        }
        removed
    }
}

fn timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Escape a value for use inside a RouterOS double-quoted string.
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' | '\\' | '$' => {
                out.push('\\');
                out.push(c);
            }
            '\n' | '\r' => out.push(' '),
            c => out.push(c),
        }
    }
    out
}

/// Values placed outside quotes must not break the command line.
fn is_bare_token(value: &str) -> bool {
    value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '/' | '-' | '_'))
}

fn string_param(params: &std::collections::BTreeMap<String, Value>, key: &str) -> Option<String> {
    match params.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Accepts `"10,20"` or `[10, 20]`; non-numeric entries are skipped.
fn parse_vlan_ids(value: &Value) -> Vec<u16> {
    let candidates: Vec<String> = match value {
        Value::String(s) => s.split(',').map(|v| v.trim().to_string()).collect(),
        Value::Array(items) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .collect(),
        Value::Number(n) => vec![n.to_string()],
        _ => Vec::new(),
    };

    candidates
        .iter()
        .filter_map(|v| match v.parse::<u16>() {
            Ok(id) if (1..=4094).contains(&id) => Some(id),
            _ => {
                warn!(vlan_id = %v, "Skipping invalid VLAN id");
                None
            }
        })
        .collect()
}

/// Parses `external:address.port` rules, e.g. `8080:192.168.50.10.80`.
fn parse_port_forwards(value: &Value) -> Vec<PortForward> {
    let rules: Vec<&str> = match value {
        Value::String(s) => s.split(',').collect(),
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };

    rules
        .into_iter()
        .map(str::trim)
        .filter(|rule| !rule.is_empty())
        .filter_map(|rule| {
            let parsed = parse_port_forward(rule);
            if parsed.is_none() {
                warn!(rule, "Skipping invalid port forward");
            }
            parsed
        })
        .collect()
}

fn parse_port_forward(rule: &str) -> Option<PortForward> {
    let (external, internal) = rule.split_once(':')?;
    let (address, port) = internal.rsplit_once('.')?;
    let address: std::net::Ipv4Addr = address.parse().ok()?;
    Some(PortForward {
        external_port: external.trim().parse().ok()?,
        address: address.to_string(),
        port: port.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::MemoryConfigStore;
    use serde_json::json;

    fn renderer() -> RouterOsRenderer {
        RouterOsRenderer::new(Arc::new(MemoryConfigStore::new()), RenderSettings::default()).unwrap()
    }

    fn hw() -> HardwareAddress {
        HardwareAddress::parse("aa-bb-cc-dd-ee-ff").unwrap()
    }

    #[tokio::test]
    async fn test_base_points_at_server() {
        let renderer = renderer();
        let payload = renderer.render_base("192.168.88.10:5000").await.unwrap();

        assert_eq!(payload.name, "base.rsc");
        assert!(payload.body.contains("http://192.168.88.10:5000/config/"));
        assert!(payload.body.contains("add name=vlan835 vlan-id=835 interface=ether1"));
        assert!(payload.body.contains("ranges=192.168.188.20-192.168.188.30"));
        assert!(payload.body.contains("time-zone-name=Europe/Rome"));
        assert_eq!(renderer.lookup_base().await.unwrap().body, payload.body);

        assert!(matches!(
            renderer.render_base("1.2.3.4\"; /system reset").await,
            Err(RenderError::InvalidParameters(_))
        ));
    }

    #[tokio::test]
    async fn test_personalized_network_and_pool() {
        let renderer = renderer();
        let params = NetworkParams {
            network_address_with_prefix: Some("10.20.30.1/24".into()),
            tunnel_username: Some("customer@isp".into()),
            tunnel_password: Some("pa\"ss".into()),
            ..NetworkParams::default()
        };
        let payload = renderer.render_personalized(&hw(), &params).await.unwrap();

        assert_eq!(payload.name, "AA:BB:CC:DD:EE:FF.rsc");
        let body = &payload.body;
        assert!(body.contains("/system identity set name=\"RouterBoard-AABBCCDDEEFF\""));
        assert!(body.contains("user=\"customer@isp\" password=\"pa\\\"ss\""));
        assert!(body.contains("[find interface=bridge] address=10.20.30.1/24"));
        assert!(body.contains("ranges=10.20.30.20-10.20.30.250"));
        assert!(body.contains("address=10.20.30.0/24 gateway=10.20.30.1"));
        assert!(!body.contains("/interface wireless"));
        assert!(!body.contains("/queue simple"));
    }

    #[tokio::test]
    async fn test_small_network_pool_stays_inside() {
        let renderer = renderer();
        let params = NetworkParams {
            network_address_with_prefix: Some("172.16.0.65/26".into()),
            ..NetworkParams::default()
        };
        let payload = renderer.render_personalized(&hw(), &params).await.unwrap();
        assert!(payload.body.contains("ranges=172.16.0.84-172.16.0.126"));
    }

    #[tokio::test]
    async fn test_additional_params() {
        let renderer = renderer();
        let mut params = NetworkParams::default();
        params.additional_params.insert("wifi_ssid".into(), json!("Casa"));
        params.additional_params.insert("wifi_password".into(), json!("s3cr$t"));
        params.additional_params.insert("vlan_ids".into(), json!("10, 20,abc"));
        params.additional_params.insert("bandwidth_limit".into(), json!("50M/10M"));
        params
            .additional_params
            .insert("port_forwards".into(), json!("8080:192.168.188.10.80,bogus"));

        let body = renderer.render_personalized(&hw(), &params).await.unwrap().body;
        assert!(body.contains("ssid=\"Casa\""));
        assert!(body.contains("wpa2-pre-shared-key=\"s3cr\\$t\""));
        assert!(body.contains("/interface vlan add name=vlan-10 vlan-id=10 interface=bridge"));
        assert!(body.contains("/interface vlan add name=vlan-20 vlan-id=20 interface=bridge"));
        assert!(!body.contains("vlan-abc"));
        assert!(body.contains("max-limit=50M/10M"));
        assert!(body.contains("dst-port=8080 to-addresses=192.168.188.10 to-ports=80"));
    }

    #[tokio::test]
    async fn test_invalid_lan_is_rejected() {
        let renderer = renderer();
        for lan in ["not-an-ip", "10.0.0.1/30"] {
            let params = NetworkParams {
                network_address_with_prefix: Some(lan.into()),
                ..NetworkParams::default()
            };
            assert!(matches!(
                renderer.render_personalized(&hw(), &params).await,
                Err(RenderError::InvalidParameters(_))
            ));
        }
        assert!(renderer.lookup(&hw()).await.is_none());
    }

    #[tokio::test]
    async fn test_rerender_overwrites_lookup() {
        let renderer = renderer();
        let first = NetworkParams {
            network_address_with_prefix: Some("192.168.1.1/24".into()),
            ..NetworkParams::default()
        };
        let second = NetworkParams {
            network_address_with_prefix: Some("192.168.2.1/24".into()),
            ..NetworkParams::default()
        };
        renderer.render_personalized(&hw(), &first).await.unwrap();
        let latest = renderer.render_personalized(&hw(), &second).await.unwrap();

        let found = renderer.lookup(&hw()).await.unwrap();
        assert_eq!(found.body, latest.body);
        assert!(found.body.contains("192.168.2.1/24"));

        let entries = renderer.list().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].hardware_address, Some(hw()));
        assert!(renderer.remove(&hw()).await);
        assert!(renderer.list().await.is_empty());
    }

    #[test]
    fn test_port_forward_parsing() {
        assert_eq!(
            parse_port_forward("2222:10.0.0.5.22"),
            Some(PortForward {
                external_port: 2222,
                address: "10.0.0.5".into(),
                port: 22,
            })
        );
        assert_eq!(parse_port_forward("2222:10.0.0.5"), None);
        assert_eq!(parse_port_forward("x:10.0.0.5.22"), None);
    }
}
