//! ARP-based device locator.
//!
//! Strategy order:
//! 1. `arp-scan --localnet --plain`
//! 2. ping sweep of the subnet to populate the kernel neighbor table, then
//!    `/proc/net/arp`, `ip neigh show` and `arp -a`
//!
//! A failing strategy (tool missing, non-zero exit, timeout) is logged and
//! the next one runs; `NotFound` is only reported after all of them.

use std::net::{IpAddr, Ipv4Addr};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::neighbor::{parse_arp_scan, parse_neighbor_table};
use super::DeviceLocator;
use crate::error::DiscoveryError;
use crate::mac::HardwareAddress;
use crate::net::Ipv4Cidr;

/// Default timeout for a single `arp-scan` run.
const DEFAULT_ARP_SCAN_TIMEOUT_SECS: u64 = 30;

/// Default per-host ping wait.
const DEFAULT_PING_TIMEOUT_SECS: u64 = 1;

/// Default concurrent pings during a sweep.
const DEFAULT_MAX_PARALLEL_PINGS: usize = 64;

/// Largest sweep we are willing to run (a /22).
const MAX_SWEEP_HOSTS: usize = 1022;

/// Settings for [`ArpLocator`].
#[derive(Debug, Clone)]
pub struct ArpLocatorConfig {
    /// Subnet to sweep.
    pub subnet: Ipv4Cidr,
    /// Interface passed to `arp-scan`, if any.
    pub interface: Option<String>,
    pub arp_scan_timeout: Duration,
    pub ping_timeout: Duration,
    pub max_parallel_pings: usize,
}

impl ArpLocatorConfig {
    /// Defaults for sweeping `subnet`.
    #[must_use]
    pub fn new(subnet: Ipv4Cidr) -> Self {
        Self {
            subnet,
            interface: None,
            arp_scan_timeout: Duration::from_secs(DEFAULT_ARP_SCAN_TIMEOUT_SECS),
            ping_timeout: Duration::from_secs(DEFAULT_PING_TIMEOUT_SECS),
            max_parallel_pings: DEFAULT_MAX_PARALLEL_PINGS,
        }
    }

    /// Set the `arp-scan` interface.
    #[must_use]
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }
}

/// Locates devices with `arp-scan`, falling back to a ping sweep.
#[derive(Clone)]
pub struct ArpLocator {
    config: ArpLocatorConfig,
}

impl ArpLocator {
    #[must_use]
    pub fn new(config: ArpLocatorConfig) -> Self {
        Self { config }
    }

    async fn scan_with_arp_scan(&self, target: &HardwareAddress, budget: Duration) -> Option<Ipv4Addr> {
        let mut cmd = Command::new("arp-scan");
        cmd.args(["--localnet", "--plain"]);
        if let Some(interface) = &self.config.interface {
            cmd.args(["--interface", interface.as_str()]);
        }
        cmd.kill_on_drop(true);

        let timeout = budget.min(self.config.arp_scan_timeout);
        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!("arp-scan not available, falling back to ping sweep: {e}");
                return None;
            }
            Err(_) => {
                warn!("arp-scan timeout after {}s", timeout.as_secs());
                return None;
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("arp-scan failed: {}", stderr.trim());
            return None;
        }

        let found = parse_arp_scan(&String::from_utf8_lossy(&output.stdout), target);
        if let Some(ip) = found {
            info!(%ip, hardware_address = %target, "Found device via arp-scan");
        }
        found
    }

    async fn ping_sweep(&self, deadline: Instant) {
        let hosts: Vec<Ipv4Addr> = self.config.subnet.hosts().take(MAX_SWEEP_HOSTS).collect();
        info!(
            subnet = %self.config.subnet,
            hosts = hosts.len(),
            "Using ping sweep + neighbor table fallback"
        );

        let permits = Arc::new(Semaphore::new(self.config.max_parallel_pings.max(1)));
        let wait = self.config.ping_timeout.as_secs().max(1).to_string();
        let mut pings = JoinSet::new();

        for host in hosts {
            let permits = Arc::clone(&permits);
            let wait = wait.clone();
            pings.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                let status = Command::new("ping")
                    .args(["-c", "1", "-W", wait.as_str()])
                    .arg(host.to_string())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .status()
                    .await;
                if let Err(e) = status {
                    debug!(%host, "ping failed to start: {e}");
                }
            });
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if tokio::time::timeout(remaining, async { while pings.join_next().await.is_some() {} })
            .await
            .is_err()
        {
            warn!("Ping sweep cut short by discovery timeout");
            pings.abort_all();
        }
    }

    async fn check_neighbor_table(&self, target: &HardwareAddress) -> Option<Ipv4Addr> {
        match tokio::fs::read_to_string("/proc/net/arp").await {
            Ok(table) => {
                if let Some(ip) = parse_neighbor_table(&table, target) {
                    info!(%ip, hardware_address = %target, "Found device via /proc/net/arp");
                    return Some(ip);
                }
            }
            Err(e) => debug!("/proc/net/arp unavailable: {e}"),
        }

        for (program, args) in [("ip", &["neigh", "show"][..]), ("arp", &["-a"][..])] {
            let mut cmd = Command::new(program);
            cmd.args(args).kill_on_drop(true);
            match tokio::time::timeout(Duration::from_secs(10), cmd.output()).await {
                Ok(Ok(output)) if output.status.success() => {
                    let table = String::from_utf8_lossy(&output.stdout);
                    if let Some(ip) = parse_neighbor_table(&table, target) {
                        info!(%ip, hardware_address = %target, "Found device via {program}");
                        return Some(ip);
                    }
                }
                Ok(Ok(_)) => debug!("{program} exited non-zero"),
                Ok(Err(e)) => debug!("{program} unavailable: {e}"),
                Err(_) => debug!("{program} timed out"),
            }
        }
        None
    }
}

#[async_trait]
impl DeviceLocator for ArpLocator {
    async fn locate(
        &self,
        hardware_address: &HardwareAddress,
        timeout: Duration,
    ) -> Result<IpAddr, DiscoveryError> {
        let start = Instant::now();
        let deadline = start + timeout;
        info!(
            subnet = %self.config.subnet,
            hardware_address = %hardware_address,
            "Scanning network for device"
        );

        if let Some(ip) = self.scan_with_arp_scan(hardware_address, timeout).await {
            return Ok(IpAddr::V4(ip));
        }

        // the sweep may already have happened on a previous attempt
        if let Some(ip) = self.check_neighbor_table(hardware_address).await {
            return Ok(IpAddr::V4(ip));
        }

        if Instant::now() >= deadline {
            return Err(DiscoveryError::ScanTimeout(timeout.as_secs()));
        }
        self.ping_sweep(deadline).await;

        match self.check_neighbor_table(hardware_address).await {
            Some(ip) => Ok(IpAddr::V4(ip)),
            None if Instant::now() >= deadline => Err(DiscoveryError::ScanTimeout(timeout.as_secs())),
            None => {
                debug!(
                    elapsed_secs = start.elapsed().as_secs(),
                    "All discovery strategies exhausted"
                );
                Err(DiscoveryError::NotFound)
            }
        }
    }
}
