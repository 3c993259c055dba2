//! Device discovery.
//!
//! A [`DeviceLocator`] resolves a hardware address to the device's current
//! IP address on the local segment.

mod arp;
mod neighbor;

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DiscoveryError;
use crate::mac::HardwareAddress;

pub use arp::{ArpLocator, ArpLocatorConfig};
pub use neighbor::{parse_arp_scan, parse_neighbor_table};

/// Resolves hardware addresses to network addresses.
#[async_trait]
pub trait DeviceLocator: Send + Sync {
    /// Find the device, trying every strategy before reporting `NotFound`.
    async fn locate(
        &self,
        hardware_address: &HardwareAddress,
        timeout: Duration,
    ) -> Result<IpAddr, DiscoveryError>;
}
