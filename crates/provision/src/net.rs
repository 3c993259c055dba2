//! IPv4 helpers shared by discovery and rendering.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use thiserror::Error;
use tracing::{info, warn};

/// Error parsing an `address/prefix` string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid IPv4 address with prefix: {0}")]
pub struct InvalidCidr(pub String);

/// An interface address together with its prefix length, e.g. `192.168.50.1/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    address: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    /// Build from parts; `prefix` must be at most 32.
    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self, InvalidCidr> {
        if prefix > 32 {
            return Err(InvalidCidr(format!("{address}/{prefix}")));
        }
        Ok(Self { address, prefix })
    }

    /// Parse `a.b.c.d/n`; a bare address gets a /24.
    pub fn parse(input: &str) -> Result<Self, InvalidCidr> {
        let input = input.trim();
        let (addr, prefix) = match input.split_once('/') {
            Some((addr, prefix)) => (
                addr,
                prefix
                    .parse::<u8>()
                    .map_err(|_| InvalidCidr(input.to_string()))?,
            ),
            None => (input, 24),
        };
        let address = addr
            .parse::<Ipv4Addr>()
            .map_err(|_| InvalidCidr(input.to_string()))?;
        Self::new(address, prefix).map_err(|_| InvalidCidr(input.to_string()))
    }

    #[must_use]
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    #[must_use]
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    #[must_use]
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask_bits())
    }

    /// Network address (host bits cleared).
    #[must_use]
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & self.mask_bits())
    }

    /// Address at `offset` inside the network, if it fits.
    #[must_use]
    pub fn host(&self, offset: u32) -> Option<Ipv4Addr> {
        if offset >= self.size() {
            return None;
        }
        Some(Ipv4Addr::from(u32::from(self.network()) + offset))
    }

    /// Usable host addresses (network and broadcast excluded for prefixes < 31).
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let base = u32::from(self.network());
        let size = self.size();
        let (first, last) = if self.prefix >= 31 { (0, size) } else { (1, size - 1) };
        (first..last).map(move |offset| Ipv4Addr::from(base + offset))
    }

    fn size(&self) -> u32 {
        // /0 would overflow; clamp to the full range
        1u32.checked_shl(32 - u32::from(self.prefix)).unwrap_or(u32::MAX)
    }

    fn mask_bits(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        }
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = InvalidCidr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Detect the address of the interface used for outbound traffic.
///
/// Connecting a UDP socket sends nothing; it only selects a route. Falls back
/// to loopback when no route exists.
pub async fn detect_local_address() -> IpAddr {
    let detected = async {
        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect("8.8.8.8:80").await?;
        Ok::<_, std::io::Error>(socket.local_addr()?.ip())
    }
    .await;

    match detected {
        Ok(ip) => {
            info!(%ip, "Detected server IP");
            ip
        }
        Err(e) => {
            warn!("Error detecting server IP: {e}");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}
