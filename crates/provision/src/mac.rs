//! Hardware (link-layer) address handling.
//!
//! Devices are identified only by their MAC. Every address entering the
//! system goes through [`HardwareAddress::parse`], so comparisons and map
//! lookups always operate on the canonical value.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Error returned when a string is not a usable hardware address.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid MAC address format: {0}")]
pub struct InvalidHardwareAddress(pub String);

/// A 48-bit hardware address, displayed as `AA:BB:CC:DD:EE:FF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HardwareAddress([u8; 6]);

impl HardwareAddress {
    /// Parse a MAC written with `:`, `-` or no separators, in any case.
    ///
    /// A separator, when present, must sit on every octet boundary and be
    /// the same throughout.
    pub fn parse(input: &str) -> Result<Self, InvalidHardwareAddress> {
        let invalid = || InvalidHardwareAddress(input.to_string());
        let trimmed = input.trim();

        let groups: Vec<&str> = match trimmed.find([':', '-']) {
            Some(at) => {
                let separator = trimmed[at..].chars().next().ok_or_else(invalid)?;
                trimmed.split(separator).collect()
            }
            None if trimmed.len() == 12 && trimmed.is_ascii() => {
                (0..6).map(|i| &trimmed[i * 2..i * 2 + 2]).collect()
            }
            None => return Err(invalid()),
        };

        if groups.len() != 6
            || groups
                .iter()
                .any(|g| g.len() != 2 || !g.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(invalid());
        }

        let mut octets = [0u8; 6];
        for (octet, group) in octets.iter_mut().zip(&groups) {
            *octet = u8::from_str_radix(group, 16).map_err(|_| invalid())?;
        }
        Ok(Self(octets))
    }

    /// Raw octets.
    #[must_use]
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Upper-case hex without separators (`AABBCCDDEEFF`), used in device identities.
    #[must_use]
    pub fn compact(&self) -> String {
        self.0.iter().map(|b| format!("{b:02X}")).collect()
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for HardwareAddress {
    type Err = InvalidHardwareAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for HardwareAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HardwareAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
