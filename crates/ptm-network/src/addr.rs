//! Interface addresses.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Prefix length applied when a topology omits `subnet`.
pub const DEFAULT_PREFIX_LEN: u8 = 24;

/// MAC sentinel meaning "keep the kernel-assigned address".
pub const DEFAULT_MAC: &str = "default";

/// An address with its prefix length, e.g. `10.0.0.2/24`.
///
/// Serialized in topology files as `{"ip": "10.0.0.2", "subnet": "24"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpDef {
    /// The address.
    pub ip: IpAddr,
    /// Prefix length.
    #[serde(
        default = "default_prefix",
        serialize_with = "prefix_to_string",
        deserialize_with = "prefix_from_any"
    )]
    pub subnet: u8,
}

fn default_prefix() -> u8 {
    DEFAULT_PREFIX_LEN
}

fn prefix_to_string<S: Serializer>(prefix: &u8, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&prefix.to_string())
}

fn prefix_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(u8),
        Str(String),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Num(n) => Ok(n),
        Repr::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl IpDef {
    /// Create an address definition.
    #[must_use]
    pub const fn new(ip: IpAddr, subnet: u8) -> Self {
        Self { ip, subnet }
    }

    /// Maximum prefix length for this address family.
    #[must_use]
    pub const fn max_prefix(&self) -> u8 {
        match self.ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }

    /// Check the prefix length against the address family.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem.
    pub fn validate(&self) -> Result<(), String> {
        if self.subnet > self.max_prefix() {
            return Err(format!(
                "prefix length {} is too long for {}",
                self.subnet, self.ip
            ));
        }
        Ok(())
    }

    /// True when `other` lies in this address's subnet.
    #[must_use]
    pub fn contains(&self, other: IpAddr) -> bool {
        match (self.ip, other) {
            (IpAddr::V4(a), IpAddr::V4(b)) => {
                let mask = prefix_mask_u32(self.subnet);
                u32::from(a) & mask == u32::from(b) & mask
            }
            (IpAddr::V6(a), IpAddr::V6(b)) => {
                let mask = prefix_mask_u128(self.subnet);
                u128::from(a) & mask == u128::from(b) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_u32(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - u32::from(p)),
    }
}

fn prefix_mask_u128(prefix: u8) -> u128 {
    match prefix {
        0 => 0,
        p if p >= 128 => u128::MAX,
        p => u128::MAX << (128 - u32::from(p)),
    }
}

impl fmt::Display for IpDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.subnet)
    }
}

impl FromStr for IpDef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, subnet) = match s.split_once('/') {
            Some((ip, prefix)) => (
                ip,
                prefix
                    .parse::<u8>()
                    .map_err(|e| format!("invalid prefix in '{s}': {e}"))?,
            ),
            None => (s, DEFAULT_PREFIX_LEN),
        };
        let ip = ip
            .parse::<IpAddr>()
            .map_err(|e| format!("invalid address in '{s}': {e}"))?;
        let def = Self::new(ip, subnet);
        def.validate()?;
        Ok(def)
    }
}
