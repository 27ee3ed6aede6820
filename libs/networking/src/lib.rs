//! Networking utilities shared by the PROXY protocol crates.
//!
//! This library provides:
//! - IP prefix (subnet) parsing from CIDR notation
//! - Prefix masking and containment checks for IPv4 and IPv6

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),
}

/// Bit width of an IPv4 address.
pub const IPV4_BITS: u8 = 32;

/// Bit width of an IPv6 address.
pub const IPV6_BITS: u8 = 128;

/// IP prefix (network address plus prefix length).
///
/// The address is always stored masked to the prefix, so two prefixes
/// describing the same network compare equal regardless of how they
/// were written (`10.1.2.3/8` and `10.0.0.0/8` are the same prefix).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpPrefix {
    /// Base address of the prefix.
    address: IpAddr,

    /// Prefix length (e.g., 24 for /24).
    prefix_len: u8,
}

impl IpPrefix {
    /// Create a new prefix, masking `address` to `prefix_len` bits.
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, NetworkError> {
        let max = bit_width(&address);
        if prefix_len > max {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds {}",
                prefix_len, max
            )));
        }

        Ok(Self {
            address: mask(address, prefix_len),
            prefix_len,
        })
    }

    /// Prefix covering exactly one address.
    pub fn host(address: IpAddr) -> Self {
        Self {
            prefix_len: bit_width(&address),
            address,
        }
    }

    /// Parse from CIDR notation (e.g., "10.0.0.0/8" or "2001:db8::/32").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.trim().split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = IpAddr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Network address (already masked).
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// Prefix length in bits.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Bit width of the address family (32 or 128).
    pub fn bits(&self) -> u8 {
        bit_width(&self.address)
    }

    /// Returns true for IPv4 prefixes.
    pub fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    /// Check if an address is within this prefix.
    ///
    /// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) match IPv4 prefixes.
    pub fn contains(&self, addr: IpAddr) -> bool {
        let addr = match (self.address, addr) {
            (IpAddr::V4(_), IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => return false,
            },
            (IpAddr::V6(_), IpAddr::V4(_)) => return false,
            _ => addr,
        };
        mask(addr, self.prefix_len) == self.address
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

impl Serialize for IpPrefix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpPrefix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_cidr(&s).map_err(serde::de::Error::custom)
    }
}

fn bit_width(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => IPV4_BITS,
        IpAddr::V6(_) => IPV6_BITS,
    }
}

/// Mask an address to a prefix length.
fn mask(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => IpAddr::V4(mask_ipv4(v4, prefix_len)),
        IpAddr::V6(v6) => IpAddr::V6(mask_ipv6(v6, prefix_len)),
    }
}

fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let bits = u32::from_be_bytes(addr.octets());
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= IPV4_BITS {
        u32::MAX
    } else {
        u32::MAX << (IPV4_BITS - prefix_len)
    };
    Ipv4Addr::from((bits & mask).to_be_bytes())
}

fn mask_ipv6(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let bits = u128::from_be_bytes(addr.octets());
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= IPV6_BITS {
        u128::MAX
    } else {
        u128::MAX << (IPV6_BITS - prefix_len)
    };
    Ipv6Addr::from((bits & mask).to_be_bytes())
}
