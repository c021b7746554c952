//! Networking utilities for node bootstrap.
//!
//! This library provides helpers for:
//! - CIDR parsing and validation (IPv4 and IPv6)
//! - Overlay (VXLAN) transport port handling

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Empty input where a CIDR was required.
    #[error("CIDR cannot be empty")]
    EmptyCidr,

    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Invalid overlay port.
    #[error("invalid overlay port '{0}': must be an integer between 1 and 65535")]
    InvalidPort(String),
}

// ============================================================================
// CIDR
// ============================================================================

/// An IP network in CIDR notation.
///
/// The address is kept as written, so `10.0.0.5/24` displays unchanged;
/// use [`Cidr::network`] for the masked base address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    /// Address as given.
    pub address: IpAddr,

    /// Prefix length (e.g., 24 for /24).
    pub prefix_len: u8,
}

impl Cidr {
    /// Create a new CIDR, checking the prefix length against the address family.
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, NetworkError> {
        let max = max_prefix(address);
        if prefix_len > max {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds {}",
                prefix_len, max
            )));
        }
        Ok(Self {
            address,
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "172.30.0.0/16" or "fd00::/48").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(NetworkError::EmptyCidr);
        }

        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = IpAddr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        // Reject signs and leading zeros that `u8::from_str` would accept.
        if prefix_str.is_empty()
            || !prefix_str.bytes().all(|b| b.is_ascii_digit())
            || (prefix_str.len() > 1 && prefix_str.starts_with('0'))
        {
            return Err(NetworkError::InvalidPrefix(prefix_str.to_string()));
        }
        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Masked base address of the network.
    pub fn network(&self) -> IpAddr {
        mask(self.address, self.prefix_len)
    }

    /// Check if an address is within this network.
    pub fn contains(&self, addr: IpAddr) -> bool {
        if addr.is_ipv4() != self.address.is_ipv4() {
            return false;
        }
        mask(addr, self.prefix_len) == self.network()
    }

    /// Returns true for an IPv4 network.
    pub fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }
}

impl FromStr for Cidr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Validate that a string is a well-formed CIDR.
pub fn validate_cidr(s: &str) -> Result<Cidr, NetworkError> {
    Cidr::from_cidr(s)
}

fn max_prefix(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Mask an address to a prefix length.
fn mask(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from_be_bytes(v4.octets());
            let mask = if prefix_len == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix_len.min(32)))
            };
            IpAddr::from((bits & mask).to_be_bytes())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from_be_bytes(v6.octets());
            let mask = if prefix_len == 0 {
                0
            } else {
                u128::MAX << (128 - u32::from(prefix_len.min(128)))
            };
            IpAddr::from((bits & mask).to_be_bytes())
        }
    }
}

// ============================================================================
// Overlay transport
// ============================================================================

/// Default VXLAN port used by the hybrid overlay when none is configured.
pub const DEFAULT_OVERLAY_PORT: u16 = 4789;

/// Overlay transport port.
///
/// `None` means "not configured": the remote agent keeps its own default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlayPort(Option<u16>);

impl OverlayPort {
    /// A port explicitly set to `port`.
    pub fn custom(port: u16) -> Result<Self, NetworkError> {
        if port == 0 {
            return Err(NetworkError::InvalidPort(port.to_string()));
        }
        Ok(Self(Some(port)))
    }

    /// The configured port, if any.
    pub fn get(&self) -> Option<u16> {
        self.0
    }

    /// The port the overlay will actually use.
    pub fn effective(&self) -> u16 {
        self.0.unwrap_or(DEFAULT_OVERLAY_PORT)
    }
}

impl FromStr for OverlayPort {
    type Err = NetworkError;

    /// Parse a port; an empty string means "not configured".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self(None));
        }
        let port = s
            .parse::<u16>()
            .map_err(|_| NetworkError::InvalidPort(s.to_string()))?;
        Self::custom(port).map_err(|_| NetworkError::InvalidPort(s.to_string()))
    }
}

impl fmt::Display for OverlayPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(port) => write!(f, "{}", port),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_cidr() {
        let cidr = validate_cidr("172.30.0.0/16").unwrap();
        assert!(cidr.is_ipv4());
        assert_eq!(cidr.prefix_len, 16);
        assert_eq!(cidr.to_string(), "172.30.0.0/16");

        assert!(cidr.contains("172.30.12.1".parse().unwrap()));
        assert!(!cidr.contains("172.31.0.1".parse().unwrap()));
    }

    #[test]
    fn test_host_bits_are_kept() {
        let cidr = validate_cidr("10.132.1.5/24").unwrap();
        assert_eq!(cidr.to_string(), "10.132.1.5/24");
        assert_eq!(cidr.network(), "10.132.1.0".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_ipv6_cidr() {
        let cidr = validate_cidr("fd00:10:96::/112").unwrap();
        assert!(!cidr.is_ipv4());
        assert!(cidr.contains("fd00:10:96::1".parse().unwrap()));
        assert!(!cidr.contains("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_invalid_cidrs() {
        assert_eq!(validate_cidr(""), Err(NetworkError::EmptyCidr));
        assert!(matches!(
            validate_cidr("172.30.0.0"),
            Err(NetworkError::InvalidPrefix(_))
        ));
        assert!(matches!(
            validate_cidr("172.30.0/16"),
            Err(NetworkError::InvalidAddress(_))
        ));
        assert!(validate_cidr("172.30.0.0/33").is_err());
        assert!(validate_cidr("172.30.0.0/+8").is_err());
        assert!(validate_cidr("172.30.0.0/08").is_err());
        assert!(validate_cidr("fd00::/129").is_err());
        assert!(validate_cidr("0.0.0.0/0").is_ok());
    }

    #[test]
    fn test_overlay_port() {
        let unset: OverlayPort = "".parse().unwrap();
        assert_eq!(unset.get(), None);
        assert_eq!(unset.effective(), DEFAULT_OVERLAY_PORT);

        let custom: OverlayPort = "9898".parse().unwrap();
        assert_eq!(custom.get(), Some(9898));
        assert_eq!(custom.to_string(), "9898");

        assert!("0".parse::<OverlayPort>().is_err());
        assert!("70000".parse::<OverlayPort>().is_err());
        assert!("vxlan".parse::<OverlayPort>().is_err());
    }
}
