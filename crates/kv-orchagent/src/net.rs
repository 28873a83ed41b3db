//! MAC address and IP network parsing used by the model validators.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Error parsing a network type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed hardware address {0:?}")]
    InvalidMacAddress(String),

    #[error("malformed IP network {0:?}")]
    InvalidIpNetwork(String),
}

/// Hardware address of an interface, written as six two-digit hex groups
/// separated by `:` or `-`.
///
/// ```
/// use kv_orchagent::net::MacAddress;
///
/// let mac: MacAddress = "02-FE-00-00-00-01".parse().unwrap();
/// assert_eq!(mac.to_string(), "02:fe:00:00:00:01");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn octets(self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, octet) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", octet)?;
        }
        Ok(())
    }
}

impl FromStr for MacAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidMacAddress(s.to_string());
        let mut octets = [0u8; 6];
        let mut groups = s.split([':', '-']);
        for octet in octets.iter_mut() {
            let group = groups.next().filter(|g| g.len() == 2).ok_or_else(invalid)?;
            *octet = u8::from_str_radix(group, 16).map_err(|_| invalid())?;
        }
        if groups.next().is_some() {
            return Err(invalid());
        }
        Ok(MacAddress(octets))
    }
}

/// An IP network in CIDR notation (10.0.0.0/24, 2001:db8::/32).
///
/// A bare address is accepted as a host network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpNetwork {
    address: IpAddr,
    prefix_len: u8,
}

impl IpNetwork {
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, ParseError> {
        let max_len = if address.is_ipv4() { 32 } else { 128 };
        if prefix_len > max_len {
            return Err(ParseError::InvalidIpNetwork(format!("{}/{} (max /{})", address, prefix_len, max_len)));
        }
        Ok(IpNetwork { address, prefix_len })
    }

    pub const fn address(&self) -> IpAddr {
        self.address
    }

    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Returns true for 0.0.0.0/0 and ::/0.
    pub fn is_any(&self) -> bool {
        self.prefix_len == 0 && self.address.is_unspecified()
    }
}

impl fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpNetwork {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidIpNetwork(s.to_string());
        match s.rsplit_once('/') {
            Some((addr, len)) => {
                let address: IpAddr = addr.parse().map_err(|_| invalid())?;
                let prefix_len: u8 = len.parse().map_err(|_| invalid())?;
                IpNetwork::new(address, prefix_len)
            }
            None => {
                let address: IpAddr = s.parse().map_err(|_| invalid())?;
                let prefix_len = if address.is_ipv4() { 32 } else { 128 };
                IpNetwork::new(address, prefix_len)
            }
        }
    }
}
