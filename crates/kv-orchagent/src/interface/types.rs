//! Interface model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Key prefix of interface values.
pub const INTERFACE_KEY_PREFIX: &str = "config/mock/v1/interfaces/";

/// Interface names longer than this are rejected.
pub const INTERFACE_NAME_LIMIT: usize = 15;

/// Returns the key of the interface called `name`.
pub fn interface_key(name: &str) -> String {
    format!("{}{}", INTERFACE_KEY_PREFIX, name)
}

/// Interface type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterfaceType {
    #[default]
    UndefinedType,
    SoftwareLoopback,
    Ethernet,
    Memif,
    Tap,
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UndefinedType => write!(f, "UNDEFINED_TYPE"),
            Self::SoftwareLoopback => write!(f, "SOFTWARE_LOOPBACK"),
            Self::Ethernet => write!(f, "ETHERNET"),
            Self::Memif => write!(f, "MEMIF"),
            Self::Tap => write!(f, "TAP"),
        }
    }
}

/// Memif link settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemifLink {
    #[serde(default)]
    pub master: bool,
    #[serde(default)]
    pub id: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub socket_filename: String,
}

/// Interface configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(rename = "type", default)]
    pub if_type: InterfaceType,
    #[serde(default)]
    pub enabled: bool,
    /// MAC address; empty means assigned by the device
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phys_address: String,
    /// 0 means the device default
    #[serde(default)]
    pub mtu: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memif: Option<MemifLink>,
}

impl Interface {
    pub fn new(name: impl Into<String>, if_type: InterfaceType) -> Self {
        Self {
            name: name.into(),
            if_type,
            enabled: true,
            ..Default::default()
        }
    }

    pub fn with_phys_address(mut self, mac: impl Into<String>) -> Self {
        self.phys_address = mac.into();
        self
    }

    pub fn with_ip(mut self, network: impl Into<String>) -> Self {
        self.ip_addresses.push(network.into());
        self
    }

    pub fn with_memif(mut self, memif: MemifLink) -> Self {
        self.memif = Some(memif);
        self
    }

    /// Returns true if both values describe the same interface.
    ///
    /// MAC addresses compare case-insensitively and an empty new MAC or a
    /// zero new MTU mean "unspecified". IP addresses compare as sets.
    pub fn equivalent(&self, new: &Interface) -> bool {
        if self.name != new.name
            || self.if_type != new.if_type
            || self.enabled != new.enabled
            || self.memif != new.memif
        {
            return false;
        }
        if new.mtu != 0 && self.mtu != new.mtu {
            return false;
        }
        if !new.phys_address.is_empty()
            && !self.phys_address.eq_ignore_ascii_case(&new.phys_address)
        {
            return false;
        }
        let old_ips: BTreeSet<&str> = self.ip_addresses.iter().map(String::as_str).collect();
        let new_ips: BTreeSet<&str> = new.ip_addresses.iter().map(String::as_str).collect();
        old_ips == new_ips
    }

    /// Returns true if switching from `self` to `new` needs a re-create.
    pub fn needs_recreate(&self, new: &Interface) -> bool {
        self.if_type != new.if_type || self.memif != new.memif
    }
}

/// Metadata kept for every configured interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceMetadata {
    /// Index assigned by the device
    pub index: u32,
}
