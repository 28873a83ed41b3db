//! ACL model.

use crate::net::{IpNetwork, ParseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Key prefix of ACL values.
pub const ACL_KEY_PREFIX: &str = "config/mock/v1/acls/";

/// Prefix of the derived ACL-to-interface binding keys.
pub const ACL_BINDING_KEY_PREFIX: &str = "config/mock/v1/acl/";

const ANY_IPV4: &str = "0.0.0.0/0";
const ANY_IPV6: &str = "::/0";

/// Returns the key of the ACL called `name`.
pub fn acl_key(name: &str) -> String {
    format!("{}{}", ACL_KEY_PREFIX, name)
}

/// Direction of an ACL binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclDirection {
    Ingress,
    Egress,
}

impl fmt::Display for AclDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingress => write!(f, "ingress"),
            Self::Egress => write!(f, "egress"),
        }
    }
}

impl FromStr for AclDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ingress" => Ok(Self::Ingress),
            "egress" => Ok(Self::Egress),
            _ => Err(format!("Unknown ACL direction: {}", s)),
        }
    }
}

/// Identity of one ACL-to-interface binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AclBinding {
    pub acl: String,
    pub direction: AclDirection,
    pub interface: String,
}

impl AclBinding {
    pub fn new(acl: impl Into<String>, direction: AclDirection, interface: impl Into<String>) -> Self {
        Self {
            acl: acl.into(),
            direction,
            interface: interface.into(),
        }
    }

    /// `config/mock/v1/acl/<acl>/interface/<direction>/<interface>`
    pub fn key(&self) -> String {
        format!(
            "{}{}/interface/{}/{}",
            ACL_BINDING_KEY_PREFIX, self.acl, self.direction, self.interface
        )
    }

    /// Parses a binding key.
    pub fn parse_key(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(ACL_BINDING_KEY_PREFIX)?;
        let (acl, rest) = rest.split_once("/interface/")?;
        let (direction, interface) = rest.split_once('/')?;
        if acl.is_empty() || interface.is_empty() || interface.contains('/') {
            return None;
        }
        Some(Self::new(acl, direction.parse().ok()?, interface))
    }
}

impl fmt::Display for AclBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.acl, self.direction, self.interface)
    }
}

/// Rule action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AclAction {
    #[default]
    Deny,
    Permit,
    Reflect,
}

/// L4 port ranges; zero bounds match any port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortRanges {
    #[serde(default)]
    pub source_lower: u16,
    #[serde(default)]
    pub source_upper: u16,
    #[serde(default)]
    pub destination_lower: u16,
    #[serde(default)]
    pub destination_upper: u16,
}

/// IP match of a rule. Empty networks match any address.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IpRule {
    #[serde(default)]
    pub source_network: String,
    #[serde(default)]
    pub destination_network: String,
    /// IP protocol number, 0 for any
    #[serde(default)]
    pub protocol: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<PortRanges>,
}

fn is_any_network(network: &str) -> bool {
    network.is_empty() || network == ANY_IPV4 || network == ANY_IPV6
}

fn equivalent_networks(a: &str, b: &str) -> bool {
    if is_any_network(a) && is_any_network(b) {
        return true;
    }
    match (a.parse::<IpNetwork>(), b.parse::<IpNetwork>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

impl IpRule {
    pub fn equivalent(&self, other: &IpRule) -> bool {
        equivalent_networks(&self.source_network, &other.source_network)
            && equivalent_networks(&self.destination_network, &other.destination_network)
            && self.protocol == other.protocol
            && self.ports.unwrap_or_default() == other.ports.unwrap_or_default()
    }

    fn validate(&self) -> Result<(), ParseError> {
        for network in [&self.source_network, &self.destination_network] {
            if !network.is_empty() {
                network.parse::<IpNetwork>()?;
            }
        }
        Ok(())
    }
}

/// One rule of an ACL.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AclRule {
    #[serde(default)]
    pub action: AclAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_rule: Option<IpRule>,
}

impl AclRule {
    pub fn equivalent(&self, other: &AclRule) -> bool {
        if self.action != other.action {
            return false;
        }
        match (&self.ip_rule, &other.ip_rule) {
            (None, None) => true,
            (Some(a), Some(b)) => a.equivalent(b),
            (Some(rule), None) | (None, Some(rule)) => rule.equivalent(&IpRule::default()),
        }
    }
}

/// Interfaces an ACL is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AclInterfaces {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress: Vec<String>,
}

/// Access control list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Acl {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<AclRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<AclInterfaces>,
}

impl Acl {
    pub fn new(name: impl Into<String>, rules: Vec<AclRule>) -> Self {
        Self {
            name: name.into(),
            rules,
            interfaces: None,
        }
    }

    pub fn with_ingress(mut self, interface: impl Into<String>) -> Self {
        self.interfaces
            .get_or_insert_with(AclInterfaces::default)
            .ingress
            .push(interface.into());
        self
    }

    pub fn with_egress(mut self, interface: impl Into<String>) -> Self {
        self.interfaces
            .get_or_insert_with(AclInterfaces::default)
            .egress
            .push(interface.into());
        self
    }

    /// Compares the rules only; bindings are carried by derived values.
    pub fn equivalent(&self, other: &Acl) -> bool {
        self.name == other.name
            && self.rules.len() == other.rules.len()
            && self
                .rules
                .iter()
                .zip(&other.rules)
                .all(|(a, b)| a.equivalent(b))
    }

    /// Validates the rules. Returns the offending field on error.
    pub fn validate_rules(&self) -> Result<(), (String, String)> {
        if self.rules.is_empty() {
            return Err(("rules".to_string(), "ACL has no rules".to_string()));
        }
        for (i, rule) in self.rules.iter().enumerate() {
            if let Some(ip_rule) = &rule.ip_rule {
                ip_rule
                    .validate()
                    .map_err(|e| (format!("rules[{}].ip_rule", i), e.to_string()))?;
            }
        }
        Ok(())
    }

    /// All bindings requested by the ACL.
    pub fn bindings(&self) -> Vec<AclBinding> {
        let Some(interfaces) = &self.interfaces else {
            return Vec::new();
        };
        let ingress = interfaces
            .ingress
            .iter()
            .map(|i| AclBinding::new(&self.name, AclDirection::Ingress, i));
        let egress = interfaces
            .egress
            .iter()
            .map(|i| AclBinding::new(&self.name, AclDirection::Egress, i));
        ingress.chain(egress).collect()
    }
}

/// Metadata kept for every configured ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AclMetadata {
    /// Index assigned by the device
    pub index: u32,
}

/// Value of a derived binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclBindingValue {
    pub binding: AclBinding,
}
