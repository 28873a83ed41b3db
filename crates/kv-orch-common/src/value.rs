//! Opaque value payloads and key helpers.
//!
//! The scheduler never inspects values itself. Every configuration item is
//! carried as a [`ValueRef`] and only the owning descriptor knows its concrete
//! type, which it recovers with [`downcast`].

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Payload of one configuration item (or of descriptor metadata).
///
/// Implemented for every `PartialEq + Debug + Send + Sync + 'static` type,
/// so model structs only need the usual derives.
pub trait Value: fmt::Debug + Send + Sync + 'static {
    /// Returns self as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Returns true if `other` has the same concrete type and compares equal.
    fn equals(&self, other: &dyn Value) -> bool;

    /// Returns the concrete type name (for logging and type-mismatch errors).
    fn type_name(&self) -> &'static str;

    /// Converts a shared handle into `Arc<dyn Any>` for typed downcasting.
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> Value for T
where
    T: PartialEq + fmt::Debug + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn equals(&self, other: &dyn Value) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| other == self)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Shared handle to a value.
pub type ValueRef = Arc<dyn Value>;

/// Shared handle to descriptor metadata.
pub type MetadataRef = Arc<dyn Value>;

/// Wraps a concrete value into a [`ValueRef`].
pub fn value_ref<T: Value>(value: T) -> ValueRef {
    Arc::new(value)
}

/// Returns the concrete value behind `value` if it has type `T`.
pub fn downcast<T: Value>(value: &ValueRef) -> Option<&T> {
    let inner: &dyn Value = &**value;
    inner.as_any().downcast_ref::<T>()
}

/// Converts a shared handle into a typed one, if the type matches.
pub fn downcast_arc<T: Value>(value: ValueRef) -> Option<Arc<T>> {
    value.into_any_arc().downcast::<T>().ok()
}

/// Returns true if both handles hold equal values (pointer equality first).
pub fn values_equal(a: &ValueRef, b: &ValueRef) -> bool {
    Arc::ptr_eq(a, b) || a.equals(&**b)
}

/// Origin of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ValueOrigin {
    /// Not known (e.g. retrieved value with no correlation yet)
    #[default]
    Unknown,
    /// Requested by a northbound data source
    FromNb,
    /// Created by the device itself and only reported back
    FromSb,
}

impl fmt::Display for ValueOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueOrigin::Unknown => write!(f, "UNKNOWN"),
            ValueOrigin::FromNb => write!(f, "NB"),
            ValueOrigin::FromSb => write!(f, "SB"),
        }
    }
}

/// Key paired with a value.
#[derive(Debug, Clone)]
pub struct KeyValuePair {
    /// Item key
    pub key: String,
    /// Item value
    pub value: ValueRef,
}

impl KeyValuePair {
    /// Creates a new pair.
    pub fn new(key: impl Into<String>, value: ValueRef) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Value as retrieved from (or correlated with) the device.
#[derive(Debug, Clone)]
pub struct KvWithMetadata {
    pub key: String,
    pub value: ValueRef,
    pub metadata: Option<MetadataRef>,
    pub origin: ValueOrigin,
}

impl KvWithMetadata {
    /// Creates a retrieved entry without metadata.
    pub fn new(key: impl Into<String>, value: ValueRef, origin: ValueOrigin) -> Self {
        Self {
            key: key.into(),
            value,
            metadata: None,
            origin,
        }
    }

    /// Attaches metadata.
    pub fn with_metadata(mut self, metadata: MetadataRef) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Builds a key from a model prefix and an item name.
pub fn key_with_prefix(prefix: &str, name: &str) -> String {
    format!("{}{}", prefix, name)
}

/// Strips the model prefix from a key, returning the item name.
pub fn strip_key_prefix<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Clone, PartialEq)]
    struct Port {
        name: String,
        mtu: u32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Vlan(u16);

    #[test]
    fn test_downcast() {
        let value = value_ref(Port {
            name: "eth0".to_string(),
            mtu: 1500,
        });

        let port = downcast::<Port>(&value).unwrap();
        assert_eq!(port.mtu, 1500);
        assert!(downcast::<Vlan>(&value).is_none());

        let typed = downcast_arc::<Port>(value.clone()).unwrap();
        assert_eq!(typed.name, "eth0");
        assert!(downcast_arc::<Vlan>(value).is_none());
    }

    #[test]
    fn test_value_equality() {
        let a = value_ref(Vlan(10));
        let b = value_ref(Vlan(10));
        let c = value_ref(Vlan(20));
        let d = value_ref(Port {
            name: "eth0".to_string(),
            mtu: 1500,
        });

        assert!(values_equal(&a, &b));
        assert!(!values_equal(&a, &c));
        assert!(!values_equal(&a, &d));
        assert!(values_equal(&d, &d.clone()));
    }

    #[test]
    fn test_type_name() {
        let value = value_ref(Vlan(1));
        assert!(value.type_name().ends_with("Vlan"));
    }

    #[test]
    fn test_key_prefix_helpers() {
        let key = key_with_prefix("config/if/", "memif0");
        assert_eq!(key, "config/if/memif0");
        assert_eq!(strip_key_prefix("config/if/", &key), Some("memif0"));
        assert_eq!(strip_key_prefix("config/acl/", &key), None);
    }

    #[test]
    fn test_origin_display() {
        assert_eq!(ValueOrigin::FromNb.to_string(), "NB");
        assert_eq!(ValueOrigin::FromSb.to_string(), "SB");
        assert_eq!(ValueOrigin::default(), ValueOrigin::Unknown);
    }
}
