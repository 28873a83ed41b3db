//! Interface descriptor.

use super::types::{Interface, InterfaceMetadata, InterfaceType, INTERFACE_KEY_PREFIX, INTERFACE_NAME_LIMIT};
use crate::device::MockDevice;
use crate::net::{IpNetwork, MacAddress};
use kv_orch_common::{strip_key_prefix, Descriptor, KvError, KvResult, TypedKv, ValueOrigin};
use std::sync::Arc;

/// Name of the interface descriptor (and of its metadata map).
pub const INTERFACE_DESCRIPTOR: &str = "mock-interface";

/// Configures interfaces on the device.
#[derive(Debug, Clone)]
pub struct InterfaceDescriptor {
    device: MockDevice,
}

impl InterfaceDescriptor {
    pub fn new(device: MockDevice) -> Self {
        Self { device }
    }

    fn index(&self, key: &str, metadata: Option<&InterfaceMetadata>) -> KvResult<u32> {
        metadata
            .map(|m| m.index)
            .ok_or_else(|| KvError::internal(format!("missing metadata of {}", key)))
    }
}

impl Descriptor for InterfaceDescriptor {
    type Value = Interface;
    type Metadata = InterfaceMetadata;

    fn name(&self) -> &str {
        INTERFACE_DESCRIPTOR
    }

    fn is_key_owned(&self, key: &str) -> bool {
        strip_key_prefix(INTERFACE_KEY_PREFIX, key).is_some_and(|name| !name.is_empty() && !name.contains('/'))
    }

    fn nb_key_prefix(&self) -> Option<&str> {
        Some(INTERFACE_KEY_PREFIX)
    }

    fn key_label(&self, key: &str) -> String {
        strip_key_prefix(INTERFACE_KEY_PREFIX, key)
            .unwrap_or(key)
            .to_string()
    }

    fn equivalent(&self, _key: &str, old: &Interface, new: &Interface) -> bool {
        old.equivalent(new)
    }

    fn with_metadata(&self) -> bool {
        true
    }

    fn validate(&self, key: &str, intf: &Interface) -> KvResult<()> {
        if intf.name.is_empty() {
            return Err(KvError::invalid_value("interface without name", ["name"]));
        }
        if intf.name.len() > INTERFACE_NAME_LIMIT {
            return Err(KvError::invalid_value(
                format!("interface name exceeds {} characters", INTERFACE_NAME_LIMIT),
                ["name"],
            ));
        }
        if self.key_label(key) != intf.name {
            return Err(KvError::invalid_value("interface name does not match its key", ["name"]));
        }
        if intf.if_type == InterfaceType::UndefinedType {
            return Err(KvError::invalid_value("interface without type", ["type"]));
        }
        if intf.memif.is_some() && intf.if_type != InterfaceType::Memif {
            return Err(KvError::invalid_value("memif link on a non-memif interface", ["memif"]));
        }
        if !intf.phys_address.is_empty() && intf.phys_address.parse::<MacAddress>().is_err() {
            return Err(KvError::invalid_value(
                format!("invalid MAC address {}", intf.phys_address),
                ["phys_address"],
            ));
        }
        if let Some(ip) = intf.ip_addresses.iter().find(|ip| ip.parse::<IpNetwork>().is_err()) {
            return Err(KvError::invalid_value(format!("invalid IP address {}", ip), ["ip_addresses"]));
        }
        Ok(())
    }

    fn create(&self, _key: &str, intf: &Interface) -> KvResult<Option<InterfaceMetadata>> {
        let index = self.device.create_interface(intf)?;
        tracing::debug!(interface = %intf.name, index, "interface created");
        Ok(Some(InterfaceMetadata { index }))
    }

    fn delete(&self, key: &str, intf: &Interface, metadata: Option<&InterfaceMetadata>) -> KvResult<()> {
        let index = self.index(key, metadata)?;
        self.device.delete_interface(index)?;
        tracing::debug!(interface = %intf.name, index, "interface deleted");
        Ok(())
    }

    fn supports_update(&self) -> bool {
        true
    }

    fn update(
        &self,
        key: &str,
        _old: &Interface,
        new: &Interface,
        old_metadata: Option<&InterfaceMetadata>,
    ) -> KvResult<Option<InterfaceMetadata>> {
        let index = self.index(key, old_metadata)?;
        self.device.update_interface(index, new)?;
        Ok(Some(InterfaceMetadata { index }))
    }

    fn update_with_recreate(
        &self,
        _key: &str,
        old: &Interface,
        new: &Interface,
        _metadata: Option<&InterfaceMetadata>,
    ) -> bool {
        old.needs_recreate(new)
    }

    fn retrieve(
        &self,
        _correlate: &[TypedKv<Interface, InterfaceMetadata>],
    ) -> Option<KvResult<Vec<TypedKv<Interface, InterfaceMetadata>>>> {
        let dumped = match self.device.dump_interfaces() {
            Ok(dumped) => dumped,
            Err(err) => return Some(Err(KvError::retrieve(INTERFACE_DESCRIPTOR, err.to_string()))),
        };
        let values = dumped
            .into_iter()
            .map(|entry| TypedKv {
                key: super::interface_key(&entry.config.name),
                value: Arc::new(entry.config),
                metadata: Some(Arc::new(InterfaceMetadata { index: entry.index })),
                origin: if entry.external {
                    ValueOrigin::FromSb
                } else {
                    ValueOrigin::Unknown
                },
            })
            .collect();
        Some(Ok(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{interface_key, MemifLink};
    use kv_orch_common::{value_ref, DescriptorAdapter, KvDescriptor};
    use pretty_assertions::assert_eq;

    fn descriptor() -> (DescriptorAdapter<InterfaceDescriptor>, MockDevice) {
        let device = MockDevice::new();
        (DescriptorAdapter::new(InterfaceDescriptor::new(device.clone())), device)
    }

    fn invalid_fields(result: KvResult<()>) -> Vec<String> {
        result.unwrap_err().invalid_fields().to_vec()
    }

    #[test]
    fn test_key_ownership() {
        let (descriptor, _) = descriptor();
        assert!(descriptor.is_key_owned("config/mock/v1/interfaces/memif0"));
        assert!(!descriptor.is_key_owned("config/mock/v1/interfaces/"));
        assert!(!descriptor.is_key_owned("config/mock/v1/acls/acl0"));
        assert_eq!(descriptor.key_label("config/mock/v1/interfaces/memif0"), "memif0");
    }

    #[test]
    fn test_validate() {
        let (descriptor, _) = descriptor();
        let key = interface_key("memif0");

        let valid = Interface::new("memif0", InterfaceType::Memif).with_phys_address("aa:bb:cc:dd:ee:ff");
        assert!(descriptor.validate(&key, &value_ref(valid)).is_ok());

        let untyped = Interface::new("memif0", InterfaceType::UndefinedType);
        assert_eq!(invalid_fields(descriptor.validate(&key, &value_ref(untyped))), vec!["type"]);

        let long_name = "x".repeat(16);
        let too_long = Interface::new(long_name.clone(), InterfaceType::Tap);
        assert_eq!(
            invalid_fields(descriptor.validate(&interface_key(&long_name), &value_ref(too_long))),
            vec!["name"]
        );

        let bad_mac = Interface::new("memif0", InterfaceType::Memif).with_phys_address("zz");
        assert_eq!(
            invalid_fields(descriptor.validate(&key, &value_ref(bad_mac))),
            vec!["phys_address"]
        );

        let bad_link = Interface::new("memif0", InterfaceType::Tap).with_memif(MemifLink::default());
        assert_eq!(invalid_fields(descriptor.validate(&key, &value_ref(bad_link))), vec!["memif"]);

        let mismatch = Interface::new("memif1", InterfaceType::Memif);
        assert_eq!(invalid_fields(descriptor.validate(&key, &value_ref(mismatch))), vec!["name"]);
    }

    #[test]
    fn test_create_update_delete_with_metadata() {
        let (descriptor, device) = descriptor();
        let key = interface_key("tap0");
        let intf = value_ref(Interface::new("tap0", InterfaceType::Tap));

        let metadata = descriptor.create(&key, &intf).unwrap();
        let index = device.interface("tap0").unwrap().index;
        assert_eq!(
            metadata.as_ref().and_then(kv_orch_common::downcast::<InterfaceMetadata>),
            Some(&InterfaceMetadata { index })
        );

        let mut changed = Interface::new("tap0", InterfaceType::Tap);
        changed.mtu = 1400;
        let changed = value_ref(changed);
        assert!(!descriptor.update_with_recreate(&key, &intf, &changed, metadata.as_ref()));
        descriptor.update(&key, &intf, &changed, metadata.as_ref()).unwrap();
        assert_eq!(device.interface("tap0").unwrap().config.mtu, 1400);

        descriptor.delete(&key, &changed, metadata.as_ref()).unwrap();
        assert!(device.interface("tap0").is_none());
        assert!(descriptor.delete(&key, &changed, None).is_err());
    }

    #[test]
    fn test_retrieve_marks_external_interfaces() {
        let (descriptor, device) = descriptor();
        device
            .create_interface(&Interface::new("memif0", InterfaceType::Memif))
            .unwrap();
        device.add_external_interface(Interface::new("loop0", InterfaceType::SoftwareLoopback));

        let retrieved = descriptor.retrieve(&[]).unwrap().unwrap();
        let origins: Vec<(String, ValueOrigin)> =
            retrieved.iter().map(|kv| (kv.key.clone(), kv.origin)).collect();
        assert_eq!(
            origins,
            vec![
                (interface_key("loop0"), ValueOrigin::FromSb),
                (interface_key("memif0"), ValueOrigin::Unknown),
            ]
        );
        assert!(retrieved.iter().all(|kv| kv.metadata.is_some()));
    }
}
