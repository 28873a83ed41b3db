//! ACL and ACL-binding descriptors.

use super::types::{
    Acl, AclBinding, AclBindingValue, AclInterfaces, AclMetadata, AclDirection, ACL_KEY_PREFIX,
};
use crate::device::MockDevice;
use crate::interface::{interface_key, InterfaceMetadata, INTERFACE_DESCRIPTOR};
use kv_orch_common::{
    strip_key_prefix, value_ref, Dependency, Descriptor, KeyValuePair, KvError, KvResult,
    MetadataRegistry, TypedKv, ValueOrigin,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Name of the ACL descriptor (and of its metadata map).
pub const ACL_DESCRIPTOR: &str = "mock-acl";

/// Name of the ACL-binding descriptor.
pub const ACL_BINDING_DESCRIPTOR: &str = "mock-acl-binding";

/// Label of the dependency of a binding on its interface.
pub const INTERFACE_EXISTS: &str = "interface-exists";

/// Configures ACLs; bindings to interfaces are derived values.
#[derive(Debug, Clone)]
pub struct AclDescriptor {
    device: MockDevice,
}

impl AclDescriptor {
    pub fn new(device: MockDevice) -> Self {
        Self { device }
    }
}

impl Descriptor for AclDescriptor {
    type Value = Acl;
    type Metadata = AclMetadata;

    fn name(&self) -> &str {
        ACL_DESCRIPTOR
    }

    fn is_key_owned(&self, key: &str) -> bool {
        strip_key_prefix(ACL_KEY_PREFIX, key).is_some_and(|name| !name.is_empty() && !name.contains('/'))
    }

    fn nb_key_prefix(&self) -> Option<&str> {
        Some(ACL_KEY_PREFIX)
    }

    fn key_label(&self, key: &str) -> String {
        strip_key_prefix(ACL_KEY_PREFIX, key).unwrap_or(key).to_string()
    }

    fn equivalent(&self, _key: &str, old: &Acl, new: &Acl) -> bool {
        old.equivalent(new)
    }

    fn with_metadata(&self) -> bool {
        true
    }

    fn validate(&self, key: &str, acl: &Acl) -> KvResult<()> {
        if acl.name.is_empty() {
            return Err(KvError::invalid_value("ACL without name", ["name"]));
        }
        if self.key_label(key) != acl.name {
            return Err(KvError::invalid_value("ACL name does not match its key", ["name"]));
        }
        acl.validate_rules()
            .map_err(|(field, message)| KvError::invalid_value(message, [field]))
    }

    fn create(&self, _key: &str, acl: &Acl) -> KvResult<Option<AclMetadata>> {
        let index = self.device.create_acl(acl)?;
        tracing::debug!(acl = %acl.name, index, rules = acl.rules.len(), "ACL created");
        Ok(Some(AclMetadata { index }))
    }

    fn delete(&self, key: &str, acl: &Acl, metadata: Option<&AclMetadata>) -> KvResult<()> {
        let metadata = metadata.ok_or_else(|| KvError::internal(format!("missing metadata of {}", key)))?;
        self.device.delete_acl(metadata.index)?;
        tracing::debug!(acl = %acl.name, index = metadata.index, "ACL deleted");
        Ok(())
    }

    fn supports_update(&self) -> bool {
        true
    }

    fn update(
        &self,
        key: &str,
        _old: &Acl,
        new: &Acl,
        old_metadata: Option<&AclMetadata>,
    ) -> KvResult<Option<AclMetadata>> {
        let metadata = old_metadata.ok_or_else(|| KvError::internal(format!("missing metadata of {}", key)))?;
        self.device.update_acl(metadata.index, new)?;
        Ok(Some(*metadata))
    }

    fn retrieve(
        &self,
        _correlate: &[TypedKv<Acl, AclMetadata>],
    ) -> Option<KvResult<Vec<TypedKv<Acl, AclMetadata>>>> {
        let dumped = match self.device.dump_acls() {
            Ok(dumped) => dumped,
            Err(err) => return Some(Err(KvError::retrieve(ACL_DESCRIPTOR, err.to_string()))),
        };

        let mut interfaces: BTreeMap<String, AclInterfaces> = BTreeMap::new();
        for (acl, direction, intf) in self.device.bindings() {
            let entry = interfaces.entry(acl).or_default();
            match direction {
                AclDirection::Ingress => entry.ingress.push(intf),
                AclDirection::Egress => entry.egress.push(intf),
            }
        }

        let values = dumped
            .into_iter()
            .map(|entry| {
                let mut acl = entry.config;
                acl.interfaces = interfaces.remove(&acl.name);
                TypedKv {
                    key: super::acl_key(&acl.name),
                    value: Arc::new(acl),
                    metadata: Some(Arc::new(AclMetadata { index: entry.index })),
                    origin: ValueOrigin::Unknown,
                }
            })
            .collect();
        Some(Ok(values))
    }

    fn retrieve_dependencies(&self) -> Vec<String> {
        vec![INTERFACE_DESCRIPTOR.to_string()]
    }

    fn derived_values(&self, _key: &str, acl: &Acl) -> Vec<KeyValuePair> {
        acl.bindings()
            .into_iter()
            .map(|binding| KeyValuePair::new(binding.key(), value_ref(AclBindingValue { binding })))
            .collect()
    }
}

/// Attaches ACLs to interfaces.
///
/// ACL and interface indexes are resolved through the metadata registry when
/// the binding is applied.
#[derive(Debug, Clone)]
pub struct AclBindingDescriptor {
    device: MockDevice,
    metadata: MetadataRegistry,
}

impl AclBindingDescriptor {
    pub fn new(device: MockDevice, metadata: MetadataRegistry) -> Self {
        Self { device, metadata }
    }

    fn indexes(&self, binding: &AclBinding) -> KvResult<(u32, u32)> {
        let acl = self
            .metadata
            .lookup::<AclMetadata>(ACL_DESCRIPTOR, &binding.acl)
            .ok_or_else(|| KvError::internal(format!("no metadata for ACL {}", binding.acl)))?;
        let intf = self
            .metadata
            .lookup::<InterfaceMetadata>(INTERFACE_DESCRIPTOR, &binding.interface)
            .ok_or_else(|| KvError::internal(format!("no metadata for interface {}", binding.interface)))?;
        Ok((acl.index, intf.index))
    }
}

impl Descriptor for AclBindingDescriptor {
    type Value = AclBindingValue;
    type Metadata = ();

    fn name(&self) -> &str {
        ACL_BINDING_DESCRIPTOR
    }

    fn is_key_owned(&self, key: &str) -> bool {
        AclBinding::parse_key(key).is_some()
    }

    fn create(&self, _key: &str, value: &AclBindingValue) -> KvResult<Option<()>> {
        let (acl, intf) = self.indexes(&value.binding)?;
        self.device.bind_acl(acl, value.binding.direction, intf)?;
        tracing::debug!(binding = %value.binding, "ACL bound");
        Ok(None)
    }

    fn delete(&self, _key: &str, value: &AclBindingValue, _metadata: Option<&()>) -> KvResult<()> {
        let (acl, intf) = self.indexes(&value.binding)?;
        self.device.unbind_acl(acl, value.binding.direction, intf)?;
        tracing::debug!(binding = %value.binding, "ACL unbound");
        Ok(())
    }

    fn retrieve(
        &self,
        _correlate: &[TypedKv<AclBindingValue, ()>],
    ) -> Option<KvResult<Vec<TypedKv<AclBindingValue, ()>>>> {
        let values = self
            .device
            .bindings()
            .into_iter()
            .map(|(acl, direction, intf)| {
                let binding = AclBinding::new(acl, direction, intf);
                TypedKv {
                    key: binding.key(),
                    value: Arc::new(AclBindingValue { binding }),
                    metadata: None,
                    origin: ValueOrigin::FromNb,
                }
            })
            .collect();
        Some(Ok(values))
    }

    fn retrieve_dependencies(&self) -> Vec<String> {
        vec![ACL_DESCRIPTOR.to_string(), INTERFACE_DESCRIPTOR.to_string()]
    }

    fn dependencies(&self, _key: &str, value: &AclBindingValue) -> Vec<Dependency> {
        vec![Dependency::on_key(
            INTERFACE_EXISTS,
            interface_key(&value.binding.interface),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{AclAction, AclRule, IpRule};
    use crate::interface::{Interface, InterfaceType};
    use kv_orch_common::{downcast, DescriptorAdapter, KvDescriptor, MetadataMap};
    use pretty_assertions::assert_eq;

    fn permit_any() -> AclRule {
        AclRule {
            action: AclAction::Permit,
            ip_rule: Some(IpRule::default()),
        }
    }

    #[test]
    fn test_validate() {
        let descriptor = DescriptorAdapter::new(AclDescriptor::new(MockDevice::new()));
        let key = crate::acl::acl_key("acl0");

        assert!(descriptor
            .validate(&key, &value_ref(Acl::new("acl0", vec![permit_any()])))
            .is_ok());

        let err = descriptor
            .validate(&key, &value_ref(Acl::new("acl0", vec![])))
            .unwrap_err();
        assert_eq!(err.invalid_fields(), ["rules".to_string()]);

        let err = descriptor
            .validate(&key, &value_ref(Acl::new("acl9", vec![permit_any()])))
            .unwrap_err();
        assert_eq!(err.invalid_fields(), ["name".to_string()]);
    }

    #[test]
    fn test_derived_bindings() {
        let descriptor = DescriptorAdapter::new(AclDescriptor::new(MockDevice::new()));
        let acl = value_ref(
            Acl::new("acl0", vec![permit_any()])
                .with_ingress("memif0")
                .with_egress("memif1"),
        );
        let derived = descriptor.derived_values(&crate::acl::acl_key("acl0"), &acl);
        let keys: Vec<&str> = derived.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "config/mock/v1/acl/acl0/interface/ingress/memif0",
                "config/mock/v1/acl/acl0/interface/egress/memif1"
            ]
        );
        let binding = downcast::<AclBindingValue>(&derived[0].value).unwrap();
        assert_eq!(binding.binding.interface, "memif0");
    }

    #[test]
    fn test_binding_resolves_indexes_through_metadata() {
        let device = MockDevice::new();
        let registry = MetadataRegistry::new();
        let acls = MetadataMap::new(ACL_DESCRIPTOR);
        let interfaces = MetadataMap::new(INTERFACE_DESCRIPTOR);
        registry.register(&acls);
        registry.register(&interfaces);

        let descriptor = DescriptorAdapter::new(AclBindingDescriptor::new(device.clone(), registry));
        let binding = AclBinding::new("acl0", AclDirection::Ingress, "memif0");
        let value = value_ref(AclBindingValue {
            binding: binding.clone(),
        });

        // no metadata yet
        assert!(descriptor.create(&binding.key(), &value).is_err());

        let if_index = device
            .create_interface(&Interface::new("memif0", InterfaceType::Memif))
            .unwrap();
        let acl_index = device.create_acl(&Acl::new("acl0", vec![permit_any()])).unwrap();
        interfaces.put("memif0", value_ref(InterfaceMetadata { index: if_index }));
        acls.put("acl0", value_ref(AclMetadata { index: acl_index }));

        descriptor.create(&binding.key(), &value).unwrap();
        assert_eq!(
            device.bindings(),
            vec![("acl0".to_string(), AclDirection::Ingress, "memif0".to_string())]
        );

        let deps = descriptor.dependencies(&binding.key(), &value);
        assert_eq!(deps.len(), 1);
        assert!(deps[0].matches("config/mock/v1/interfaces/memif0"));

        descriptor.delete(&binding.key(), &value, None).unwrap();
        assert!(device.bindings().is_empty());
    }

    #[test]
    fn test_retrieve_rebuilds_interfaces() {
        let device = MockDevice::new();
        let if_index = device
            .create_interface(&Interface::new("memif0", InterfaceType::Memif))
            .unwrap();
        let acl_index = device.create_acl(&Acl::new("acl0", vec![permit_any()])).unwrap();
        device.bind_acl(acl_index, AclDirection::Egress, if_index).unwrap();

        let descriptor = AclDescriptor::new(device);
        let retrieved = descriptor.retrieve(&[]).unwrap().unwrap();
        assert_eq!(retrieved.len(), 1);
        assert_eq!(
            retrieved[0].value.interfaces,
            Some(AclInterfaces {
                ingress: vec![],
                egress: vec!["memif0".to_string()],
            })
        );
        assert_eq!(retrieved[0].metadata.as_deref(), Some(&AclMetadata { index: acl_index }));
    }
}
