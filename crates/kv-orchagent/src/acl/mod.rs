//! Access control lists of the mock device.
//!
//! An ACL is configured under `config/mock/v1/acls/<name>`. Each interface it
//! lists is turned into a derived binding value:
//!
//! ```text
//! config/mock/v1/acls/acl0
//!     └── config/mock/v1/acl/acl0/interface/ingress/memif0  ──depends on──►  config/mock/v1/interfaces/memif0
//! ```
//!
//! Bindings wait in the pending cache until their interface exists, and are
//! removed before the interface goes away.

mod descriptor;
mod types;

pub use descriptor::{
    AclBindingDescriptor, AclDescriptor, ACL_BINDING_DESCRIPTOR, ACL_DESCRIPTOR, INTERFACE_EXISTS,
};
pub use types::{
    acl_key, Acl, AclAction, AclBinding, AclBindingValue, AclDirection, AclInterfaces, AclMetadata,
    AclRule, IpRule, PortRanges, ACL_BINDING_KEY_PREFIX, ACL_KEY_PREFIX,
};
