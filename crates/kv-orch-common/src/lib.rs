//! Common KV scheduler abstractions.
//!
//! This crate provides the types shared by the scheduler and by the
//! descriptors plugged into it:
//!
//! - [`KvDescriptor`] / [`Descriptor`]: lifecycle contract of one kind of
//!   configuration item
//! - [`ValueRef`]: opaque, type-erased configuration value
//! - [`ValueState`] / [`BaseValueStatus`]: per-key status reporting
//! - [`MetadataMap`] / [`MetadataRegistry`]: metadata index exposed read-only
//!   to descriptors
//! - [`PendingCache`]: values waiting for unmet dependencies
//! - [`ChangeQueue`]: per-source coalescing of northbound intents
//! - [`TxnOptions`] / [`RecordedTxn`]: transaction options and history
//!
//! # Architecture
//!
//! 1. Northbound sources push key intents to the orchestrator
//! 2. The orchestrator merges them and commits a transaction
//! 3. The scheduler builds the dependency graph from descriptor declarations
//! 4. Descriptors apply Create/Update/Delete against the device
//! 5. Per-key status is published to watchers
//!
//! # Example
//!
//! ```ignore
//! use kv_orch_common::{Descriptor, DescriptorAdapter, KvResult};
//!
//! struct VlanDescriptor;
//!
//! impl Descriptor for VlanDescriptor {
//!     type Value = Vlan;
//!     type Metadata = ();
//!
//!     fn name(&self) -> &str { "vlan" }
//!     fn is_key_owned(&self, key: &str) -> bool { key.starts_with("config/vlan/") }
//!     fn create(&self, _key: &str, vlan: &Vlan) -> KvResult<Option<()>> { ... }
//!     fn delete(&self, _key: &str, vlan: &Vlan, _md: Option<&()>) -> KvResult<()> { ... }
//! }
//!
//! scheduler.register_descriptor(DescriptorAdapter::boxed(VlanDescriptor))?;
//! ```

mod changes;
mod descriptor;
mod error;
mod metadata;
mod pending;
mod status;
mod txn;
mod value;

pub use changes::{ChangeQueue, KeyIntent};
pub use descriptor::{
    Dependency, DependencyTarget, Descriptor, DescriptorAdapter, KeySelector, KvDescriptor,
    TypedKv,
};
pub use error::{KeyWithError, KvError, KvResult, TransactionError};
pub use metadata::{MetadataMap, MetadataReader, MetadataRegistry};
pub use pending::{PendingCache, PendingEntry};
pub use status::{BaseValueStatus, TxnOperation, ValueState, ValueStatus};
pub use txn::{
    CommitResult, KeyResult, RecordedKv, RecordedRetry, RecordedTxn, RecordedTxnOp, ResyncType,
    RetryPolicy, TxnOptions, TxnType,
};
pub use value::{
    downcast, downcast_arc, key_with_prefix, strip_key_prefix, value_ref, values_equal,
    KeyValuePair, KvWithMetadata, MetadataRef, Value, ValueOrigin, ValueRef,
};
