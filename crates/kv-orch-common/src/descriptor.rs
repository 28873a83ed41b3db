//! Descriptor contract.
//!
//! A descriptor implements the lifecycle of one kind of configuration item:
//! it validates values, applies Create/Update/Delete against the device,
//! optionally dumps the device state (Retrieve), and declares dependencies
//! and derived values so that the scheduler can order operations.
//!
//! The scheduler talks to descriptors through the object-safe
//! [`KvDescriptor`] trait. Most descriptors are written against the typed
//! [`Descriptor`] trait instead and registered through [`DescriptorAdapter`],
//! which performs the downcasting from [`ValueRef`] once, in one place.
//!
//! All descriptor methods except the lifecycle callbacks must be pure: the
//! scheduler may call them any number of times while building the graph.

use crate::error::{KvError, KvResult};
use crate::value::{downcast, downcast_arc, KeyValuePair, KvWithMetadata, MetadataRef, Value, ValueOrigin, ValueRef};
use std::fmt;
use std::sync::Arc;

/// Predicate over keys.
pub type KeySelector = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Target of a dependency.
#[derive(Clone)]
pub enum DependencyTarget {
    /// Exactly this key must be available.
    Key(String),
    /// At least one available key matching a prefix or the selector.
    AnyOf {
        key_prefixes: Vec<String>,
        key_selector: Option<KeySelector>,
    },
}

impl DependencyTarget {
    /// Returns true if `key` satisfies this target.
    pub fn matches(&self, key: &str) -> bool {
        match self {
            DependencyTarget::Key(target) => target == key,
            DependencyTarget::AnyOf {
                key_prefixes,
                key_selector,
            } => {
                let prefix_match =
                    key_prefixes.is_empty() || key_prefixes.iter().any(|p| key.starts_with(p));
                let selector_match = key_selector.as_ref().map_or(true, |sel| sel(key));
                prefix_match && selector_match
            }
        }
    }
}

impl fmt::Debug for DependencyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyTarget::Key(key) => write!(f, "Key({})", key),
            DependencyTarget::AnyOf {
                key_prefixes,
                key_selector,
            } => write!(
                f,
                "AnyOf(prefixes={:?}, selector={})",
                key_prefixes,
                key_selector.is_some()
            ),
        }
    }
}

/// Named dependency of a value.
#[derive(Debug, Clone)]
pub struct Dependency {
    /// Label reported in the status of a pending value.
    pub label: String,
    /// What the value depends on.
    pub target: DependencyTarget,
}

impl Dependency {
    /// Dependency on exactly one key.
    pub fn on_key(label: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            target: DependencyTarget::Key(key.into()),
        }
    }

    /// Dependency on any key with one of the given prefixes.
    pub fn any_of_prefixes<I, S>(label: impl Into<String>, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            label: label.into(),
            target: DependencyTarget::AnyOf {
                key_prefixes: prefixes.into_iter().map(Into::into).collect(),
                key_selector: None,
            },
        }
    }

    /// Dependency on any key matched by the selector.
    pub fn any_of_selector(label: impl Into<String>, selector: KeySelector) -> Self {
        Self {
            label: label.into(),
            target: DependencyTarget::AnyOf {
                key_prefixes: Vec::new(),
                key_selector: Some(selector),
            },
        }
    }

    /// Returns true if `key` satisfies this dependency.
    pub fn matches(&self, key: &str) -> bool {
        self.target.matches(key)
    }
}

/// Object-safe descriptor interface used by the scheduler.
pub trait KvDescriptor: Send + Sync {
    /// Unique descriptor name.
    fn name(&self) -> &str;

    /// Returns true if the descriptor owns `key`.
    fn is_key_owned(&self, key: &str) -> bool;

    /// Prefix of keys accepted from northbound data sources.
    ///
    /// Descriptors of purely derived values return `None`.
    fn nb_key_prefix(&self) -> Option<&str> {
        None
    }

    /// Label of the key, used as the metadata-map key.
    fn key_label(&self, key: &str) -> String {
        key.to_string()
    }

    /// Returns true if two values are equivalent, i.e. no Update is needed.
    fn equivalent(&self, _key: &str, old: &ValueRef, new: &ValueRef) -> bool {
        crate::value::values_equal(old, new)
    }

    /// Returns true if the scheduler should keep a metadata map for this
    /// descriptor.
    fn with_metadata(&self) -> bool {
        false
    }

    /// Rejects structurally invalid values.
    fn validate(&self, _key: &str, _value: &ValueRef) -> KvResult<()> {
        Ok(())
    }

    /// Creates the value on the device, returning its metadata.
    fn create(&self, key: &str, value: &ValueRef) -> KvResult<Option<MetadataRef>>;

    /// Deletes the value from the device.
    fn delete(&self, key: &str, value: &ValueRef, metadata: Option<&MetadataRef>) -> KvResult<()>;

    /// Returns true if [`KvDescriptor::update`] is implemented.
    ///
    /// Without update support, every non-equivalent change is applied as
    /// delete followed by create.
    fn supports_update(&self) -> bool {
        false
    }

    /// Updates the value in place, returning the new metadata.
    fn update(
        &self,
        _key: &str,
        _old: &ValueRef,
        _new: &ValueRef,
        _old_metadata: Option<&MetadataRef>,
    ) -> KvResult<Option<MetadataRef>> {
        Err(KvError::unimplemented(self.name(), "update"))
    }

    /// Returns true if the change from `old` to `new` requires re-creation.
    fn update_with_recreate(
        &self,
        _key: &str,
        _old: &ValueRef,
        _new: &ValueRef,
        _metadata: Option<&MetadataRef>,
    ) -> bool {
        false
    }

    /// Reads the actual device state.
    ///
    /// `correlate` holds the values the scheduler expects to find.
    /// Returns `None` if the descriptor cannot dump the device.
    fn retrieve(&self, _correlate: &[KvWithMetadata]) -> Option<KvResult<Vec<KvWithMetadata>>> {
        None
    }

    /// Names of descriptors whose values must be retrieved before this one.
    fn retrieve_dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Classifies a failure of Create/Update/Delete as transient.
    fn is_retriable_failure(&self, err: &KvError) -> bool {
        err.is_retryable()
    }

    /// Values derived from the given value.
    fn derived_values(&self, _key: &str, _value: &ValueRef) -> Vec<KeyValuePair> {
        Vec::new()
    }

    /// Dependencies of the given value.
    fn dependencies(&self, _key: &str, _value: &ValueRef) -> Vec<Dependency> {
        Vec::new()
    }
}

/// Typed descriptor, registered through [`DescriptorAdapter`].
///
/// Methods mirror [`KvDescriptor`] but receive concrete value and metadata
/// types.
pub trait Descriptor: Send + Sync + 'static {
    /// Concrete value type.
    type Value: Value;
    /// Concrete metadata type (`()` for descriptors without metadata).
    type Metadata: Value;

    fn name(&self) -> &str;

    fn is_key_owned(&self, key: &str) -> bool;

    fn nb_key_prefix(&self) -> Option<&str> {
        None
    }

    fn key_label(&self, key: &str) -> String {
        key.to_string()
    }

    fn equivalent(&self, _key: &str, old: &Self::Value, new: &Self::Value) -> bool {
        old.equals(new)
    }

    fn with_metadata(&self) -> bool {
        false
    }

    fn validate(&self, _key: &str, _value: &Self::Value) -> KvResult<()> {
        Ok(())
    }

    fn create(&self, key: &str, value: &Self::Value) -> KvResult<Option<Self::Metadata>>;

    fn delete(&self, key: &str, value: &Self::Value, metadata: Option<&Self::Metadata>) -> KvResult<()>;

    fn supports_update(&self) -> bool {
        false
    }

    fn update(
        &self,
        _key: &str,
        _old: &Self::Value,
        _new: &Self::Value,
        _old_metadata: Option<&Self::Metadata>,
    ) -> KvResult<Option<Self::Metadata>> {
        Err(KvError::unimplemented(self.name(), "update"))
    }

    fn update_with_recreate(
        &self,
        _key: &str,
        _old: &Self::Value,
        _new: &Self::Value,
        _metadata: Option<&Self::Metadata>,
    ) -> bool {
        false
    }

    /// See [`KvDescriptor::retrieve`]; correlation entries with a foreign
    /// value type are skipped by the adapter.
    fn retrieve(
        &self,
        _correlate: &[TypedKv<Self::Value, Self::Metadata>],
    ) -> Option<KvResult<Vec<TypedKv<Self::Value, Self::Metadata>>>> {
        None
    }

    fn retrieve_dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn is_retriable_failure(&self, err: &KvError) -> bool {
        err.is_retryable()
    }

    fn derived_values(&self, _key: &str, _value: &Self::Value) -> Vec<KeyValuePair> {
        Vec::new()
    }

    fn dependencies(&self, _key: &str, _value: &Self::Value) -> Vec<Dependency> {
        Vec::new()
    }
}

/// Typed counterpart of [`KvWithMetadata`].
#[derive(Debug, Clone)]
pub struct TypedKv<V, M> {
    pub key: String,
    pub value: Arc<V>,
    pub metadata: Option<Arc<M>>,
    pub origin: ValueOrigin,
}

/// Adapts a typed [`Descriptor`] to the object-safe [`KvDescriptor`].
pub struct DescriptorAdapter<D> {
    inner: D,
}

impl<D: Descriptor> DescriptorAdapter<D> {
    /// Wraps a typed descriptor.
    pub fn new(inner: D) -> Self {
        Self { inner }
    }

    /// Wraps a typed descriptor into a shareable trait object.
    pub fn boxed(inner: D) -> Arc<dyn KvDescriptor> {
        Arc::new(Self::new(inner))
    }

    /// Returns the wrapped descriptor.
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn typed_value<'a>(&self, value: &'a ValueRef) -> KvResult<&'a D::Value> {
        downcast::<D::Value>(value).ok_or_else(|| KvError::TypeMismatch {
            descriptor: self.inner.name().to_string(),
            expected: std::any::type_name::<D::Value>().to_string(),
            actual: value.type_name().to_string(),
        })
    }

    fn typed_metadata<'a>(&self, metadata: Option<&'a MetadataRef>) -> Option<&'a D::Metadata> {
        metadata.and_then(downcast::<D::Metadata>)
    }

    fn erase_metadata(metadata: Option<D::Metadata>) -> Option<MetadataRef> {
        metadata.map(|m| Arc::new(m) as MetadataRef)
    }
}

impl<D: Descriptor> KvDescriptor for DescriptorAdapter<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn is_key_owned(&self, key: &str) -> bool {
        self.inner.is_key_owned(key)
    }

    fn nb_key_prefix(&self) -> Option<&str> {
        self.inner.nb_key_prefix()
    }

    fn key_label(&self, key: &str) -> String {
        self.inner.key_label(key)
    }

    fn equivalent(&self, key: &str, old: &ValueRef, new: &ValueRef) -> bool {
        match (self.typed_value(old), self.typed_value(new)) {
            (Ok(old), Ok(new)) => self.inner.equivalent(key, old, new),
            _ => false,
        }
    }

    fn with_metadata(&self) -> bool {
        self.inner.with_metadata()
    }

    fn validate(&self, key: &str, value: &ValueRef) -> KvResult<()> {
        self.inner.validate(key, self.typed_value(value)?)
    }

    fn create(&self, key: &str, value: &ValueRef) -> KvResult<Option<MetadataRef>> {
        let metadata = self.inner.create(key, self.typed_value(value)?)?;
        Ok(Self::erase_metadata(metadata))
    }

    fn delete(&self, key: &str, value: &ValueRef, metadata: Option<&MetadataRef>) -> KvResult<()> {
        self.inner
            .delete(key, self.typed_value(value)?, self.typed_metadata(metadata))
    }

    fn supports_update(&self) -> bool {
        self.inner.supports_update()
    }

    fn update(
        &self,
        key: &str,
        old: &ValueRef,
        new: &ValueRef,
        old_metadata: Option<&MetadataRef>,
    ) -> KvResult<Option<MetadataRef>> {
        let metadata = self.inner.update(
            key,
            self.typed_value(old)?,
            self.typed_value(new)?,
            self.typed_metadata(old_metadata),
        )?;
        Ok(Self::erase_metadata(metadata))
    }

    fn update_with_recreate(
        &self,
        key: &str,
        old: &ValueRef,
        new: &ValueRef,
        metadata: Option<&MetadataRef>,
    ) -> bool {
        match (self.typed_value(old), self.typed_value(new)) {
            (Ok(old), Ok(new)) => {
                self.inner
                    .update_with_recreate(key, old, new, self.typed_metadata(metadata))
            }
            // a value of a foreign type can only be replaced
            _ => true,
        }
    }

    fn retrieve(&self, correlate: &[KvWithMetadata]) -> Option<KvResult<Vec<KvWithMetadata>>> {
        let typed: Vec<TypedKv<D::Value, D::Metadata>> = correlate
            .iter()
            .filter_map(|kv| {
                let value = downcast_arc::<D::Value>(Arc::clone(&kv.value))?;
                let metadata = kv.metadata.clone().and_then(downcast_arc::<D::Metadata>);
                Some(TypedKv {
                    key: kv.key.clone(),
                    value,
                    metadata,
                    origin: kv.origin,
                })
            })
            .collect();

        let retrieved = self.inner.retrieve(&typed)?;
        Some(retrieved.map(|values| {
            values
                .into_iter()
                .map(|kv| KvWithMetadata {
                    key: kv.key,
                    value: kv.value as ValueRef,
                    metadata: kv.metadata.map(|m| m as MetadataRef),
                    origin: kv.origin,
                })
                .collect()
        }))
    }

    fn retrieve_dependencies(&self) -> Vec<String> {
        self.inner.retrieve_dependencies()
    }

    fn is_retriable_failure(&self, err: &KvError) -> bool {
        self.inner.is_retriable_failure(err)
    }

    fn derived_values(&self, key: &str, value: &ValueRef) -> Vec<KeyValuePair> {
        match self.typed_value(value) {
            Ok(value) => self.inner.derived_values(key, value),
            Err(_) => Vec::new(),
        }
    }

    fn dependencies(&self, key: &str, value: &ValueRef) -> Vec<Dependency> {
        match self.typed_value(value) {
            Ok(value) => self.inner.dependencies(key, value),
            Err(_) => Vec::new(),
        }
    }
}
