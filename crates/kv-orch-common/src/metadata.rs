//! Metadata index: per-descriptor mapping from key label to runtime metadata.
//!
//! The scheduler owns one [`MetadataMap`] for every descriptor that declares
//! `with_metadata`. Entries are created on a successful Create, replaced on
//! Update and removed on Delete. Descriptors never write to a map; they
//! receive [`MetadataReader`] handles, either directly from the scheduler or
//! lazily by descriptor name through a shared [`MetadataRegistry`].
//!
//! Like `SyncMap`, lookups never create entries implicitly.

use crate::value::{downcast, MetadataRef, Value};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

type Entries = Arc<RwLock<BTreeMap<String, MetadataRef>>>;

/// Writable metadata map, owned by the scheduler.
#[derive(Debug, Clone)]
pub struct MetadataMap {
    name: String,
    entries: Entries,
}

impl MetadataMap {
    /// Creates a new empty map for the given descriptor.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Returns the descriptor name this map belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inserts or replaces metadata for a label.
    pub fn put(&self, label: impl Into<String>, metadata: MetadataRef) {
        self.entries.write().insert(label.into(), metadata);
    }

    /// Removes metadata of a label, returning it if present.
    pub fn delete(&self, label: &str) -> Option<MetadataRef> {
        self.entries.write().remove(label)
    }

    /// Removes all entries.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Returns a read-only view of this map.
    pub fn reader(&self) -> MetadataReader {
        MetadataReader {
            name: self.name.clone(),
            entries: Arc::clone(&self.entries),
        }
    }
}

/// Read-only view of a metadata map.
#[derive(Debug, Clone)]
pub struct MetadataReader {
    name: String,
    entries: Entries,
}

impl MetadataReader {
    /// Returns the descriptor name this map belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the metadata stored under `label`.
    ///
    /// Returns `None` if the label is not present.
    pub fn get(&self, label: &str) -> Option<MetadataRef> {
        self.entries.read().get(label).cloned()
    }

    /// Returns the metadata under `label` downcast to `T`.
    pub fn get_typed<T: Value + Clone>(&self, label: &str) -> Option<T> {
        let metadata = self.get(label)?;
        downcast::<T>(&metadata).cloned()
    }

    /// Returns true if the map contains `label`.
    pub fn contains(&self, label: &str) -> bool {
        self.entries.read().contains_key(label)
    }

    /// Returns all labels, in sorted order.
    pub fn list_labels(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Returns the first label whose metadata satisfies `predicate`.
    ///
    /// Used for secondary lookups, e.g. resolving a device index back to a name.
    pub fn find<F>(&self, predicate: F) -> Option<(String, MetadataRef)>
    where
        F: Fn(&str, &MetadataRef) -> bool,
    {
        self.entries
            .read()
            .iter()
            .find(|(label, metadata)| predicate(label, metadata))
            .map(|(label, metadata)| (label.clone(), Arc::clone(metadata)))
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Registry of metadata readers, keyed by descriptor name.
///
/// Shared between the scheduler (which publishes maps at descriptor
/// registration) and descriptors (which resolve maps of other descriptors
/// on demand). Resolution is lazy, so descriptors can be constructed in any
/// order.
#[derive(Debug, Clone, Default)]
pub struct MetadataRegistry {
    readers: Arc<RwLock<HashMap<String, MetadataReader>>>,
}

impl MetadataRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a map under its descriptor name.
    pub fn register(&self, map: &MetadataMap) {
        self.readers
            .write()
            .insert(map.name().to_string(), map.reader());
    }

    /// Returns the reader registered for `descriptor`.
    pub fn get(&self, descriptor: &str) -> Option<MetadataReader> {
        self.readers.read().get(descriptor).cloned()
    }

    /// Returns the typed metadata of `label` in the map of `descriptor`.
    pub fn lookup<T: Value + Clone>(&self, descriptor: &str, label: &str) -> Option<T> {
        self.get(descriptor)?.get_typed(label)
    }

    /// Returns the names of all registered maps.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.readers.read().keys().cloned().collect();
        names.sort();
        names
    }
}
