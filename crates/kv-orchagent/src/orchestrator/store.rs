//! Desired-state store of the orchestrator.
//!
//! Every data source owns its own slice of the store. The desired state seen
//! by the scheduler is the merge of all slices: sources are visited in
//! lexicographic order and a key provided by several sources resolves to the
//! last one.
//!
//! The store never creates entries on lookup; a missing source or key is
//! simply reported as absent.

use kv_orch_common::ValueRef;
use std::collections::BTreeMap;

/// Opaque caller tags attached to a key.
pub type Labels = BTreeMap<String, String>;

/// One stored value with its labels.
#[derive(Debug, Clone)]
pub struct StoredValue {
    pub value: ValueRef,
    pub labels: Labels,
}

/// Desired state, partitioned by data source.
#[derive(Debug, Clone, Default)]
pub struct Store {
    sources: BTreeMap<String, BTreeMap<String, StoredValue>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merged view across all sources.
    pub fn list_all(&self) -> BTreeMap<String, ValueRef> {
        self.merged()
            .into_iter()
            .map(|(key, stored)| (key, stored.value.clone()))
            .collect()
    }

    /// Labels of every key in the merged view.
    pub fn list_labels(&self) -> BTreeMap<String, Labels> {
        self.merged()
            .into_iter()
            .map(|(key, stored)| (key, stored.labels.clone()))
            .collect()
    }

    /// Effective value of one key after merging.
    pub fn resolve(&self, key: &str) -> Option<&StoredValue> {
        self.sources
            .values()
            .rev()
            .find_map(|slice| slice.get(key))
    }

    /// Drops everything stored for `source`.
    pub fn reset(&mut self, source: &str) {
        if let Some(slice) = self.sources.remove(source) {
            tracing::debug!(source = %source, keys = slice.len(), "store slice reset");
        }
    }

    pub fn update(&mut self, source: &str, key: impl Into<String>, value: ValueRef, labels: Labels) {
        self.sources
            .entry(source.to_string())
            .or_default()
            .insert(key.into(), StoredValue { value, labels });
    }

    /// Removes a key from one source. Returns true if it was present.
    pub fn delete(&mut self, source: &str, key: &str) -> bool {
        let Some(slice) = self.sources.get_mut(source) else {
            return false;
        };
        let removed = slice.remove(key).is_some();
        if slice.is_empty() {
            self.sources.remove(source);
        }
        removed
    }

    /// Keys stored for `source`.
    pub fn keys_of(&self, source: &str) -> Vec<String> {
        self.sources
            .get(source)
            .map(|slice| slice.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of the sources that currently store something.
    pub fn sources(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    /// Number of keys in the merged view.
    pub fn len(&self) -> usize {
        self.merged().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.values().all(|slice| slice.is_empty())
    }

    fn merged(&self) -> BTreeMap<String, &StoredValue> {
        let mut merged = BTreeMap::new();
        for slice in self.sources.values() {
            for (key, stored) in slice {
                merged.insert(key.clone(), stored);
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv_orch_common::{downcast, value_ref};
    use pretty_assertions::assert_eq;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_merge_is_union_of_sources() {
        let mut store = Store::new();
        store.update("etcd", "config/a", value_ref(1u32), Labels::new());
        store.update("grpc-local", "config/b", value_ref(2u32), Labels::new());

        let all = store.list_all();
        assert_eq!(all.keys().cloned().collect::<Vec<_>>(), vec!["config/a", "config/b"]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.sources(), vec!["etcd", "grpc-local"]);
    }

    #[test]
    fn test_conflicting_key_resolves_to_last_source() {
        let mut store = Store::new();
        store.update("zeta", "config/a", value_ref(9u32), labels(&[("owner", "zeta")]));
        store.update("alpha", "config/a", value_ref(1u32), labels(&[("owner", "alpha")]));

        let all = store.list_all();
        assert_eq!(downcast::<u32>(&all["config/a"]), Some(&9));
        assert_eq!(store.list_labels()["config/a"], labels(&[("owner", "zeta")]));
        assert_eq!(downcast::<u32>(&store.resolve("config/a").unwrap().value), Some(&9));

        store.delete("zeta", "config/a");
        assert_eq!(downcast::<u32>(&store.resolve("config/a").unwrap().value), Some(&1));
    }

    #[test]
    fn test_reset_touches_only_one_source() {
        let mut store = Store::new();
        store.update("etcd", "config/a", value_ref(1u32), Labels::new());
        store.update("etcd", "config/b", value_ref(2u32), Labels::new());
        store.update("grpc", "config/c", value_ref(3u32), Labels::new());

        assert_eq!(store.keys_of("etcd"), vec!["config/a", "config/b"]);
        store.reset("etcd");
        assert!(store.keys_of("etcd").is_empty());
        assert_eq!(store.list_all().keys().cloned().collect::<Vec<_>>(), vec!["config/c"]);
    }

    #[test]
    fn test_delete_missing_never_creates_entries() {
        let mut store = Store::new();
        assert!(!store.delete("etcd", "config/a"));
        assert!(store.sources().is_empty());
        assert!(store.is_empty());

        store.update("etcd", "config/a", value_ref(1u32), Labels::new());
        assert!(store.delete("etcd", "config/a"));
        assert!(store.sources().is_empty());
        assert!(store.resolve("config/a").is_none());
    }
}
