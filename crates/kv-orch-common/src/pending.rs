//! Pending cache for values waiting on unmet dependencies.
//!
//! A value whose dependencies are not satisfied is not failed; it is parked
//! here together with the dependencies it waits on. When a key becomes
//! available, [`PendingCache::waiting_on`] returns the parked values that
//! might now be ready, and the scheduler re-evaluates them.

use crate::descriptor::{Dependency, DependencyTarget};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Entry in the pending cache.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    /// Key of the parked value
    pub key: String,
    /// Dependencies that were unmet when the value was parked
    pub unmet: Vec<Dependency>,
    /// Sequence number of the transaction that parked the value
    pub since_txn: u64,
}

impl PendingEntry {
    /// Labels of the unmet dependencies.
    pub fn labels(&self) -> Vec<String> {
        self.unmet.iter().map(|d| d.label.clone()).collect()
    }
}

/// Cache of values waiting for their dependencies.
#[derive(Debug, Clone, Default)]
pub struct PendingCache {
    /// Parked values indexed by their key
    entries: BTreeMap<String, PendingEntry>,
    /// Reverse index: dependency key -> parked keys waiting on it
    waiters: HashMap<String, BTreeSet<String>>,
    /// Parked keys with at least one AnyOf dependency (matched by scanning)
    selector_waiters: BTreeSet<String>,
}

impl PendingCache {
    /// Creates a new empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of parked values.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no value is parked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parks a value (replacing a previous entry of the same key).
    pub fn add(&mut self, key: impl Into<String>, unmet: Vec<Dependency>, since_txn: u64) {
        let key = key.into();
        self.remove(&key);

        for dep in &unmet {
            match &dep.target {
                DependencyTarget::Key(target) => {
                    self.waiters
                        .entry(target.clone())
                        .or_default()
                        .insert(key.clone());
                }
                DependencyTarget::AnyOf { .. } => {
                    self.selector_waiters.insert(key.clone());
                }
            }
        }

        log::trace!("parking {} on {} dependencies", key, unmet.len());
        self.entries.insert(
            key.clone(),
            PendingEntry {
                key,
                unmet,
                since_txn,
            },
        );
    }

    /// Removes a parked value.
    pub fn remove(&mut self, key: &str) -> Option<PendingEntry> {
        let entry = self.entries.remove(key)?;
        for dep in &entry.unmet {
            if let DependencyTarget::Key(target) = &dep.target {
                if let Some(waiters) = self.waiters.get_mut(target) {
                    waiters.remove(key);
                    if waiters.is_empty() {
                        self.waiters.remove(target);
                    }
                }
            }
        }
        self.selector_waiters.remove(key);
        Some(entry)
    }

    /// Returns the parked keys that wait on a dependency matched by `key`.
    ///
    /// Keys are returned in sorted order and stay in the cache; the caller
    /// removes them once they are actually applied.
    pub fn waiting_on(&self, key: &str) -> Vec<String> {
        let mut ready: BTreeSet<String> = self
            .waiters
            .get(key)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default();

        for waiter in &self.selector_waiters {
            if let Some(entry) = self.entries.get(waiter) {
                if entry.unmet.iter().any(|dep| dep.matches(key)) {
                    ready.insert(waiter.clone());
                }
            }
        }

        ready.into_iter().collect()
    }

    /// Returns true if the cache contains the given key.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns the entry of a parked value.
    pub fn get(&self, key: &str) -> Option<&PendingEntry> {
        self.entries.get(key)
    }

    /// Iterates over parked values in key order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingEntry> {
        self.entries.values()
    }

    /// Clears all entries from the cache.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.waiters.clear();
        self.selector_waiters.clear();
    }

    /// Dumps parked values for debugging.
    pub fn dump(&self) -> Vec<String> {
        self.entries
            .values()
            .map(|e| format!("{} (txn {}) waiting on {:?}", e.key, e.since_txn, e.labels()))
            .collect()
    }
}
