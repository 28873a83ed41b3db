//! Change queue for northbound key intents.
//!
//! Watchers deliver changes faster than transactions commit. Queued intents
//! are coalesced per key before they are pushed:
//!
//! - A later put replaces an earlier put of the same key
//! - A delete supersedes any earlier put of the same key
//! - A put after a delete replaces the delete (values are whole items)

use crate::value::ValueRef;
use std::collections::BTreeMap;

/// Intent to put or delete one key.
#[derive(Debug, Clone)]
pub struct KeyIntent {
    /// Item key
    pub key: String,
    /// New value, or `None` for delete
    pub value: Option<ValueRef>,
}

impl KeyIntent {
    /// Creates a put intent.
    pub fn put(key: impl Into<String>, value: ValueRef) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
        }
    }

    /// Creates a delete intent.
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    /// Returns true if this is a delete.
    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }
}

/// Per-source queue of coalesced intents.
#[derive(Debug)]
pub struct ChangeQueue {
    source: String,
    pending: BTreeMap<String, KeyIntent>,
    /// Number of intents dropped by coalescing
    coalesced: u64,
}

impl ChangeQueue {
    /// Creates an empty queue for the given data source.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            pending: BTreeMap::new(),
            coalesced: 0,
        }
    }

    /// Returns the data source name.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns true if there are queued intents.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Returns the number of queued intents.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns how many intents were merged away so far.
    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }

    /// Queues intents, coalescing them per key.
    pub fn add(&mut self, intents: impl IntoIterator<Item = KeyIntent>) {
        for intent in intents {
            if self.pending.insert(intent.key.clone(), intent).is_some() {
                self.coalesced += 1;
            }
        }
    }

    /// Drains all queued intents in key order.
    pub fn drain(&mut self) -> Vec<KeyIntent> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    /// Puts an intent back, unless a newer intent for the key is queued.
    pub fn requeue(&mut self, intent: KeyIntent) {
        self.pending.entry(intent.key.clone()).or_insert(intent);
    }

    /// Clears all queued intents.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Dumps queued intents for debugging.
    pub fn dump(&self) -> Vec<String> {
        self.pending
            .values()
            .map(|i| match &i.value {
                Some(value) => format!("{}: PUT {:?}", i.key, value),
                None => format!("{}: DEL", i.key),
            })
            .collect()
    }
}
