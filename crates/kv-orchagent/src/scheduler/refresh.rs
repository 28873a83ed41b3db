//! Refresh of the graph from the device.
//!
//! Descriptors are asked to retrieve their values in retrieve-dependency
//! order. Retrieved values replace what the graph believes to be applied;
//! the intended values are left untouched, so the transaction that follows
//! can converge the device back to the intent.

use super::exec::{describe, Executor};
use super::graph::Node;
use kv_orch_common::{
    KvDescriptor, KvWithMetadata, ValueOrigin, ValueRef, ValueState,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Outcome of one refresh.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct RefreshStats {
    pub retrieved: usize,
    pub discovered: usize,
    pub missing: usize,
    /// Descriptors whose retrieve failed
    pub failed: Vec<String>,
}

impl Executor<'_> {
    /// Re-reads the device state.
    ///
    /// `nb_values` is the desired state used for correlation (first full
    /// resync); without it, the graph itself is correlated.
    pub fn refresh(&mut self, nb_values: Option<&BTreeMap<String, ValueRef>>, verbose: bool) -> RefreshStats {
        let mut stats = RefreshStats::default();
        let mut available = Vec::new();

        for name in self.registry.retrieve_order() {
            let Some(descriptor) = self.registry.get(&name).cloned() else {
                continue;
            };
            let correlate = self.correlate(&descriptor, nb_values);

            let retrieved = match descriptor.retrieve(&correlate) {
                None => continue,
                Some(Err(err)) => {
                    tracing::warn!(descriptor = %name, error = %err, "retrieve failed, skipping descriptor");
                    stats.failed.push(name);
                    continue;
                }
                Some(Ok(values)) => values,
            };

            let mut seen = BTreeSet::new();
            for kv in retrieved {
                if !descriptor.is_key_owned(&kv.key) {
                    tracing::warn!(descriptor = %name, key = %kv.key, "retrieved key not owned by descriptor");
                    continue;
                }
                if verbose {
                    tracing::info!(
                        descriptor = %name,
                        key = %kv.key,
                        value = %describe(&kv.value),
                        origin = %kv.origin,
                        "retrieved value"
                    );
                }
                let nb_intent = nb_values.is_some_and(|values| values.contains_key(&kv.key));
                if self.refresh_node(&descriptor, kv.clone(), nb_intent) {
                    stats.discovered += 1;
                }
                stats.retrieved += 1;
                available.push(kv.key.clone());
                seen.insert(kv.key);
            }

            stats.missing += self.mark_missing(&descriptor, &seen);
        }

        for key in available {
            self.resolve_pending(&key);
        }

        tracing::info!(
            retrieved = stats.retrieved,
            discovered = stats.discovered,
            missing = stats.missing,
            failed = stats.failed.len(),
            "refresh finished"
        );
        stats
    }

    /// Compares the device state with the graph, logging every mismatch.
    ///
    /// Returns the number of mismatches.
    pub fn verify(&self) -> usize {
        let mut mismatches = 0;
        for name in self.registry.retrieve_order() {
            let Some(descriptor) = self.registry.get(&name) else {
                continue;
            };
            let correlate = self.correlate(descriptor, None);
            let Some(Ok(retrieved)) = descriptor.retrieve(&correlate) else {
                continue;
            };
            let retrieved: BTreeMap<String, KvWithMetadata> =
                retrieved.into_iter().map(|kv| (kv.key.clone(), kv)).collect();

            for node in self.owned_nodes(&name) {
                let Some(intended) = node.applied.as_ref() else {
                    continue;
                };
                match retrieved.get(&node.key) {
                    None => {
                        tracing::warn!(key = %node.key, "verification: value is missing on the device");
                        mismatches += 1;
                    }
                    Some(kv) if !descriptor.equivalent(&node.key, intended, &kv.value) => {
                        tracing::warn!(
                            key = %node.key,
                            expected = %describe(intended),
                            actual = %describe(&kv.value),
                            "verification: value differs on the device"
                        );
                        mismatches += 1;
                    }
                    Some(_) => {}
                }
            }
            for key in retrieved.keys() {
                if !self.state.graph.contains(key) {
                    tracing::warn!(key = %key, "verification: unexpected value on the device");
                    mismatches += 1;
                }
            }
        }
        mismatches
    }

    fn owned_nodes<'n>(&'n self, descriptor: &'n str) -> impl Iterator<Item = &'n Node> + 'n {
        self.state
            .graph
            .nodes()
            .filter(move |n| n.descriptor.as_deref() == Some(descriptor))
    }

    fn correlate(
        &self,
        descriptor: &Arc<dyn KvDescriptor>,
        nb_values: Option<&BTreeMap<String, ValueRef>>,
    ) -> Vec<KvWithMetadata> {
        let mut correlate = Vec::new();
        if let Some(values) = nb_values {
            for (key, value) in values.iter().filter(|(k, _)| descriptor.is_key_owned(k)) {
                let mut kv = KvWithMetadata::new(key.clone(), value.clone(), ValueOrigin::FromNb);
                kv.metadata = self.state.graph.get(key).and_then(|n| n.metadata.clone());
                correlate.push(kv);
            }
        }
        for node in self.owned_nodes(descriptor.name()) {
            if nb_values.is_some_and(|values| values.contains_key(&node.key)) {
                continue;
            }
            let mut kv = KvWithMetadata::new(
                node.key.clone(),
                node.applied.clone().unwrap_or_else(|| node.value.clone()),
                node.origin,
            );
            kv.metadata = node.metadata.clone();
            correlate.push(kv);
        }
        correlate
    }

    /// Updates one node from a retrieved value.
    ///
    /// Returns true if the value was not known before.
    fn refresh_node(&mut self, descriptor: &Arc<dyn KvDescriptor>, kv: KvWithMetadata, nb_intent: bool) -> bool {
        let known = self.state.graph.get(&kv.key).map(|n| n.origin);
        let origin = match kv.origin {
            ValueOrigin::Unknown if nb_intent => ValueOrigin::FromNb,
            ValueOrigin::Unknown => known.unwrap_or(ValueOrigin::FromSb),
            origin => origin,
        };
        self.store_metadata(descriptor, &kv.key, kv.metadata.clone());

        let base = self
            .state
            .graph
            .get(&kv.key)
            .and_then(|n| n.derived_from.clone())
            .unwrap_or_else(|| kv.key.clone());
        self.ctx.changed.insert(base);

        match self.state.graph.get_mut(&kv.key) {
            Some(node) if origin == ValueOrigin::FromNb && node.origin == ValueOrigin::FromNb => {
                node.applied = Some(kv.value);
                node.metadata = kv.metadata;
                // a value whose removal failed keeps reporting the failure
                if !node.removing {
                    node.state = ValueState::Configured;
                    node.error = None;
                }
                self.state.pending.remove(&kv.key);
                false
            }
            Some(node) => {
                node.value = kv.value.clone();
                node.applied = Some(kv.value);
                node.metadata = kv.metadata;
                node.origin = origin;
                node.removing = false;
                node.state = match origin {
                    ValueOrigin::FromNb => ValueState::Discovered,
                    _ => ValueState::Obtained,
                };
                node.error = None;
                self.state.pending.remove(&kv.key);
                false
            }
            None => {
                let deps = descriptor.dependencies(&kv.key, &kv.value);
                let mut node = Node::new(kv.key.clone(), kv.value.clone(), origin);
                node.applied = Some(kv.value);
                node.metadata = kv.metadata;
                node.descriptor = Some(descriptor.name().to_string());
                node.deps = deps;
                node.state = match origin {
                    ValueOrigin::FromNb if nb_intent => ValueState::Configured,
                    ValueOrigin::FromNb => ValueState::Discovered,
                    _ => ValueState::Obtained,
                };
                tracing::debug!(key = %node.key, state = %node.state, "value discovered on the device");
                self.state.graph.insert(node);
                true
            }
        }
    }

    /// Handles owned values that were not retrieved.
    ///
    /// Dependents of a vanished value go back to pending. NB values become
    /// Missing. SB values and values whose removal was requested are dropped.
    fn mark_missing(&mut self, descriptor: &Arc<dyn KvDescriptor>, seen: &BTreeSet<String>) -> usize {
        let gone: Vec<(String, bool, Vec<String>)> = self
            .owned_nodes(descriptor.name())
            .filter(|n| n.applied.is_some() && !seen.contains(&n.key))
            .map(|n| {
                let drop = n.origin == ValueOrigin::FromSb || n.removing;
                (n.key.clone(), drop, n.derived.clone())
            })
            .collect();

        for (key, drop, derived) in &gone {
            tracing::debug!(key = %key, dropped = *drop, "value is missing on the device");
            let base = self
                .state
                .graph
                .get(key)
                .and_then(|n| n.derived_from.clone())
                .unwrap_or_else(|| key.clone());
            self.ctx.changed.insert(base);

            if *drop {
                self.remove_vanished(key);
                continue;
            }

            self.take_down_dependents(key);
            self.store_metadata(descriptor, key, None);
            if let Some(node) = self.state.graph.get_mut(key) {
                node.applied = None;
                node.metadata = None;
                node.state = ValueState::Missing;
            }
            // derived values went away with their parent
            for child in derived {
                if !self.state.graph.get(child).is_some_and(|n| n.applied.is_some()) {
                    continue;
                }
                self.take_down_dependents(child);
                if let Some(owner) = self.owner_of(child) {
                    self.store_metadata(&owner, child, None);
                }
                if let Some(node) = self.state.graph.get_mut(child) {
                    node.applied = None;
                    node.metadata = None;
                    node.state = ValueState::Missing;
                }
            }
        }
        gone.len()
    }
}
