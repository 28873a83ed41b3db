//! Descriptor registry.

use kv_orch_common::{KvDescriptor, KvError, KvResult};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Registered descriptors, in registration order.
///
/// Registration order never determines execution order; it only breaks ties
/// when two descriptors claim the same key (the first one wins).
#[derive(Default, Clone)]
pub(crate) struct DescriptorRegistry {
    descriptors: Vec<Arc<dyn KvDescriptor>>,
    by_name: HashMap<String, usize>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: Arc<dyn KvDescriptor>) -> KvResult<()> {
        let name = descriptor.name().to_string();
        if name.is_empty() {
            return Err(KvError::internal("descriptor without name"));
        }
        if self.by_name.contains_key(&name) {
            return Err(KvError::internal(format!(
                "descriptor {} is already registered",
                name
            )));
        }
        self.by_name.insert(name, self.descriptors.len());
        self.descriptors.push(descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn KvDescriptor>> {
        self.by_name.get(name).map(|&idx| &self.descriptors[idx])
    }

    /// Returns the descriptor owning `key`.
    pub fn owner(&self, key: &str) -> Option<&Arc<dyn KvDescriptor>> {
        self.descriptors.iter().find(|d| d.is_key_owned(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn KvDescriptor>> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// NB key prefixes of all descriptors, sorted.
    pub fn nb_key_prefixes(&self) -> Vec<String> {
        let prefixes: BTreeSet<String> = self
            .descriptors
            .iter()
            .filter_map(|d| d.nb_key_prefix().map(str::to_string))
            .collect();
        prefixes.into_iter().collect()
    }

    /// Descriptor names ordered so that retrieve dependencies come first.
    ///
    /// Unknown dependency names are ignored. Descriptors caught in a cycle
    /// are appended in name order.
    pub fn retrieve_order(&self) -> Vec<String> {
        let mut remaining: BTreeMap<String, BTreeSet<String>> = self
            .descriptors
            .iter()
            .map(|d| {
                let deps = d
                    .retrieve_dependencies()
                    .into_iter()
                    .filter(|dep| self.by_name.contains_key(dep) && dep != d.name())
                    .collect();
                (d.name().to_string(), deps)
            })
            .collect();

        let mut order = Vec::with_capacity(remaining.len());
        loop {
            let ready: Vec<String> = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(name, _)| name.clone())
                .collect();
            if ready.is_empty() {
                break;
            }
            for name in &ready {
                remaining.remove(name);
                for deps in remaining.values_mut() {
                    deps.remove(name);
                }
            }
            order.extend(ready);
        }

        if !remaining.is_empty() {
            tracing::warn!(
                descriptors = ?remaining.keys().collect::<Vec<_>>(),
                "cyclic retrieve dependencies"
            );
            order.extend(remaining.into_keys());
        }
        order
    }
}
