//! Transaction execution over the dependency graph.
//!
//! [`Executor`] applies key intents one at a time. Every intent is expanded
//! recursively: a created value creates its derived values and wakes up the
//! pending values waiting for it, and a removed value first removes its
//! derived values and takes down the dependents that lose their dependency.
//! Dependency order therefore follows from the recursion and never from the
//! order of the intents.

use super::graph::Node;
use super::registry::DescriptorRegistry;
use kv_orch_common::{
    Dependency, KeyWithError, KvDescriptor, KvError, MetadataMap, MetadataRef, PendingCache,
    RecordedTxnOp, TxnOperation, ValueOrigin, ValueRef, ValueState,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::graph::Graph;

/// Graph and pending cache, cloned for simulation.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExecState {
    pub graph: Graph,
    pub pending: PendingCache,
}

/// Failed operation to be re-applied by a retry transaction.
#[derive(Debug, Clone)]
pub(crate) struct RetryIntent {
    pub key: String,
    /// Value to re-apply, `None` to retry a removal
    pub value: Option<ValueRef>,
    /// Intent sequence number of the node when the operation failed
    pub intent_seq: u64,
}

/// Mutable bookkeeping of one transaction.
#[derive(Debug, Default)]
pub(crate) struct TxnContext {
    pub seq_num: u64,
    /// Plan only: descriptors are not called and metadata is not written
    pub dry_run: bool,
    pub is_retry: bool,
    pub is_revert: bool,
    /// A retriable failure will be retried (state Retrying instead of Failed)
    pub retry_allowed: bool,
    pub ops: Vec<RecordedTxnOp>,
    pub errors: Vec<KeyWithError>,
    pub retriable: Vec<RetryIntent>,
    /// Base keys whose status changed
    pub changed: BTreeSet<String>,
    /// Keys removed from the graph
    pub removed: BTreeSet<String>,
}

impl TxnContext {
    pub fn new(seq_num: u64) -> Self {
        Self {
            seq_num,
            ..Default::default()
        }
    }

    pub fn dry_run(seq_num: u64) -> Self {
        Self {
            seq_num,
            dry_run: true,
            ..Default::default()
        }
    }
}

/// Node state captured before an operation, for the transaction record.
struct Snapshot {
    state: ValueState,
    value: Option<String>,
    error: Option<String>,
    is_derived: bool,
    base: String,
}

/// Renders a value for logs and records.
pub(crate) fn describe(value: &ValueRef) -> String {
    format!("{:?}", value)
}

/// Applies intents to the graph, calling descriptors.
pub(crate) struct Executor<'a> {
    pub(super) registry: &'a DescriptorRegistry,
    pub(super) metadata: &'a HashMap<String, MetadataMap>,
    pub(super) state: &'a mut ExecState,
    pub(super) ctx: &'a mut TxnContext,
}

impl<'a> Executor<'a> {
    pub fn new(
        registry: &'a DescriptorRegistry,
        metadata: &'a HashMap<String, MetadataMap>,
        state: &'a mut ExecState,
        ctx: &'a mut TxnContext,
    ) -> Self {
        Self {
            registry,
            metadata,
            state,
            ctx,
        }
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Applies one northbound intent.
    pub fn apply_nb(&mut self, key: &str, value: Option<ValueRef>) {
        if let Some(node) = self.state.graph.get(key) {
            if node.is_derived() {
                tracing::warn!(key, "derived value cannot be changed directly, ignoring");
                return;
            }
            if node.origin == ValueOrigin::FromSb && value.is_none() {
                tracing::warn!(key, "value obtained from the device cannot be removed, ignoring");
                return;
            }
        }

        if !self.ctx.is_retry {
            let seq_num = self.ctx.seq_num;
            if let Some(node) = self.state.graph.get_mut(key) {
                node.intent_seq = seq_num;
            }
        }

        match value {
            Some(value) => self.set_value(key, value, ValueOrigin::FromNb, None),
            None => self.delete_value(key),
        }
    }

    /// Applies a value reported by the device (`None` when it disappeared).
    pub fn apply_sb(&mut self, key: &str, value: Option<ValueRef>, metadata: Option<MetadataRef>) {
        if let Some(node) = self.state.graph.get(key) {
            if node.origin == ValueOrigin::FromNb {
                tracing::warn!(key, "ignoring SB notification for a value requested by NB");
                return;
            }
        }

        let descriptor = self.registry.owner(key).cloned();

        match value {
            Some(value) => {
                let prev = self.snapshot(key);
                self.upsert(key, value.clone(), ValueOrigin::FromSb, None, descriptor.as_ref(), Vec::new());
                if let Some(descriptor) = &descriptor {
                    self.store_metadata(descriptor, key, metadata.clone());
                }
                if let Some(node) = self.state.graph.get_mut(key) {
                    node.applied = Some(value);
                    node.metadata = metadata;
                    node.state = ValueState::Obtained;
                    node.error = None;
                }
                self.record(TxnOperation::Create, key, prev, true, false);
                self.resolve_pending(key);
            }
            None => self.remove_vanished(key),
        }
    }

    /// Drops a value that is gone from the device.
    ///
    /// Dependents that lose their dependency are taken down first, then the
    /// metadata and the node itself go. No descriptor is called for `key`.
    pub(super) fn remove_vanished(&mut self, key: &str) {
        let Some(node) = self.state.graph.get(key) else {
            return;
        };
        let derived = node.derived.clone();
        let prev = self.snapshot(key);

        for child in &derived {
            self.remove_vanished(child);
        }
        self.take_down_dependents(key);
        if let Some(descriptor) = self.owner_of(key) {
            self.store_metadata(&descriptor, key, None);
        }
        if let Some(node) = self.state.graph.get_mut(key) {
            node.state = ValueState::Removed;
            node.applied = None;
            node.metadata = None;
        }
        self.record(TxnOperation::Delete, key, prev, true, false);
        self.state.graph.remove(key);
        self.state.pending.remove(key);
        self.ctx.removed.insert(key.to_string());
    }

    // ========================================================================
    // Set
    // ========================================================================

    /// Makes `value` the intended value of `key` and converges the device.
    pub fn set_value(
        &mut self,
        key: &str,
        value: ValueRef,
        origin: ValueOrigin,
        derived_from: Option<&str>,
    ) {
        let prev = self.snapshot(key);
        let Some(descriptor) = self.registry.owner(key).cloned() else {
            self.upsert(key, value, origin, derived_from, None, Vec::new());
            if let Some(node) = self.state.graph.get_mut(key) {
                node.state = ValueState::Unimplemented;
                node.error = None;
            }
            if prev.state != ValueState::Unimplemented {
                self.record(TxnOperation::Create, key, prev, true, false);
            }
            return;
        };

        if let Err(err) = descriptor.validate(key, &value) {
            self.set_invalid(key, &descriptor, value, origin, derived_from, err, prev);
            return;
        }

        let deps = descriptor.dependencies(key, &value);
        let (applied, available) = match self.state.graph.get(key) {
            Some(node) => (node.applied.clone(), node.is_available()),
            None => (None, false),
        };

        let Some(old) = applied else {
            self.upsert(key, value, origin, derived_from, Some(&descriptor), deps);
            self.create(key, &descriptor, prev, false);
            return;
        };

        // also restores a value whose change failed back to what is applied
        if (available || prev.state.is_failed()) && descriptor.equivalent(key, &old, &value) {
            self.upsert(key, value.clone(), origin, derived_from, Some(&descriptor), deps);
            let new_state = match origin {
                ValueOrigin::FromSb => ValueState::Obtained,
                _ => ValueState::Configured,
            };
            if let Some(node) = self.state.graph.get_mut(key) {
                node.applied = Some(value);
                node.state = new_state;
                node.error = None;
            }
            let was_available = prev.state.is_available();
            if prev.state != new_state {
                self.record(TxnOperation::Update, key, prev, true, false);
            }
            self.set_derived(key);
            if !was_available {
                self.resolve_pending(key);
            }
            return;
        }

        self.upsert(key, value.clone(), origin, derived_from, Some(&descriptor), deps.clone());

        let unmet = self.state.graph.unmet(&deps);
        if !unmet.is_empty() {
            // the new value needs something that is not there: remove and wait
            if self
                .remove_applied(key, &descriptor, ValueState::Pending, false, false)
                .is_ok()
            {
                self.park(key, unmet);
            }
            return;
        }

        let metadata = self.state.graph.get(key).and_then(|n| n.metadata.clone());
        let recreate = !descriptor.supports_update()
            || descriptor.update_with_recreate(key, &old, &value, metadata.as_ref());
        if recreate {
            if self
                .remove_applied(key, &descriptor, ValueState::NonExistent, true, false)
                .is_ok()
            {
                let prev = self.snapshot(key);
                self.create(key, &descriptor, prev, true);
            }
            return;
        }

        self.update(key, &descriptor, old, value, prev);
    }

    #[allow(clippy::too_many_arguments)]
    fn set_invalid(
        &mut self,
        key: &str,
        descriptor: &Arc<dyn KvDescriptor>,
        value: ValueRef,
        origin: ValueOrigin,
        derived_from: Option<&str>,
        err: KvError,
        prev: Snapshot,
    ) {
        tracing::warn!(seq_num = self.ctx.seq_num, key, error = %err, "value rejected by validation");

        if self.state.graph.get(key).is_some_and(|n| n.applied.is_some())
            && self
                .remove_applied(key, descriptor, ValueState::Invalid, false, false)
                .is_err()
        {
            return;
        }

        self.state.pending.remove(key);
        self.upsert(key, value, origin, derived_from, Some(descriptor), Vec::new());
        if let Some(node) = self.state.graph.get_mut(key) {
            node.state = ValueState::Invalid;
            node.error = Some(err.clone());
            node.last_op = TxnOperation::Validate;
        }
        self.ctx.errors.push(KeyWithError {
            key: key.to_string(),
            txn_operation: TxnOperation::Validate,
            error: err,
        });
        self.record(TxnOperation::Validate, key, prev, false, false);
    }

    fn create(&mut self, key: &str, descriptor: &Arc<dyn KvDescriptor>, prev: Snapshot, recreate: bool) {
        let Some(node) = self.state.graph.get(key) else {
            return;
        };
        let unmet = self.state.graph.unmet(&node.deps);
        let value = node.value.clone();

        if !unmet.is_empty() {
            tracing::debug!(
                seq_num = self.ctx.seq_num,
                key,
                waiting_on = ?unmet.iter().map(|d| d.label.as_str()).collect::<Vec<_>>(),
                "value is pending"
            );
            self.park(key, unmet);
            if prev.state != ValueState::Pending {
                self.record(TxnOperation::Create, key, prev, true, recreate);
            }
            return;
        }

        self.state.pending.remove(key);
        let result = if self.ctx.dry_run {
            Ok(None)
        } else {
            descriptor.create(key, &value)
        };

        match result {
            Ok(metadata) => {
                self.store_metadata(descriptor, key, metadata.clone());
                if let Some(node) = self.state.graph.get_mut(key) {
                    node.applied = Some(value);
                    node.metadata = metadata;
                    node.state = ValueState::Configured;
                    node.last_op = TxnOperation::Create;
                    node.error = None;
                }
                self.record(TxnOperation::Create, key, prev, false, recreate);
                self.set_derived(key);
                self.resolve_pending(key);
            }
            Err(err) => self.fail(key, descriptor, TxnOperation::Create, err, prev, recreate, false),
        }
    }

    fn update(
        &mut self,
        key: &str,
        descriptor: &Arc<dyn KvDescriptor>,
        old: ValueRef,
        new: ValueRef,
        prev: Snapshot,
    ) {
        // obsolete derived values go before the update
        let wanted: Vec<String> = descriptor
            .derived_values(key, &new)
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        self.prune_derived(key, &wanted);

        let old_metadata = self.state.graph.get(key).and_then(|n| n.metadata.clone());
        let result = if self.ctx.dry_run {
            Ok(old_metadata.clone())
        } else {
            descriptor.update(key, &old, &new, old_metadata.as_ref())
        };

        match result {
            Ok(metadata) => {
                let metadata = metadata.or(old_metadata);
                self.store_metadata(descriptor, key, metadata.clone());
                if let Some(node) = self.state.graph.get_mut(key) {
                    node.applied = Some(new);
                    node.metadata = metadata;
                    node.state = ValueState::Configured;
                    node.last_op = TxnOperation::Update;
                    node.error = None;
                }
                self.record(TxnOperation::Update, key, prev, false, false);
                self.set_derived(key);
                self.resolve_pending(key);
            }
            Err(err) => self.fail(key, descriptor, TxnOperation::Update, err, prev, false, false),
        }
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Removes `key` from the device and from the graph.
    pub fn delete_value(&mut self, key: &str) {
        let Some(node) = self.state.graph.get(key) else {
            return;
        };
        let applied = node.applied.is_some();
        let derived_from = node.derived_from.clone();
        let derived = node.derived.clone();
        let prev = self.snapshot(key);
        self.state.pending.remove(key);

        match self.owner_of(key) {
            Some(descriptor) if applied => {
                if self
                    .remove_applied(key, &descriptor, ValueState::Removed, false, true)
                    .is_err()
                {
                    if let Some(node) = self.state.graph.get_mut(key) {
                        node.removing = true;
                    }
                    return;
                }
            }
            _ => {
                for child in &derived {
                    self.delete_value(child);
                }
                if let Some(node) = self.state.graph.get_mut(key) {
                    node.state = ValueState::Removed;
                    node.last_op = TxnOperation::Delete;
                }
                self.record(TxnOperation::Delete, key, prev, true, false);
            }
        }

        self.state.graph.remove(key);
        if let Some(parent) = derived_from {
            if let Some(parent) = self.state.graph.get_mut(&parent) {
                parent.derived.retain(|d| d != key);
            }
        }
        self.ctx.removed.insert(key.to_string());
    }

    /// Deletes the applied value from the device, keeping the node.
    ///
    /// Derived values are removed first, then the dependents that lose their
    /// last matching dependency, then the value itself.
    fn remove_applied(
        &mut self,
        key: &str,
        descriptor: &Arc<dyn KvDescriptor>,
        next_state: ValueState,
        recreate: bool,
        removing: bool,
    ) -> Result<(), ()> {
        let prev = self.snapshot(key);
        let Some(node) = self.state.graph.get(key) else {
            return Ok(());
        };
        let Some(applied) = node.applied.clone() else {
            return Ok(());
        };
        let derived = node.derived.clone();
        let metadata = node.metadata.clone();
        let saved_state = node.state;

        for child in &derived {
            self.delete_value(child);
        }
        self.take_down_dependents(key);

        let result = if self.ctx.dry_run {
            Ok(())
        } else {
            descriptor.delete(key, &applied, metadata.as_ref())
        };

        match result {
            Ok(()) => {
                self.store_metadata(descriptor, key, None);
                if let Some(node) = self.state.graph.get_mut(key) {
                    node.applied = None;
                    node.metadata = None;
                    node.state = next_state;
                    node.last_op = TxnOperation::Delete;
                    node.error = None;
                    node.derived.clear();
                }
                self.record(TxnOperation::Delete, key, prev, false, recreate);
                Ok(())
            }
            Err(err) => {
                if let Some(node) = self.state.graph.get_mut(key) {
                    node.state = saved_state;
                }
                self.fail(key, descriptor, TxnOperation::Delete, err, prev, recreate, removing);
                Err(())
            }
        }
    }

    /// Marks `key` unavailable and moves dependents that lost their
    /// dependency back to pending.
    pub(super) fn take_down_dependents(&mut self, key: &str) {
        if let Some(node) = self.state.graph.get_mut(key) {
            node.state = ValueState::Pending;
        }
        for dependent in self.state.graph.applied_dependents(key) {
            let graph = &self.state.graph;
            let lost = graph
                .get(&dependent)
                .is_some_and(|n| !graph.unmet(&n.deps).is_empty());
            if !lost {
                continue;
            }
            let Some(descriptor) = self.owner_of(&dependent) else {
                continue;
            };
            if self
                .remove_applied(&dependent, &descriptor, ValueState::Pending, false, false)
                .is_ok()
            {
                let unmet = self
                    .state
                    .graph
                    .get(&dependent)
                    .map(|n| self.state.graph.unmet(&n.deps))
                    .unwrap_or_default();
                self.park(&dependent, unmet);
            }
        }
    }

    // ========================================================================
    // Derived values and pending resolution
    // ========================================================================

    /// Converges the derived values of an available value.
    fn set_derived(&mut self, key: &str) {
        let Some(node) = self.state.graph.get(key) else {
            return;
        };
        if !node.is_available() {
            return;
        }
        let Some(descriptor) = self.owner_of(key) else {
            return;
        };
        let value = node.value.clone();
        let origin = node.origin;

        let derived = descriptor.derived_values(key, &value);
        let keys: Vec<String> = derived.iter().map(|kv| kv.key.clone()).collect();
        self.prune_derived(key, &keys);
        if let Some(node) = self.state.graph.get_mut(key) {
            node.derived = keys;
        }

        for kv in derived {
            self.set_value(&kv.key, kv.value, origin, Some(key));
        }
    }

    /// Removes derived values of `key` that are not in `keep`.
    fn prune_derived(&mut self, key: &str, keep: &[String]) {
        let current = self
            .state
            .graph
            .get(key)
            .map(|n| n.derived.clone())
            .unwrap_or_default();
        for child in current.iter().filter(|c| !keep.contains(c)) {
            self.delete_value(child);
        }
    }

    /// Re-evaluates pending values waiting on `key`.
    pub(super) fn resolve_pending(&mut self, key: &str) {
        for waiter in self.state.pending.waiting_on(key) {
            let Some(node) = self.state.graph.get(&waiter) else {
                self.state.pending.remove(&waiter);
                continue;
            };
            if node.state != ValueState::Pending {
                continue;
            }
            let unmet = self.state.graph.unmet(&node.deps);
            if unmet.is_empty() {
                let value = node.value.clone();
                let origin = node.origin;
                let parent = node.derived_from.clone();
                tracing::debug!(seq_num = self.ctx.seq_num, key = %waiter, resolved_by = key, "pending value is ready");
                self.set_value(&waiter, value, origin, parent.as_deref());
            } else {
                self.state.pending.add(waiter, unmet, self.ctx.seq_num);
            }
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn park(&mut self, key: &str, unmet: Vec<Dependency>) {
        if let Some(node) = self.state.graph.get_mut(key) {
            node.state = ValueState::Pending;
            node.error = None;
        }
        self.state.pending.add(key, unmet, self.ctx.seq_num);
    }

    #[allow(clippy::too_many_arguments)]
    fn fail(
        &mut self,
        key: &str,
        descriptor: &Arc<dyn KvDescriptor>,
        operation: TxnOperation,
        err: KvError,
        prev: Snapshot,
        recreate: bool,
        removing: bool,
    ) {
        let retriable = descriptor.is_retriable_failure(&err);
        let state = if retriable && self.ctx.retry_allowed {
            ValueState::Retrying
        } else {
            ValueState::Failed
        };
        tracing::warn!(
            seq_num = self.ctx.seq_num,
            key,
            descriptor = descriptor.name(),
            operation = %operation,
            retriable,
            error = %err,
            "operation failed"
        );

        if retriable {
            if let Some(intent) = self.retry_intent(key, removing) {
                self.ctx.retriable.push(intent);
            }
        }
        if let Some(node) = self.state.graph.get_mut(key) {
            node.state = state;
            node.error = Some(err.clone());
            node.last_op = operation;
        }
        self.ctx.errors.push(KeyWithError {
            key: key.to_string(),
            txn_operation: operation,
            error: err,
        });
        self.record(operation, key, prev, false, recreate);
    }

    /// Intent that re-applies a failed operation on `key`.
    ///
    /// Failures of derived values are retried through their parent.
    fn retry_intent(&self, key: &str, removing: bool) -> Option<RetryIntent> {
        let node = self.state.graph.get(key)?;
        if removing {
            return Some(RetryIntent {
                key: key.to_string(),
                value: None,
                intent_seq: node.intent_seq,
            });
        }
        let target = match &node.derived_from {
            Some(parent) => self.state.graph.get(parent)?,
            None => node,
        };
        Some(RetryIntent {
            key: target.key.clone(),
            value: Some(target.value.clone()),
            intent_seq: target.intent_seq,
        })
    }

    pub(super) fn owner_of(&self, key: &str) -> Option<Arc<dyn KvDescriptor>> {
        let name = self.state.graph.get(key)?.descriptor.as_deref()?;
        self.registry.get(name).cloned()
    }

    pub(super) fn store_metadata(
        &self,
        descriptor: &Arc<dyn KvDescriptor>,
        key: &str,
        metadata: Option<MetadataRef>,
    ) {
        if self.ctx.dry_run || !descriptor.with_metadata() {
            return;
        }
        let Some(map) = self.metadata.get(descriptor.name()) else {
            return;
        };
        let label = descriptor.key_label(key);
        match metadata {
            Some(metadata) => map.put(label, metadata),
            None => {
                map.delete(&label);
            }
        }
    }

    pub(super) fn upsert(
        &mut self,
        key: &str,
        value: ValueRef,
        origin: ValueOrigin,
        derived_from: Option<&str>,
        descriptor: Option<&Arc<dyn KvDescriptor>>,
        deps: Vec<Dependency>,
    ) {
        let descriptor = descriptor.map(|d| d.name().to_string());
        match self.state.graph.get_mut(key) {
            Some(node) => {
                node.value = value;
                node.origin = origin;
                node.removing = false;
                node.derived_from = derived_from.map(str::to_string);
                node.descriptor = descriptor;
                node.deps = deps;
            }
            None => {
                let mut node = Node::new(key, value, origin);
                node.intent_seq = self.ctx.seq_num;
                node.derived_from = derived_from.map(str::to_string);
                node.descriptor = descriptor;
                node.deps = deps;
                self.state.graph.insert(node);
            }
        }
    }

    fn snapshot(&self, key: &str) -> Snapshot {
        match self.state.graph.get(key) {
            Some(node) => Snapshot {
                state: node.state,
                value: node.applied.as_ref().map(describe),
                error: node.error.as_ref().map(ToString::to_string),
                is_derived: node.is_derived(),
                base: node.derived_from.clone().unwrap_or_else(|| key.to_string()),
            },
            None => Snapshot {
                state: ValueState::NonExistent,
                value: None,
                error: None,
                is_derived: false,
                base: key.to_string(),
            },
        }
    }

    fn record(&mut self, operation: TxnOperation, key: &str, prev: Snapshot, noop: bool, recreate: bool) {
        let (new_state, new_value, new_error, is_derived, base) = match self.state.graph.get(key) {
            Some(node) => (
                node.state,
                match operation {
                    TxnOperation::Delete => None,
                    _ => Some(describe(&node.value)),
                },
                node.error.as_ref().map(ToString::to_string),
                node.is_derived(),
                node.derived_from.clone().unwrap_or_else(|| key.to_string()),
            ),
            None => (ValueState::Removed, None, None, prev.is_derived, prev.base.clone()),
        };

        tracing::debug!(
            seq_num = self.ctx.seq_num,
            key,
            operation = %operation,
            prev_state = %prev.state,
            new_state = %new_state,
            noop,
            dry_run = self.ctx.dry_run,
            "executed operation"
        );

        self.ctx.changed.insert(base);
        self.ctx.ops.push(RecordedTxnOp {
            operation,
            key: key.to_string(),
            prev_value: prev.value,
            new_value,
            prev_state: prev.state,
            new_state,
            prev_error: prev.error,
            new_error,
            noop,
            is_derived,
            is_revert: self.ctx.is_revert,
            is_retry: self.ctx.is_retry,
            is_recreate: recreate,
        });
    }
}
