//! Transaction processing.
//!
//! The engine owns the graph and processes one queued transaction at a time:
//! it resolves the batch according to the resync type, optionally simulates
//! it on a copy of the graph, executes it, reverts it on failure when asked
//! to, and produces the commit result, the status updates and the history
//! record.

use super::exec::{describe, ExecState, Executor, RetryIntent, TxnContext};
use super::graph::Graph;
use super::history::TxnHistory;
use super::registry::DescriptorRegistry;
use crate::config::SchedulerConfig;
use chrono::{DateTime, Utc};
use kv_orch_common::{
    BaseValueStatus, CommitResult, KeyIntent, KeyResult, KvDescriptor, KvResult, KvWithMetadata,
    MetadataMap, MetadataRef, MetadataRegistry, PendingEntry, RecordedKv, RecordedRetry,
    RecordedTxn, RecordedTxnOp, ResyncType, RetryPolicy, TransactionError, TxnOperation,
    TxnOptions, TxnType, ValueOrigin, ValueRef, ValueState, ValueStatus,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Transaction waiting in the queue.
#[derive(Debug)]
pub(crate) enum TxnRequest {
    Nb {
        values: Vec<KeyIntent>,
        options: TxnOptions,
    },
    Sb {
        key: String,
        value: Option<ValueRef>,
        metadata: Option<MetadataRef>,
    },
    Retry {
        origin_seq: u64,
        attempt: u32,
        policy: RetryPolicy,
        intents: Vec<RetryIntent>,
    },
}

/// Status change of one base value.
#[derive(Debug, Clone)]
pub(crate) struct StatusUpdate {
    pub status: BaseValueStatus,
    pub descriptor: Option<String>,
    pub seq_num: u64,
}

/// Retry transaction to enqueue after `delay`.
#[derive(Debug)]
pub(crate) struct ScheduledRetry {
    pub delay: Duration,
    pub request: TxnRequest,
}

/// Outcome of one processed transaction.
#[derive(Debug, Default)]
pub(crate) struct Processed {
    pub result: CommitResult,
    pub statuses: Vec<StatusUpdate>,
    pub retry: Option<ScheduledRetry>,
}

/// Which values to dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpView {
    /// Values retrieved from the device now
    Southbound,
    /// Values requested by northbound sources
    Northbound,
    /// Values the scheduler believes to be applied
    Cached,
}

/// Everything needed to record a transaction besides its context.
struct TxnInfo {
    txn_type: TxnType,
    resync: ResyncType,
    description: String,
    start: DateTime<Utc>,
    retry: Option<RecordedRetry>,
    values: Vec<RecordedKv>,
    planned: Vec<RecordedTxnOp>,
    keys: Vec<String>,
}

pub(crate) struct Engine {
    pub registry: DescriptorRegistry,
    pub metadata: HashMap<String, MetadataMap>,
    pub state: ExecState,
    pub history: TxnHistory,
    next_seq: u64,
    /// First full resync has refreshed from the device
    device_refreshed: bool,
    simulate: bool,
    print_summary: bool,
}

impl Engine {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            registry: DescriptorRegistry::new(),
            metadata: HashMap::new(),
            state: ExecState::default(),
            history: TxnHistory::new(
                config.record_transaction_history,
                config.history_age_limit(),
                config.init_period(),
            ),
            next_seq: 0,
            device_refreshed: false,
            simulate: config.enable_txn_simulation,
            print_summary: config.print_txn_summary,
        }
    }

    pub fn register(
        &mut self,
        descriptor: Arc<dyn KvDescriptor>,
        metadata_registry: &MetadataRegistry,
    ) -> KvResult<()> {
        let name = descriptor.name().to_string();
        let with_metadata = descriptor.with_metadata();
        self.registry.register(descriptor)?;
        if with_metadata {
            let map = MetadataMap::new(&name);
            metadata_registry.register(&map);
            self.metadata.insert(name.clone(), map);
        }
        tracing::info!(descriptor = %name, with_metadata, "registered descriptor");
        Ok(())
    }

    pub fn process(&mut self, request: TxnRequest) -> Processed {
        match request {
            TxnRequest::Nb { values, options } => self.process_nb(values, options),
            TxnRequest::Sb {
                key,
                value,
                metadata,
            } => self.process_sb(key, value, metadata),
            TxnRequest::Retry {
                origin_seq,
                attempt,
                policy,
                intents,
            } => self.process_retry(origin_seq, attempt, policy, intents),
        }
    }

    fn allocate_seq(&mut self) -> u64 {
        let seq_num = self.next_seq;
        self.next_seq += 1;
        seq_num
    }

    // ========================================================================
    // Northbound transactions
    // ========================================================================

    fn process_nb(&mut self, values: Vec<KeyIntent>, options: TxnOptions) -> Processed {
        let seq_num = self.allocate_seq();
        let start = Utc::now();
        let resync = options.resync;
        let retry_allowed = options.retry.is_some_and(|policy| policy.allows(0));

        let intents: BTreeMap<String, Option<ValueRef>> =
            values.into_iter().map(|i| (i.key, i.value)).collect();

        let refresh_nb = match resync {
            ResyncType::FullResync if !self.device_refreshed => {
                self.device_refreshed = true;
                Some(
                    intents
                        .iter()
                        .filter_map(|(k, v)| v.clone().map(|v| (k.clone(), v)))
                        .collect::<BTreeMap<_, _>>(),
                )
            }
            _ => None,
        };
        let refresh = refresh_nb.is_some() || resync == ResyncType::DownstreamResync;

        // planned ops include the refresh
        let planned = if self.simulate {
            let mut state = self.state.clone();
            let mut ctx = TxnContext::dry_run(seq_num);
            ctx.retry_allowed = retry_allowed;
            let mut exec = Executor::new(&self.registry, &self.metadata, &mut state, &mut ctx);
            if refresh {
                exec.refresh(refresh_nb.as_ref(), false);
            }
            let batch = resolve_batch(&exec.state.graph, resync, &intents);
            for (key, value) in batch {
                exec.apply_nb(&key, value);
            }
            ctx.ops
        } else {
            Vec::new()
        };

        let mut ctx = TxnContext::new(seq_num);
        ctx.retry_allowed = retry_allowed;

        let batch = {
            let mut exec = Executor::new(&self.registry, &self.metadata, &mut self.state, &mut ctx);
            if refresh {
                exec.refresh(refresh_nb.as_ref(), options.verbose_refresh);
            }
            resolve_batch(&exec.state.graph, resync, &intents)
        };

        let previous: Vec<(String, Option<ValueRef>)> = batch
            .iter()
            .map(|(key, _)| {
                let prev = self
                    .state
                    .graph
                    .get(key)
                    .filter(|n| n.is_nb_base() && !n.removing && n.state != ValueState::Discovered)
                    .map(|n| n.value.clone());
                (key.clone(), prev)
            })
            .collect();

        {
            let mut exec = Executor::new(&self.registry, &self.metadata, &mut self.state, &mut ctx);
            for (key, value) in &batch {
                exec.apply_nb(key, value.clone());
            }

            if options.revert_on_failure && !exec.ctx.errors.is_empty() {
                tracing::warn!(seq_num, errors = exec.ctx.errors.len(), "transaction failed, reverting");
                exec.ctx.is_revert = true;
                exec.ctx.retry_allowed = false;
                for (key, value) in previous.iter().rev() {
                    exec.apply_nb(key, value.clone());
                }
                exec.ctx.retriable.clear();
            }

            if resync == ResyncType::DownstreamResync && options.verify_with_retrieve {
                let mismatches = exec.verify();
                if mismatches > 0 {
                    tracing::warn!(seq_num, mismatches, "device state differs from the intent after resync");
                }
            }
        }

        let retry = match options.retry {
            Some(policy) if retry_allowed && !ctx.retriable.is_empty() => Some(ScheduledRetry {
                delay: policy.delay(1),
                request: TxnRequest::Retry {
                    origin_seq: seq_num,
                    attempt: 1,
                    policy,
                    intents: dedup_retries(std::mem::take(&mut ctx.retriable)),
                },
            }),
            _ => None,
        };

        let info = TxnInfo {
            txn_type: TxnType::NbTransaction,
            resync,
            description: options.description,
            start,
            retry: None,
            values: batch
                .iter()
                .map(|(key, value)| RecordedKv {
                    key: key.clone(),
                    value: value.as_ref().map(describe),
                })
                .collect(),
            planned,
            keys: batch.into_iter().map(|(key, _)| key).collect(),
        };
        let mut processed = self.finish(ctx, info);
        processed.retry = retry;
        processed
    }

    // ========================================================================
    // Southbound notifications
    // ========================================================================

    fn process_sb(&mut self, key: String, value: Option<ValueRef>, metadata: Option<MetadataRef>) -> Processed {
        let seq_num = self.allocate_seq();
        let start = Utc::now();
        let mut ctx = TxnContext::new(seq_num);

        let recorded = RecordedKv {
            key: key.clone(),
            value: value.as_ref().map(describe),
        };
        Executor::new(&self.registry, &self.metadata, &mut self.state, &mut ctx)
            .apply_sb(&key, value, metadata);

        self.finish(
            ctx,
            TxnInfo {
                txn_type: TxnType::SbNotification,
                resync: ResyncType::NotResync,
                description: String::new(),
                start,
                retry: None,
                values: vec![recorded],
                planned: Vec::new(),
                keys: vec![key],
            },
        )
    }

    // ========================================================================
    // Retries
    // ========================================================================

    fn process_retry(
        &mut self,
        origin_seq: u64,
        attempt: u32,
        policy: RetryPolicy,
        intents: Vec<RetryIntent>,
    ) -> Processed {
        // a newer intent on the same key supersedes the retry
        let live: Vec<RetryIntent> = intents
            .into_iter()
            .filter(|intent| {
                let live = self
                    .state
                    .graph
                    .get(&intent.key)
                    .is_some_and(|n| n.intent_seq == intent.intent_seq);
                if !live {
                    tracing::debug!(key = %intent.key, origin_seq, "retry superseded by a newer intent");
                }
                live
            })
            .collect();
        if live.is_empty() {
            return Processed::default();
        }

        let seq_num = self.allocate_seq();
        let start = Utc::now();
        let mut ctx = TxnContext::new(seq_num);
        ctx.is_retry = true;
        ctx.retry_allowed = policy.allows(attempt);
        tracing::info!(seq_num, origin_seq, attempt, keys = live.len(), "retrying failed operations");

        {
            let mut exec = Executor::new(&self.registry, &self.metadata, &mut self.state, &mut ctx);
            for intent in &live {
                match &intent.value {
                    Some(value) => {
                        let (origin, parent) = exec
                            .state
                            .graph
                            .get(&intent.key)
                            .map(|n| (n.origin, n.derived_from.clone()))
                            .unwrap_or((ValueOrigin::FromNb, None));
                        exec.set_value(&intent.key, value.clone(), origin, parent.as_deref());
                    }
                    None => exec.delete_value(&intent.key),
                }
            }
        }

        let retry = if ctx.retry_allowed && !ctx.retriable.is_empty() {
            Some(ScheduledRetry {
                delay: policy.delay(attempt + 1),
                request: TxnRequest::Retry {
                    origin_seq,
                    attempt: attempt + 1,
                    policy,
                    intents: dedup_retries(std::mem::take(&mut ctx.retriable)),
                },
            })
        } else {
            None
        };

        let info = TxnInfo {
            txn_type: TxnType::RetryFailedOps,
            resync: ResyncType::NotResync,
            description: String::new(),
            start,
            retry: Some(RecordedRetry {
                txn_seq_num: origin_seq,
                attempt,
            }),
            values: live
                .iter()
                .map(|intent| RecordedKv {
                    key: intent.key.clone(),
                    value: intent.value.as_ref().map(describe),
                })
                .collect(),
            planned: Vec::new(),
            keys: live.into_iter().map(|intent| intent.key).collect(),
        };
        let mut processed = self.finish(ctx, info);
        processed.retry = retry;
        processed
    }

    // ========================================================================
    // Results
    // ========================================================================

    fn finish(&mut self, ctx: TxnContext, info: TxnInfo) -> Processed {
        let seq_num = ctx.seq_num;
        let graph = &self.state.graph;
        let pending = &self.state.pending;
        let labels = |key: &str| pending.get(key).map(|e| e.labels()).unwrap_or_default();

        let keys: BTreeSet<String> = info.keys.into_iter().collect();
        let results = keys
            .iter()
            .map(|key| {
                let status = if graph.contains(key) {
                    graph.value_status(key, labels(key))
                } else if ctx.removed.contains(key) {
                    removed_status(key)
                } else {
                    ValueStatus::nonexistent(key.clone())
                };
                let error = graph
                    .get(key)
                    .filter(|n| n.state.is_failed())
                    .and_then(|n| n.error.clone());
                KeyResult {
                    key: key.clone(),
                    status,
                    error,
                }
            })
            .collect();

        let statuses = ctx
            .changed
            .iter()
            .map(|base| {
                let status = if graph.contains(base) {
                    graph.base_status(base, labels)
                } else {
                    BaseValueStatus {
                        value: removed_status(base),
                        derived_values: Vec::new(),
                    }
                };
                let descriptor = graph
                    .get(base)
                    .and_then(|n| n.descriptor.clone())
                    .or_else(|| self.registry.owner(base).map(|d| d.name().to_string()));
                StatusUpdate {
                    status,
                    descriptor,
                    seq_num,
                }
            })
            .collect();

        let record = RecordedTxn {
            seq_num,
            txn_type: info.txn_type,
            resync_type: info.resync,
            description: info.description,
            start: info.start,
            stop: Utc::now(),
            retry: info.retry,
            values: info.values,
            planned: info.planned,
            executed: ctx.ops,
        };
        let (creates, updates, deletes) = record.operation_counts();
        tracing::info!(
            seq_num,
            txn_type = %record.txn_type,
            resync = %record.resync_type,
            creates,
            updates,
            deletes,
            errors = ctx.errors.len(),
            "transaction processed"
        );
        if self.print_summary && !record.executed.is_empty() {
            tracing::info!("\n{}", record.to_text());
        }
        self.history.push(record);

        Processed {
            result: CommitResult {
                seq_num,
                results,
                error: TransactionError::from_errors(seq_num, ctx.errors),
            },
            statuses,
            retry: None,
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn value_status(&self, key: &str) -> BaseValueStatus {
        let pending = &self.state.pending;
        self.state
            .graph
            .base_status(key, |k| pending.get(k).map(|e| e.labels()).unwrap_or_default())
    }

    /// Statuses of every base value matched by `selector`.
    pub fn base_statuses<F>(&self, selector: F) -> Vec<BaseValueStatus>
    where
        F: Fn(&str) -> bool,
    {
        self.state
            .graph
            .nodes()
            .filter(|n| !n.is_derived() && selector(&n.key))
            .map(|n| self.value_status(&n.key))
            .collect()
    }

    pub fn pending_entries(&self) -> Vec<PendingEntry> {
        self.state.pending.iter().cloned().collect()
    }

    /// Values of `descriptor` known to the graph.
    pub fn dump_cached(&self, descriptor: &str, view: DumpView) -> Vec<KvWithMetadata> {
        self.state
            .graph
            .nodes()
            .filter(|n| n.descriptor.as_deref() == Some(descriptor))
            .filter_map(|n| match view {
                DumpView::Northbound => (n.origin == ValueOrigin::FromNb && !n.removing).then(|| {
                    let mut kv = KvWithMetadata::new(n.key.clone(), n.value.clone(), n.origin);
                    kv.metadata = n.metadata.clone();
                    kv
                }),
                _ => n.applied.as_ref().map(|applied| {
                    let mut kv = KvWithMetadata::new(n.key.clone(), applied.clone(), n.origin);
                    kv.metadata = n.metadata.clone();
                    kv
                }),
            })
            .collect()
    }

    pub fn graph_dot(&self) -> String {
        self.state.graph.to_dot()
    }

    /// Descriptor with the values to correlate a retrieve with.
    pub fn retrieve_input(&self, descriptor: &str) -> Option<(Arc<dyn KvDescriptor>, Vec<KvWithMetadata>)> {
        let handle = self.registry.get(descriptor)?.clone();
        let correlate = self.dump_cached(descriptor, DumpView::Cached);
        Some((handle, correlate))
    }
}

fn removed_status(key: &str) -> ValueStatus {
    ValueStatus {
        key: key.to_string(),
        state: ValueState::Removed,
        last_operation: TxnOperation::Delete,
        ..Default::default()
    }
}

/// Keeps the last retry intent per key.
fn dedup_retries(intents: Vec<RetryIntent>) -> Vec<RetryIntent> {
    let mut by_key: BTreeMap<String, RetryIntent> = BTreeMap::new();
    for intent in intents {
        by_key.insert(intent.key.clone(), intent);
    }
    by_key.into_values().collect()
}

/// Expands the requested intents into the effective batch.
///
/// Deletions come first, then sets, each in key order.
fn resolve_batch(
    graph: &Graph,
    resync: ResyncType,
    intents: &BTreeMap<String, Option<ValueRef>>,
) -> Vec<(String, Option<ValueRef>)> {
    let batch: BTreeMap<String, Option<ValueRef>> = match resync {
        ResyncType::NotResync => intents.clone(),
        ResyncType::FullResync | ResyncType::UpstreamResync => {
            let mut batch = intents.clone();
            for key in graph.nb_base_keys() {
                batch.entry(key).or_insert(None);
            }
            batch
        }
        // a failed removal is not retried, the value stays Failed until the
        // next NB intent for its key
        ResyncType::DownstreamResync => graph
            .nodes()
            .filter(|n| n.is_nb_base() && !n.removing)
            .map(|n| {
                let value = (n.state != ValueState::Discovered).then(|| n.value.clone());
                (n.key.clone(), value)
            })
            .collect(),
    };

    let (deletes, sets): (Vec<_>, Vec<_>) = batch.into_iter().partition(|(_, v)| v.is_none());
    deletes.into_iter().chain(sets).collect()
}
