//! KV scheduler.
//!
//! The scheduler keeps the dependency graph of all configured values and
//! converges the device to the requested state through the registered
//! descriptors. Transactions are queued and processed one at a time by a
//! single consumer task; callers wait for the outcome of their commit.
//!
//! ```text
//! commit ──► queue ──► consumer task ──► engine ──► descriptors
//!                            │
//!                            └──► status forwarder ──► publisher / watchers
//! ```

mod engine;
mod exec;
mod graph;
mod history;
mod refresh;
mod registry;

pub use engine::DumpView;

use crate::config::SchedulerConfig;
use crate::notify::{
    StatusPublisher, ATTR_DESCRIPTOR, ATTR_ERROR, ATTR_KEY, ATTR_OPERATION, ATTR_STATE,
    ATTR_TXN_SEQ,
};
use chrono::{DateTime, Utc};
use engine::{Engine, ScheduledRetry, StatusUpdate, TxnRequest};
use kv_orch_common::{
    BaseValueStatus, CommitResult, KeyIntent, KeySelector, KvDescriptor, KvError, KvResult,
    KvWithMetadata, MetadataReader, MetadataRef, MetadataRegistry, PendingEntry, RecordedTxn,
    TxnOptions, ValueRef,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

struct QueuedTxn {
    request: TxnRequest,
    cancel: Option<CancellationToken>,
    reply: Option<oneshot::Sender<KvResult<CommitResult>>>,
}

struct ValueWatcher {
    selector: Option<KeySelector>,
    tx: mpsc::Sender<BaseValueStatus>,
}

struct Inner {
    engine: RwLock<Engine>,
    txn_tx: mpsc::Sender<QueuedTxn>,
    status_tx: mpsc::UnboundedSender<StatusUpdate>,
    metadata_registry: MetadataRegistry,
    value_watchers: Arc<Mutex<Vec<ValueWatcher>>>,
    watcher_capacity: usize,
    shutdown: CancellationToken,
}

impl Inner {
    /// Enqueues a retry transaction after its delay.
    fn schedule_retry(&self, retry: ScheduledRetry) {
        let tx = self.txn_tx.clone();
        let shutdown = self.shutdown.clone();
        tracing::debug!(delay_ms = retry.delay.as_millis() as u64, "scheduling retry");
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(retry.delay) => {
                    let queued = QueuedTxn {
                        request: retry.request,
                        cancel: None,
                        reply: None,
                    };
                    if tx.send(queued).await.is_err() {
                        tracing::debug!("scheduler closed, dropping retry");
                    }
                }
            }
        });
    }
}

/// Handle of a running scheduler. Cloning shares the scheduler.
#[derive(Clone)]
pub struct KvScheduler {
    inner: Arc<Inner>,
}

impl KvScheduler {
    /// Starts the scheduler tasks on the current tokio runtime.
    ///
    /// The tasks stop when `shutdown` is cancelled.
    pub fn start(
        config: &SchedulerConfig,
        publisher: StatusPublisher,
        metadata_registry: MetadataRegistry,
        shutdown: CancellationToken,
    ) -> Self {
        let (txn_tx, txn_rx) = mpsc::channel(config.txn_queue_capacity.max(1));
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let value_watchers = Arc::new(Mutex::new(Vec::new()));

        let inner = Arc::new(Inner {
            engine: RwLock::new(Engine::new(config)),
            txn_tx,
            status_tx,
            metadata_registry,
            value_watchers: Arc::clone(&value_watchers),
            watcher_capacity: config.watcher_inbox_capacity.max(1),
            shutdown: shutdown.clone(),
        });

        tokio::spawn(run_txn_loop(Arc::clone(&inner), txn_rx));
        tokio::spawn(run_status_forwarder(status_rx, publisher, value_watchers, shutdown));

        tracing::info!(
            simulation = config.enable_txn_simulation,
            history = config.record_transaction_history,
            "scheduler started"
        );
        Self { inner }
    }

    /// Registers a descriptor. Descriptors should be registered before the
    /// first transaction that touches their keys.
    pub fn register_descriptor(&self, descriptor: Arc<dyn KvDescriptor>) -> KvResult<()> {
        self.inner
            .engine
            .write()
            .register(descriptor, &self.inner.metadata_registry)
    }

    /// Starts a new northbound transaction.
    pub fn start_nb_transaction(&self) -> NbTransaction {
        NbTransaction {
            scheduler: self.clone(),
            values: BTreeMap::new(),
        }
    }

    /// Reports a value created (or removed, with `None`) by the device itself.
    pub async fn push_sb_notification(
        &self,
        key: impl Into<String>,
        value: Option<ValueRef>,
        metadata: Option<MetadataRef>,
    ) -> KvResult<CommitResult> {
        let request = TxnRequest::Sb {
            key: key.into(),
            value,
            metadata,
        };
        self.submit(request, None, None).await
    }

    async fn submit(
        &self,
        request: TxnRequest,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> KvResult<CommitResult> {
        if self.inner.shutdown.is_cancelled() {
            return Err(KvError::SchedulerClosed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let queued = QueuedTxn {
            request,
            cancel: cancel.clone(),
            reply: Some(reply_tx),
        };

        let wait = async {
            if self.inner.txn_tx.send(queued).await.is_err() {
                return Err(KvError::SchedulerClosed);
            }
            match reply_rx.await {
                Ok(result) => result,
                Err(_) => Err(KvError::SchedulerClosed),
            }
        };
        let wait = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, wait).await {
                    Ok(result) => result,
                    Err(_) => Err(KvError::Timeout {
                        millis: limit.as_millis() as u64,
                    }),
                },
                None => wait.await,
            }
        };
        let cancelled = async {
            match &cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = wait => result,
            _ = cancelled => Err(KvError::Cancelled),
        }
    }

    /// Status of a base value with its derived values.
    pub fn get_value_status(&self, key: &str) -> BaseValueStatus {
        self.inner.engine.read().value_status(key)
    }

    /// Status of every base value matched by `selector` (all if `None`).
    pub fn get_value_statuses(&self, selector: Option<&KeySelector>) -> Vec<BaseValueStatus> {
        self.inner
            .engine
            .read()
            .base_statuses(|key| selector.map_or(true, |s| s(key)))
    }

    /// Subscribes to status changes of base values matched by `selector`.
    ///
    /// Updates are dropped when the receiver does not keep up.
    pub fn watch_value_status(&self, selector: Option<KeySelector>) -> mpsc::Receiver<BaseValueStatus> {
        let (tx, rx) = mpsc::channel(self.inner.watcher_capacity);
        self.inner
            .value_watchers
            .lock()
            .push(ValueWatcher { selector, tx });
        rx
    }

    /// Read-only metadata map of a descriptor.
    pub fn get_metadata_map(&self, descriptor: &str) -> Option<MetadataReader> {
        self.inner.metadata_registry.get(descriptor)
    }

    /// Registry of all metadata maps, for descriptors that look up others.
    pub fn metadata_registry(&self) -> MetadataRegistry {
        self.inner.metadata_registry.clone()
    }

    /// Key prefixes of all descriptors that accept NB values.
    pub fn registered_nb_key_prefixes(&self) -> Vec<String> {
        self.inner.engine.read().registry.nb_key_prefixes()
    }

    /// Names of the registered descriptors.
    pub fn descriptor_names(&self) -> Vec<String> {
        self.inner
            .engine
            .read()
            .registry
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }

    /// Dumps the values of one descriptor.
    ///
    /// The southbound view calls the descriptor's retrieve outside of the
    /// scheduler lock.
    pub fn dump_values(&self, descriptor: &str, view: DumpView) -> KvResult<Vec<KvWithMetadata>> {
        match view {
            DumpView::Southbound => {
                let input = self.inner.engine.read().retrieve_input(descriptor);
                let (handle, correlate) =
                    input.ok_or_else(|| KvError::internal(format!("unknown descriptor {}", descriptor)))?;
                match handle.retrieve(&correlate) {
                    Some(result) => result,
                    None => Err(KvError::unimplemented(descriptor, "retrieve")),
                }
            }
            view => {
                let engine = self.inner.engine.read();
                if engine.registry.get(descriptor).is_none() {
                    return Err(KvError::internal(format!("unknown descriptor {}", descriptor)));
                }
                Ok(engine.dump_cached(descriptor, view))
            }
        }
    }

    /// Recorded transactions started within `[since, until]`.
    pub fn transaction_history(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Vec<RecordedTxn> {
        self.inner.engine.read().history.range(since, until)
    }

    pub fn get_recorded_transaction(&self, seq_num: u64) -> Option<RecordedTxn> {
        self.inner.engine.read().history.get(seq_num)
    }

    /// Values waiting for their dependencies.
    pub fn pending_values(&self) -> Vec<PendingEntry> {
        self.inner.engine.read().pending_entries()
    }

    /// The dependency graph in Graphviz DOT format, for debugging.
    pub fn graph_dot(&self) -> String {
        self.inner.engine.read().graph_dot()
    }

    /// Stops the scheduler tasks. Queued transactions are dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl std::fmt::Debug for KvScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvScheduler")
            .field("descriptors", &self.descriptor_names())
            .field("closed", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

/// Northbound transaction being built.
pub struct NbTransaction {
    scheduler: KvScheduler,
    values: BTreeMap<String, Option<ValueRef>>,
}

impl NbTransaction {
    /// Sets (or with `None`, deletes) a value. A later call for the same key
    /// replaces the earlier one.
    pub fn set_value(&mut self, key: impl Into<String>, value: Option<ValueRef>) -> &mut Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Queues the transaction and waits for its outcome.
    ///
    /// A commit that times out or is cancelled while already being processed
    /// still completes in the scheduler.
    pub async fn commit(self, options: TxnOptions) -> KvResult<CommitResult> {
        let timeout = options.timeout;
        let cancel = options.cancel.clone();
        let values = self
            .values
            .into_iter()
            .map(|(key, value)| KeyIntent { key, value })
            .collect();
        self.scheduler
            .submit(TxnRequest::Nb { values, options }, timeout, cancel)
            .await
    }
}

async fn run_txn_loop(inner: Arc<Inner>, mut rx: mpsc::Receiver<QueuedTxn>) {
    loop {
        let queued = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            queued = rx.recv() => match queued {
                Some(queued) => queued,
                None => break,
            },
        };

        if queued.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            tracing::debug!("skipping cancelled transaction");
            if let Some(reply) = queued.reply {
                let _ = reply.send(Err(KvError::Cancelled));
            }
            continue;
        }

        let processed = inner.engine.write().process(queued.request);
        for update in processed.statuses {
            // the forwarder stops only on shutdown
            let _ = inner.status_tx.send(update);
        }
        if let Some(retry) = processed.retry {
            inner.schedule_retry(retry);
        }
        if let Some(reply) = queued.reply {
            let _ = reply.send(Ok(processed.result));
        }
    }
    tracing::info!("transaction loop stopped");
}

fn status_attrs(update: &StatusUpdate) -> BTreeMap<String, String> {
    let value = &update.status.value;
    let mut attrs = BTreeMap::new();
    attrs.insert(ATTR_KEY.to_string(), value.key.clone());
    attrs.insert(ATTR_STATE.to_string(), value.state.to_string());
    attrs.insert(ATTR_TXN_SEQ.to_string(), update.seq_num.to_string());
    attrs.insert(ATTR_OPERATION.to_string(), value.last_operation.to_string());
    if let Some(descriptor) = &update.descriptor {
        attrs.insert(ATTR_DESCRIPTOR.to_string(), descriptor.clone());
    }
    if let Some(error) = &value.error {
        attrs.insert(ATTR_ERROR.to_string(), error.clone());
    }
    attrs
}

async fn run_status_forwarder(
    mut rx: mpsc::UnboundedReceiver<StatusUpdate>,
    publisher: StatusPublisher,
    watchers: Arc<Mutex<Vec<ValueWatcher>>>,
    shutdown: CancellationToken,
) {
    let mut published: HashMap<String, u64> = HashMap::new();
    loop {
        let update = tokio::select! {
            _ = shutdown.cancelled() => break,
            update = rx.recv() => match update {
                Some(update) => update,
                None => break,
            },
        };

        let key = update.status.value.key.clone();
        publisher.publish(update.status.clone(), status_attrs(&update));
        *published.entry(key.clone()).or_default() += 1;

        watchers.lock().retain(|watcher| {
            if watcher.selector.as_ref().is_some_and(|s| !s(&key)) {
                return !watcher.tx.is_closed();
            }
            match watcher.tx.try_send(update.status.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(key = %key, "value status watcher is full, dropping update");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
    tracing::debug!(keys = published.len(), "status forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv_orch_common::{downcast, value_ref, Dependency, ValueState};
    use pretty_assertions::assert_eq;

    struct Toggle {
        prefix: &'static str,
        deps_on: Option<&'static str>,
    }

    impl KvDescriptor for Toggle {
        fn name(&self) -> &str {
            self.prefix.trim_end_matches('/')
        }

        fn is_key_owned(&self, key: &str) -> bool {
            key.starts_with(self.prefix)
        }

        fn nb_key_prefix(&self) -> Option<&str> {
            Some(self.prefix)
        }

        fn create(&self, _key: &str, value: &ValueRef) -> KvResult<Option<MetadataRef>> {
            match downcast::<bool>(value) {
                Some(true) => Ok(None),
                _ => Err(KvError::permanent("refused")),
            }
        }

        fn delete(&self, _key: &str, _value: &ValueRef, _md: Option<&MetadataRef>) -> KvResult<()> {
            Ok(())
        }

        fn dependencies(&self, _key: &str, _value: &ValueRef) -> Vec<Dependency> {
            self.deps_on
                .map(|key| vec![Dependency::on_key("needs", key)])
                .unwrap_or_default()
        }
    }

    fn scheduler() -> KvScheduler {
        let scheduler = KvScheduler::start(
            &SchedulerConfig::default(),
            StatusPublisher::new(16),
            MetadataRegistry::new(),
            CancellationToken::new(),
        );
        scheduler
            .register_descriptor(Arc::new(Toggle { prefix: "a/", deps_on: None }))
            .unwrap();
        scheduler
            .register_descriptor(Arc::new(Toggle { prefix: "b/", deps_on: Some("a/1") }))
            .unwrap();
        scheduler
    }

    #[tokio::test]
    async fn test_commit_returns_per_key_results() {
        let scheduler = scheduler();
        let mut txn = scheduler.start_nb_transaction();
        txn.set_value("a/1", Some(value_ref(true)))
            .set_value("a/2", Some(value_ref(false)));
        let result = txn.commit(TxnOptions::new()).await.unwrap();

        assert_eq!(result.get("a/1").unwrap().status.state, ValueState::Configured);
        assert_eq!(result.get("a/2").unwrap().status.state, ValueState::Failed);
        assert!(!result.is_success());
        assert_eq!(scheduler.get_value_status("a/1").value.state, ValueState::Configured);
        assert_eq!(scheduler.get_recorded_transaction(result.seq_num).unwrap().seq_num, 0);
    }

    #[tokio::test]
    async fn test_watch_value_status_with_selector() {
        let scheduler = scheduler();
        let selector: KeySelector = Arc::new(|key: &str| key.starts_with("b/"));
        let mut rx = scheduler.watch_value_status(Some(selector));

        let mut txn = scheduler.start_nb_transaction();
        txn.set_value("b/1", Some(value_ref(true)));
        txn.commit(TxnOptions::new()).await.unwrap();
        let update = rx.recv().await.unwrap();
        assert_eq!(update.value.key, "b/1");
        assert_eq!(update.value.state, ValueState::Pending);
        assert_eq!(scheduler.pending_values().len(), 1);

        let mut txn = scheduler.start_nb_transaction();
        txn.set_value("a/1", Some(value_ref(true)));
        txn.commit(TxnOptions::new()).await.unwrap();
        let update = rx.recv().await.unwrap();
        assert_eq!(update.value.state, ValueState::Configured);
    }

    #[tokio::test]
    async fn test_cancelled_commit() {
        let scheduler = scheduler();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut txn = scheduler.start_nb_transaction();
        txn.set_value("a/1", Some(value_ref(true)));
        let err = txn
            .commit(TxnOptions::new().with_cancel(cancel))
            .await
            .unwrap_err();
        assert_eq!(err, KvError::Cancelled);
    }

    #[tokio::test]
    async fn test_commit_after_shutdown() {
        let scheduler = scheduler();
        scheduler.shutdown();

        let mut txn = scheduler.start_nb_transaction();
        txn.set_value("a/1", Some(value_ref(true)));
        let err = txn.commit(TxnOptions::new()).await.unwrap_err();
        assert_eq!(err, KvError::SchedulerClosed);
    }

    #[tokio::test]
    async fn test_dump_views() {
        let scheduler = scheduler();
        let mut txn = scheduler.start_nb_transaction();
        txn.set_value("a/1", Some(value_ref(true)))
            .set_value("a/2", Some(value_ref(false)));
        txn.commit(TxnOptions::new()).await.unwrap();

        assert_eq!(scheduler.dump_values("a", DumpView::Northbound).unwrap().len(), 2);
        assert_eq!(scheduler.dump_values("a", DumpView::Cached).unwrap().len(), 1);
        assert!(scheduler.dump_values("a", DumpView::Southbound).is_err());
        assert!(scheduler.dump_values("zzz", DumpView::Cached).is_err());
        assert_eq!(
            scheduler.registered_nb_key_prefixes(),
            vec!["a/".to_string(), "b/".to_string()]
        );
    }
}
