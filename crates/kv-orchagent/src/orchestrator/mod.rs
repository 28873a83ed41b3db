//! Orchestrator: merges northbound intents from several data sources and
//! commits them to the scheduler.
//!
//! ```text
//! watchers ──► aggregator ──┐
//!                            ├──► dispatcher ──► store + scheduler
//! configurator ─────────────┘
//! ```
//!
//! All pushes pass through one critical section covering both the store
//! mutation and the transaction commit, so transactions from different
//! sources never interleave.

mod initfile;
mod store;
mod watcher;

pub use initfile::{InitFileItem, InitFileRegistry};
pub use store::{Labels, Store, StoredValue};
pub use watcher::{Aggregator, ChannelWatcher, WatchEvent, Watcher};

use crate::error::OrchResult;
use crate::scheduler::KvScheduler;
use kv_orch_common::{
    BaseValueStatus, KeyIntent, KeyResult, ResyncType, RetryPolicy, TransactionError, TxnOptions,
    ValueRef,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Request-scoped decoration of a push.
#[derive(Debug, Clone, Default)]
pub struct PushContext {
    /// Data source of the push; the dispatcher default if unset
    pub data_src: Option<String>,
    pub resync: ResyncType,
    /// Labels attached to every key written by the push
    pub labels: Labels,
    /// Per-key labels, replacing `labels` for the keys listed
    pub key_labels: BTreeMap<String, Labels>,
    /// Retry policy; the dispatcher default if unset
    pub retry: Option<RetryPolicy>,
    pub description: Option<String>,
}

impl PushContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data_src(mut self, data_src: impl Into<String>) -> Self {
        self.data_src = Some(data_src.into());
        self
    }

    pub fn with_resync(mut self, resync: ResyncType) -> Self {
        self.resync = resync;
        self
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_key_labels(mut self, key: impl Into<String>, labels: Labels) -> Self {
        self.key_labels.insert(key.into(), labels);
        self
    }

    fn labels_for(&self, key: &str) -> Labels {
        self.key_labels
            .get(key)
            .unwrap_or(&self.labels)
            .clone()
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Outcome of one push.
#[derive(Debug, Clone, Default)]
pub struct PushResult {
    /// Sequence number of the committed transaction
    pub seq_num: u64,
    /// Per-key results, ordered by key
    pub results: Vec<KeyResult>,
    /// Aggregate of per-key errors
    pub error: Option<TransactionError>,
}

impl PushResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn get(&self, key: &str) -> Option<&KeyResult> {
        self.results.iter().find(|r| r.key == key)
    }
}

/// Serializes pushes from all data sources into scheduler transactions.
///
/// Cloning shares the dispatcher.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    scheduler: KvScheduler,
    store: Arc<RwLock<Store>>,
    push_lock: Arc<tokio::sync::Mutex<()>>,
    default_data_source: String,
    default_retry: Option<RetryPolicy>,
}

impl Dispatcher {
    pub fn new(
        scheduler: KvScheduler,
        default_data_source: impl Into<String>,
        default_retry: Option<RetryPolicy>,
    ) -> Self {
        Self {
            scheduler,
            store: Arc::new(RwLock::new(Store::new())),
            push_lock: Arc::new(tokio::sync::Mutex::new(())),
            default_data_source: default_data_source.into(),
            default_retry,
        }
    }

    pub fn scheduler(&self) -> &KvScheduler {
        &self.scheduler
    }

    pub fn default_data_source(&self) -> &str {
        &self.default_data_source
    }

    /// Writes intents into the store and commits the resulting change.
    ///
    /// A full (or upstream) resync replaces the slice of the pushing source
    /// and commits the whole merged store. Keys dropped from the slice are
    /// deleted unless another source still provides them. A downstream
    /// resync ignores the intents and re-applies the current desired state.
    pub async fn push_data(&self, ctx: PushContext, intents: Vec<KeyIntent>) -> OrchResult<PushResult> {
        let _guard = self.push_lock.lock().await;
        let source = ctx
            .data_src
            .clone()
            .unwrap_or_else(|| self.default_data_source.clone());

        let mut txn = self.scheduler.start_nb_transaction();
        match ctx.resync {
            ResyncType::FullResync | ResyncType::UpstreamResync => {
                let mut store = self.store.write();
                let previous: BTreeSet<String> = store.keys_of(&source).into_iter().collect();
                store.reset(&source);
                for intent in intents {
                    if let Some(value) = intent.value {
                        let labels = ctx.labels_for(&intent.key);
                        store.update(&source, intent.key, value, labels);
                    }
                }
                let merged = store.list_all();
                for key in previous.iter().filter(|key| !merged.contains_key(*key)) {
                    txn.set_value(key.clone(), None);
                }
                for (key, value) in merged {
                    txn.set_value(key, Some(value));
                }
            }
            ResyncType::DownstreamResync => {
                if !intents.is_empty() {
                    tracing::warn!(
                        source = %source,
                        count = intents.len(),
                        "downstream resync ignores pushed values"
                    );
                }
            }
            ResyncType::NotResync => {
                let mut store = self.store.write();
                for intent in intents {
                    match intent.value {
                        Some(value) => {
                            store.update(&source, intent.key.clone(), value, ctx.labels_for(&intent.key))
                        }
                        None => {
                            store.delete(&source, &intent.key);
                        }
                    }
                    // another source may still provide (or override) the key
                    let effective = store.resolve(&intent.key).map(|s| s.value.clone());
                    txn.set_value(intent.key, effective);
                }
            }
        }

        let description = ctx
            .description
            .clone()
            .unwrap_or_else(|| format!("push from {}", source));
        let mut options = TxnOptions::new()
            .with_resync(ctx.resync)
            .with_description(description);
        if let Some(retry) = ctx.retry.or(self.default_retry) {
            options = options.with_retry(retry);
        }

        tracing::debug!(
            source = %source,
            resync = %ctx.resync,
            keys = txn.len(),
            "committing push"
        );
        let result = txn.commit(options).await?;
        if let Some(err) = &result.error {
            tracing::warn!(source = %source, seq_num = result.seq_num, error = %err, "push finished with errors");
        }
        Ok(PushResult {
            seq_num: result.seq_num,
            results: result.results,
            error: result.error,
        })
    }

    /// Re-reads the device and repairs drift, keeping the desired state.
    pub async fn resync_downstream(&self) -> OrchResult<PushResult> {
        let ctx = PushContext::new()
            .with_resync(ResyncType::DownstreamResync)
            .with_description("periodic downstream resync");
        self.push_data(ctx, Vec::new()).await
    }

    /// Snapshot of the merged desired state.
    pub fn list_data(&self) -> BTreeMap<String, ValueRef> {
        self.store.read().list_all()
    }

    /// Snapshot of the labels of the merged desired state.
    pub fn list_labels(&self) -> BTreeMap<String, Labels> {
        self.store.read().list_labels()
    }

    /// Snapshot of one source's slice.
    pub fn list_source(&self, source: &str) -> Vec<String> {
        self.store.read().keys_of(source)
    }

    /// Scheduler status of the given keys.
    pub fn get_status(&self, keys: &[String]) -> Vec<BaseValueStatus> {
        keys.iter()
            .map(|key| self.scheduler.get_value_status(key))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::notify::StatusPublisher;
    use kv_orch_common::{
        downcast, value_ref, KvDescriptor, KvError, KvResult, MetadataRef, MetadataRegistry,
        ValueState,
    };
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    struct Counter {
        recorder: Arc<Recorder>,
    }

    impl KvDescriptor for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn is_key_owned(&self, key: &str) -> bool {
            key.starts_with("config/counter/")
        }

        fn nb_key_prefix(&self) -> Option<&str> {
            Some("config/counter/")
        }

        fn validate(&self, _key: &str, value: &ValueRef) -> KvResult<()> {
            match downcast::<u32>(value) {
                Some(0) => Err(KvError::invalid_value("zero", ["value"])),
                _ => Ok(()),
            }
        }

        fn create(&self, key: &str, _value: &ValueRef) -> KvResult<Option<MetadataRef>> {
            self.recorder.calls.lock().push(format!("create {}", key));
            Ok(None)
        }

        fn delete(&self, key: &str, _value: &ValueRef, _md: Option<&MetadataRef>) -> KvResult<()> {
            self.recorder.calls.lock().push(format!("delete {}", key));
            Ok(())
        }

        fn supports_update(&self) -> bool {
            true
        }

        fn update(
            &self,
            key: &str,
            _old: &ValueRef,
            _new: &ValueRef,
            _md: Option<&MetadataRef>,
        ) -> KvResult<Option<MetadataRef>> {
            self.recorder.calls.lock().push(format!("update {}", key));
            Ok(None)
        }
    }

    fn dispatcher() -> (Dispatcher, Arc<Recorder>) {
        let scheduler = KvScheduler::start(
            &SchedulerConfig::default(),
            StatusPublisher::new(16),
            MetadataRegistry::new(),
            CancellationToken::new(),
        );
        let recorder = Arc::new(Recorder::default());
        scheduler
            .register_descriptor(Arc::new(Counter {
                recorder: Arc::clone(&recorder),
            }))
            .unwrap();
        (Dispatcher::new(scheduler, "global", None), recorder)
    }

    fn put(name: &str, value: u32) -> KeyIntent {
        KeyIntent::put(format!("config/counter/{}", name), value_ref(value))
    }

    fn calls(recorder: &Recorder) -> Vec<String> {
        std::mem::take(&mut *recorder.calls.lock())
    }

    // ============================================================================
    // 1. Incremental Pushes
    // ============================================================================

    #[tokio::test]
    async fn test_incremental_put_and_delete() {
        let (dispatcher, recorder) = dispatcher();

        let result = dispatcher
            .push_data(PushContext::new(), vec![put("a", 1), put("b", 2)])
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(
            result.get("config/counter/a").unwrap().status.state,
            ValueState::Configured
        );
        assert_eq!(dispatcher.list_source("global").len(), 2);

        dispatcher
            .push_data(PushContext::new(), vec![KeyIntent::delete("config/counter/a")])
            .await
            .unwrap();
        assert_eq!(
            calls(&recorder),
            vec![
                "create config/counter/a",
                "create config/counter/b",
                "delete config/counter/a"
            ]
        );
        assert_eq!(dispatcher.list_data().len(), 1);
    }

    #[tokio::test]
    async fn test_labels_are_stored_per_key() {
        let (dispatcher, _) = dispatcher();
        let labels: Labels = [("team".to_string(), "net".to_string())].into_iter().collect();

        dispatcher
            .push_data(PushContext::new().with_labels(labels.clone()), vec![put("a", 1)])
            .await
            .unwrap();
        dispatcher
            .push_data(PushContext::new(), vec![put("b", 1)])
            .await
            .unwrap();

        let all = dispatcher.list_labels();
        assert_eq!(all["config/counter/a"], labels);
        assert!(all["config/counter/b"].is_empty());
    }

    #[tokio::test]
    async fn test_delete_falls_back_to_other_source() {
        let (dispatcher, recorder) = dispatcher();
        let etcd = PushContext::new().with_data_src("etcd");
        let grpc = PushContext::new().with_data_src("grpc");

        dispatcher.push_data(etcd.clone(), vec![put("a", 1)]).await.unwrap();
        dispatcher.push_data(grpc.clone(), vec![put("a", 2)]).await.unwrap();
        calls(&recorder);

        dispatcher
            .push_data(grpc, vec![KeyIntent::delete("config/counter/a")])
            .await
            .unwrap();
        assert_eq!(calls(&recorder), vec!["update config/counter/a"]);
        assert_eq!(downcast::<u32>(&dispatcher.list_data()["config/counter/a"]), Some(&1));
    }

    #[tokio::test]
    async fn test_invalid_value_reported_per_key() {
        let (dispatcher, recorder) = dispatcher();
        let result = dispatcher
            .push_data(PushContext::new(), vec![put("a", 0), put("b", 1)])
            .await
            .unwrap();

        let err = result.error.clone().unwrap();
        assert!(err.only_invalid_values());
        assert_eq!(result.get("config/counter/a").unwrap().status.state, ValueState::Invalid);
        assert_eq!(result.get("config/counter/b").unwrap().status.state, ValueState::Configured);
        assert_eq!(calls(&recorder), vec!["create config/counter/b"]);
    }

    // ============================================================================
    // 2. Full Resync
    // ============================================================================

    #[tokio::test]
    async fn test_full_resync_isolates_sources() {
        let (dispatcher, recorder) = dispatcher();
        dispatcher
            .push_data(PushContext::new().with_data_src("grpc-local"), vec![put("local", 1)])
            .await
            .unwrap();

        let etcd = PushContext::new()
            .with_data_src("etcd")
            .with_resync(ResyncType::FullResync);
        dispatcher
            .push_data(etcd.clone(), vec![put("a", 1), put("b", 1)])
            .await
            .unwrap();
        dispatcher.push_data(etcd, vec![put("b", 1)]).await.unwrap();

        let keys: Vec<String> = dispatcher.list_data().into_keys().collect();
        assert_eq!(keys, vec!["config/counter/b", "config/counter/local"]);
        assert_eq!(
            dispatcher.get_status(&["config/counter/local".to_string()])[0].value.state,
            ValueState::Configured
        );
        assert_eq!(
            calls(&recorder),
            vec![
                "create config/counter/local",
                "create config/counter/a",
                "create config/counter/b",
                "delete config/counter/a"
            ]
        );
    }

    #[tokio::test]
    async fn test_full_resync_twice_is_idempotent() {
        let (dispatcher, recorder) = dispatcher();
        let ctx = PushContext::new().with_resync(ResyncType::FullResync);

        dispatcher.push_data(ctx.clone(), vec![put("a", 1), put("b", 2)]).await.unwrap();
        assert_eq!(calls(&recorder).len(), 2);

        let second = dispatcher.push_data(ctx, vec![put("a", 1), put("b", 2)]).await.unwrap();
        assert!(second.is_success());
        assert!(calls(&recorder).is_empty());
    }

    #[tokio::test]
    async fn test_downstream_resync_keeps_desired_state() {
        let (dispatcher, _) = dispatcher();
        dispatcher.push_data(PushContext::new(), vec![put("a", 1)]).await.unwrap();

        let result = dispatcher.resync_downstream().await.unwrap();
        assert!(result.is_success());
        assert_eq!(dispatcher.list_data().len(), 1);
    }

    #[tokio::test]
    async fn test_push_after_shutdown_fails() {
        let (dispatcher, _) = dispatcher();
        dispatcher.scheduler().shutdown();
        let err = dispatcher
            .push_data(PushContext::new(), vec![put("a", 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::OrchestratorError::Scheduler(KvError::SchedulerClosed)));
    }
}
