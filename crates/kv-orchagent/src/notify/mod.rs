//! Status notification publisher.
//!
//! Keeps the last `capacity` status notifications in a ring buffer and fans
//! every new notification out to the registered watchers. Delivery never
//! blocks: a watcher whose inbox is full misses the notification, which is
//! counted in its drop counter.

use chrono::{DateTime, Utc};
use kv_orch_common::BaseValueStatus;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Notification attribute: key of the base value.
pub const ATTR_KEY: &str = "key";
/// Notification attribute: state of the base value.
pub const ATTR_STATE: &str = "state";
/// Notification attribute: owning descriptor.
pub const ATTR_DESCRIPTOR: &str = "descriptor";
/// Notification attribute: sequence number of the transaction.
pub const ATTR_TXN_SEQ: &str = "txn_seq";
/// Notification attribute: last operation.
pub const ATTR_OPERATION: &str = "operation";
/// Notification attribute: error of the last operation.
pub const ATTR_ERROR: &str = "error";

/// One published status change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusNotification {
    /// Absolute index, increasing by one per notification
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub status: BaseValueStatus,
    /// Flat attributes matched against watcher filters
    pub attrs: BTreeMap<String, String>,
}

impl StatusNotification {
    /// Returns true if every filter entry equals the attribute of the same name.
    pub fn matches(&self, filter: &BTreeMap<String, String>) -> bool {
        filter
            .iter()
            .all(|(name, value)| self.attrs.get(name) == Some(value))
    }
}

/// Parameters of a new watch.
#[derive(Debug, Clone)]
pub struct WatchRequest {
    /// Replay retained notifications starting at this index
    pub from_index: Option<u64>,
    /// Attribute subset a notification must match
    pub filter: BTreeMap<String, String>,
    /// Inbox capacity
    pub capacity: usize,
}

impl Default for WatchRequest {
    fn default() -> Self {
        Self {
            from_index: None,
            filter: BTreeMap::new(),
            capacity: 100,
        }
    }
}

impl WatchRequest {
    pub fn from_index(mut self, index: u64) -> Self {
        self.from_index = Some(index);
        self
    }

    pub fn with_filter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter.insert(name.into(), value.into());
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Receiving side of a watch.
#[derive(Debug)]
pub struct Watcher {
    id: Uuid,
    rx: mpsc::Receiver<StatusNotification>,
    dropped: Arc<AtomicU64>,
}

impl Watcher {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Receives the next notification, `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<StatusNotification> {
        self.rx.recv().await
    }

    /// Receives a notification if one is queued.
    pub fn try_recv(&mut self) -> Option<StatusNotification> {
        self.rx.try_recv().ok()
    }

    /// Number of notifications dropped because the inbox was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Converts the watcher into its inbox.
    pub fn into_inner(self) -> mpsc::Receiver<StatusNotification> {
        self.rx
    }
}

struct WatcherEntry {
    id: Uuid,
    filter: BTreeMap<String, String>,
    tx: mpsc::Sender<StatusNotification>,
    dropped: Arc<AtomicU64>,
}

impl WatcherEntry {
    /// Offers a notification; returns false if the watcher is closed.
    fn offer(&self, notification: &StatusNotification) -> bool {
        if !notification.matches(&self.filter) {
            return true;
        }
        match self.tx.try_send(notification.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

struct PublisherInner {
    buffer: VecDeque<StatusNotification>,
    capacity: usize,
    next_index: u64,
    watchers: Vec<WatcherEntry>,
}

/// Ring-buffered status publisher. Cloning shares the buffer.
#[derive(Clone)]
pub struct StatusPublisher {
    inner: Arc<Mutex<PublisherInner>>,
}

impl StatusPublisher {
    /// Creates a publisher retaining the last `capacity` notifications.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PublisherInner {
                buffer: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                next_index: 0,
                watchers: Vec::new(),
            })),
        }
    }

    /// Appends a notification and offers it to every watcher.
    ///
    /// Returns the index assigned to the notification.
    pub fn publish(&self, status: BaseValueStatus, attrs: BTreeMap<String, String>) -> u64 {
        let mut inner = self.inner.lock();
        let index = inner.next_index;
        inner.next_index += 1;

        let notification = StatusNotification {
            index,
            timestamp: Utc::now(),
            status,
            attrs,
        };

        inner.watchers.retain(|w| {
            let open = w.offer(&notification);
            if !open {
                tracing::debug!(watcher = %w.id, "removing closed status watcher");
            }
            open
        });

        if inner.buffer.len() == inner.capacity {
            inner.buffer.pop_front();
        }
        inner.buffer.push_back(notification);
        index
    }

    /// Registers a watcher, replaying retained notifications first.
    pub fn watch(&self, request: WatchRequest) -> Watcher {
        let (tx, rx) = mpsc::channel(request.capacity.max(1));
        let entry = WatcherEntry {
            id: Uuid::new_v4(),
            filter: request.filter,
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };

        let mut inner = self.inner.lock();
        if let Some(from) = request.from_index {
            let oldest = inner.buffer.front().map_or(inner.next_index, |n| n.index);
            let from = from.max(oldest);
            for notification in inner.buffer.iter().filter(|n| n.index >= from) {
                entry.offer(notification);
            }
        }

        let watcher = Watcher {
            id: entry.id,
            rx,
            dropped: Arc::clone(&entry.dropped),
        };
        inner.watchers.push(entry);
        watcher
    }

    /// Index of the oldest retained notification, `None` if empty.
    pub fn oldest_index(&self) -> Option<u64> {
        self.inner.lock().buffer.front().map(|n| n.index)
    }

    /// Index that the next notification will get.
    pub fn next_index(&self) -> u64 {
        self.inner.lock().next_index
    }

    /// Returns retained notifications starting at `from_index` (clamped).
    pub fn replay(&self, from_index: u64) -> Vec<StatusNotification> {
        self.inner
            .lock()
            .buffer
            .iter()
            .filter(|n| n.index >= from_index)
            .cloned()
            .collect()
    }

    /// Number of registered watchers.
    pub fn watcher_count(&self) -> usize {
        self.inner.lock().watchers.len()
    }
}

impl std::fmt::Debug for StatusPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StatusPublisher")
            .field("capacity", &inner.capacity)
            .field("retained", &inner.buffer.len())
            .field("next_index", &inner.next_index)
            .field("watchers", &inner.watchers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv_orch_common::{ValueState, ValueStatus};
    use pretty_assertions::assert_eq;

    fn status(key: &str, state: ValueState) -> (BaseValueStatus, BTreeMap<String, String>) {
        let status = BaseValueStatus {
            value: ValueStatus {
                key: key.to_string(),
                state,
                ..Default::default()
            },
            derived_values: vec![],
        };
        let mut attrs = BTreeMap::new();
        attrs.insert(ATTR_KEY.to_string(), key.to_string());
        attrs.insert(ATTR_STATE.to_string(), state.to_string());
        (status, attrs)
    }

    fn publish(publisher: &StatusPublisher, key: &str, state: ValueState) -> u64 {
        let (status, attrs) = status(key, state);
        publisher.publish(status, attrs)
    }

    // ============================================================================
    // Ring buffer
    // ============================================================================

    #[test]
    fn test_ring_buffer_keeps_last_n() {
        let publisher = StatusPublisher::new(3);
        for i in 0..5 {
            assert_eq!(publish(&publisher, &format!("k{}", i), ValueState::Configured), i);
        }

        assert_eq!(publisher.oldest_index(), Some(2));
        assert_eq!(publisher.next_index(), 5);
        let replay = publisher.replay(0);
        assert_eq!(replay.len(), 3);
        assert_eq!(replay[0].status.value.key, "k2");
    }

    // ============================================================================
    // Watchers
    // ============================================================================

    #[tokio::test]
    async fn test_watcher_receives_live_notifications() {
        let publisher = StatusPublisher::new(10);
        let mut watcher = publisher.watch(WatchRequest::default());

        publish(&publisher, "a", ValueState::Pending);
        let n = watcher.recv().await.unwrap();
        assert_eq!(n.index, 0);
        assert_eq!(n.status.value.state, ValueState::Pending);
    }

    #[tokio::test]
    async fn test_replay_clamped_to_oldest() {
        let publisher = StatusPublisher::new(2);
        for key in ["a", "b", "c"] {
            publish(&publisher, key, ValueState::Configured);
        }

        let mut watcher = publisher.watch(WatchRequest::default().from_index(0));
        assert_eq!(watcher.recv().await.unwrap().index, 1);
        assert_eq!(watcher.recv().await.unwrap().index, 2);
        assert!(watcher.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_filter_applies_to_replay_and_live() {
        let publisher = StatusPublisher::new(10);
        publish(&publisher, "a", ValueState::Failed);
        publish(&publisher, "b", ValueState::Configured);

        let mut watcher = publisher.watch(
            WatchRequest::default()
                .from_index(0)
                .with_filter(ATTR_STATE, "FAILED"),
        );
        publish(&publisher, "c", ValueState::Configured);
        publish(&publisher, "d", ValueState::Failed);

        assert_eq!(watcher.recv().await.unwrap().status.value.key, "a");
        assert_eq!(watcher.recv().await.unwrap().status.value.key, "d");
        assert!(watcher.try_recv().is_none());
    }

    #[test]
    fn test_full_inbox_drops_without_blocking() {
        let publisher = StatusPublisher::new(10);
        let mut watcher = publisher.watch(WatchRequest::default().with_capacity(1));

        publish(&publisher, "a", ValueState::Configured);
        publish(&publisher, "b", ValueState::Configured);
        publish(&publisher, "c", ValueState::Configured);

        assert_eq!(watcher.dropped(), 2);
        assert_eq!(watcher.try_recv().unwrap().status.value.key, "a");
    }

    #[test]
    fn test_closed_watcher_removed_on_publish() {
        let publisher = StatusPublisher::new(10);
        let watcher = publisher.watch(WatchRequest::default());
        let _other = publisher.watch(WatchRequest::default());
        assert_eq!(publisher.watcher_count(), 2);

        drop(watcher);
        publish(&publisher, "a", ValueState::Configured);
        assert_eq!(publisher.watcher_count(), 1);
    }
}
