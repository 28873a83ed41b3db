//! Northbound watchers and the aggregator feeding them to the dispatcher.
//!
//! Each watcher runs on its own task pair: a reader pulling events from the
//! watcher and a pusher that coalesces everything queued since the last push
//! before handing it to the dispatcher. A slow transaction therefore never
//! blocks a watcher, and bursts of changes to one key collapse into a single
//! intent.

use super::{Dispatcher, PushContext};
use crate::error::OrchResult;
use async_trait::async_trait;
use kv_orch_common::{ChangeQueue, KeyIntent, KvError, ResyncType};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Event delivered by a watcher.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// Incremental changes
    Change { changes: Vec<KeyIntent> },
    /// Complete state of the watcher's data source
    Resync { items: Vec<KeyIntent> },
}

/// Stream of northbound changes from one data source.
#[async_trait]
pub trait Watcher: Send + 'static {
    /// Data source the changes are attributed to.
    fn data_source(&self) -> &str;

    /// Called once before the first event with the key prefixes the
    /// scheduler accepts.
    async fn start(&mut self, _key_prefixes: &[String]) -> OrchResult<()> {
        Ok(())
    }

    /// Next event, `None` once the watcher is exhausted.
    async fn next_event(&mut self) -> Option<WatchEvent>;
}

/// Watcher fed through a channel.
#[derive(Debug)]
pub struct ChannelWatcher {
    data_source: String,
    rx: mpsc::UnboundedReceiver<WatchEvent>,
    key_prefixes: Vec<String>,
}

impl ChannelWatcher {
    /// Creates the watcher and the sender that feeds it.
    pub fn new(data_source: impl Into<String>) -> (Self, mpsc::UnboundedSender<WatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = Self {
            data_source: data_source.into(),
            rx,
            key_prefixes: Vec::new(),
        };
        (watcher, tx)
    }

    fn is_watched(&self, key: &str) -> bool {
        self.key_prefixes.is_empty() || self.key_prefixes.iter().any(|p| key.starts_with(p))
    }

    fn filter(&self, intents: Vec<KeyIntent>) -> Vec<KeyIntent> {
        let (watched, ignored): (Vec<_>, Vec<_>) =
            intents.into_iter().partition(|i| self.is_watched(&i.key));
        for intent in ignored {
            tracing::debug!(source = %self.data_source, key = %intent.key, "ignoring unwatched key");
        }
        watched
    }
}

#[async_trait]
impl Watcher for ChannelWatcher {
    fn data_source(&self) -> &str {
        &self.data_source
    }

    async fn start(&mut self, key_prefixes: &[String]) -> OrchResult<()> {
        self.key_prefixes = key_prefixes.to_vec();
        Ok(())
    }

    async fn next_event(&mut self) -> Option<WatchEvent> {
        let event = self.rx.recv().await?;
        Some(match event {
            WatchEvent::Change { changes } => WatchEvent::Change {
                changes: self.filter(changes),
            },
            WatchEvent::Resync { items } => WatchEvent::Resync {
                items: self.filter(items),
            },
        })
    }
}

/// Runs watchers and pushes their events through the dispatcher.
pub struct Aggregator {
    dispatcher: Dispatcher,
    watchers: Vec<Box<dyn Watcher>>,
}

impl Aggregator {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            watchers: Vec::new(),
        }
    }

    pub fn add_watcher(&mut self, watcher: Box<dyn Watcher>) {
        tracing::info!(source = %watcher.data_source(), "watcher registered");
        self.watchers.push(watcher);
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    /// Spawns the watcher tasks. They stop when their watcher is exhausted
    /// or on `shutdown`.
    pub fn start(self, shutdown: CancellationToken) -> JoinSet<()> {
        let key_prefixes = self.dispatcher.scheduler().registered_nb_key_prefixes();
        let mut tasks = JoinSet::new();
        for watcher in self.watchers {
            let (tx, rx) = mpsc::unbounded_channel();
            let source = watcher.data_source().to_string();
            tasks.spawn(read_events(watcher, key_prefixes.clone(), tx, shutdown.clone()));
            tasks.spawn(push_events(self.dispatcher.clone(), source, rx, shutdown.clone()));
        }
        tasks
    }
}

async fn read_events(
    mut watcher: Box<dyn Watcher>,
    key_prefixes: Vec<String>,
    tx: mpsc::UnboundedSender<WatchEvent>,
    shutdown: CancellationToken,
) {
    if let Err(err) = watcher.start(&key_prefixes).await {
        tracing::error!(source = %watcher.data_source(), error = %err, "watcher failed to start");
        return;
    }
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = watcher.next_event() => event,
        };
        let Some(event) = event else {
            tracing::debug!(source = %watcher.data_source(), "watcher exhausted");
            break;
        };
        if tx.send(event).is_err() {
            break;
        }
    }
}

async fn push_events(
    dispatcher: Dispatcher,
    source: String,
    mut rx: mpsc::UnboundedReceiver<WatchEvent>,
    shutdown: CancellationToken,
) {
    let mut queue = ChangeQueue::new(source.clone());
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => event,
        };
        let Some(event) = event else {
            break;
        };

        // collect everything that arrived meanwhile
        let mut resync = None;
        let mut next = Some(event);
        while let Some(event) = next {
            match event {
                WatchEvent::Resync { items } => {
                    queue.clear();
                    resync = Some(items);
                }
                WatchEvent::Change { changes } => queue.add(changes),
            }
            next = rx.try_recv().ok();
        }

        if let Some(items) = resync {
            let ctx = PushContext::new()
                .with_data_src(source.clone())
                .with_resync(ResyncType::FullResync)
                .with_description(format!("resync of {}", source));
            if !push(&dispatcher, ctx, items, &mut queue).await {
                break;
            }
        }
        if queue.has_pending() {
            let changes = queue.drain();
            let ctx = PushContext::new().with_data_src(source.clone());
            if !push(&dispatcher, ctx, changes, &mut queue).await {
                break;
            }
        }
    }
    if queue.coalesced() > 0 {
        tracing::debug!(source = %source, coalesced = queue.coalesced(), "watcher pusher stopped");
    }
}

/// Returns false once the scheduler is gone.
async fn push(dispatcher: &Dispatcher, ctx: PushContext, intents: Vec<KeyIntent>, queue: &mut ChangeQueue) -> bool {
    let incremental = ctx.resync == ResyncType::NotResync;
    match dispatcher.push_data(ctx, intents.clone()).await {
        Ok(_) => true,
        Err(crate::error::OrchestratorError::Scheduler(KvError::SchedulerClosed)) => false,
        Err(err) => {
            tracing::warn!(source = %queue.source(), error = %err, "push failed");
            if incremental {
                for intent in intents {
                    queue.requeue(intent);
                }
            }
            true
        }
    }
}
