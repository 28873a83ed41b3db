//! Agent implementation.

use crate::acl::{AclBindingDescriptor, AclDescriptor};
use crate::config::AgentConfig;
use crate::configurator::Configurator;
use crate::device::MockDevice;
use crate::error::OrchResult;
use crate::interface::{forward_device_events, InterfaceDescriptor};
use crate::models::{mock_models, ModelRegistry};
use crate::notify::StatusPublisher;
use crate::orchestrator::{Aggregator, Dispatcher, InitFileRegistry, Watcher};
use crate::scheduler::KvScheduler;
use itertools::Itertools;
use kv_orch_common::{DescriptorAdapter, KvDescriptor, KvError, MetadataRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Assembles an [`Agent`].
pub struct AgentBuilder {
    config: AgentConfig,
    device: MockDevice,
    models: ModelRegistry,
    descriptors: Vec<Arc<dyn KvDescriptor>>,
    watchers: Vec<Box<dyn Watcher>>,
}

impl AgentBuilder {
    /// Starts from the mock device descriptors and models.
    pub fn new(config: AgentConfig, device: MockDevice) -> Self {
        Self {
            config,
            device,
            models: mock_models(),
            descriptors: Vec::new(),
            watchers: Vec::new(),
        }
    }

    /// Registers an additional descriptor after the built-in ones.
    pub fn with_descriptor(mut self, descriptor: Arc<dyn KvDescriptor>) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Adds a northbound watcher to the aggregator.
    pub fn with_watcher(mut self, watcher: Box<dyn Watcher>) -> Self {
        self.watchers.push(watcher);
        self
    }

    /// Models available to the configurator and the init file.
    pub fn models_mut(&mut self) -> &mut ModelRegistry {
        &mut self.models
    }

    /// Starts the scheduler and wires the components. Must be called from
    /// within a tokio runtime.
    pub fn build(self) -> OrchResult<Agent> {
        self.config.validate()?;

        let scheduler_token = CancellationToken::new();
        let publisher = StatusPublisher::new(self.config.scheduler.status_buffer_size);
        let metadata = MetadataRegistry::new();
        let scheduler = KvScheduler::start(
            &self.config.scheduler,
            publisher.clone(),
            metadata.clone(),
            scheduler_token.clone(),
        );

        let builtin: [Arc<dyn KvDescriptor>; 3] = [
            DescriptorAdapter::boxed(InterfaceDescriptor::new(self.device.clone())),
            DescriptorAdapter::boxed(AclDescriptor::new(self.device.clone())),
            DescriptorAdapter::boxed(AclBindingDescriptor::new(self.device.clone(), metadata)),
        ];
        for descriptor in builtin.into_iter().chain(self.descriptors) {
            scheduler.register_descriptor(descriptor)?;
        }

        let models = Arc::new(self.models);
        let dispatcher = Dispatcher::new(
            scheduler.clone(),
            self.config.orchestrator.default_data_source.clone(),
            self.config.retry.default_policy(),
        );
        let configurator = Configurator::new(dispatcher.clone(), Arc::clone(&models), publisher.clone());

        let mut aggregator = Aggregator::new(dispatcher.clone());
        if let Some(path) = &self.config.orchestrator.init_file {
            let init = InitFileRegistry::load(path, &models, self.config.orchestrator.init_file_data_source.clone())?;
            info!(path = %path.display(), items = init.len(), "init file loaded");
            if !init.is_empty() {
                aggregator.add_watcher(Box::new(init));
            }
        }
        for watcher in self.watchers {
            aggregator.add_watcher(watcher);
        }

        info!(
            descriptors = %scheduler.descriptor_names().iter().join(", "),
            models = %models.names().iter().join(", "),
            watchers = aggregator.watcher_count(),
            "agent assembled"
        );
        Ok(Agent {
            config: self.config,
            device: self.device,
            scheduler,
            publisher,
            dispatcher,
            configurator,
            aggregator: Some(aggregator),
            scheduler_token,
        })
    }
}

/// The assembled agent.
pub struct Agent {
    config: AgentConfig,
    device: MockDevice,
    scheduler: KvScheduler,
    publisher: StatusPublisher,
    dispatcher: Dispatcher,
    configurator: Configurator,
    /// Taken by the first `run`
    aggregator: Option<Aggregator>,
    scheduler_token: CancellationToken,
}

impl Agent {
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn device(&self) -> &MockDevice {
        &self.device
    }

    pub fn scheduler(&self) -> &KvScheduler {
        &self.scheduler
    }

    pub fn publisher(&self) -> &StatusPublisher {
        &self.publisher
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn configurator(&self) -> &Configurator {
        &self.configurator
    }

    /// Runs the background tasks until `shutdown` is cancelled.
    ///
    /// Startup reads the device state with a downstream resync, then starts
    /// the aggregator, the device event forwarder and the periodic resync.
    /// The scheduler keeps running afterwards; see [`Agent::shutdown`].
    pub async fn run(&mut self, shutdown: CancellationToken) -> OrchResult<()> {
        info!("starting agent");
        match self.dispatcher.resync_downstream().await {
            Ok(result) if !result.is_success() => {
                warn!(seq_num = result.seq_num, "startup resync finished with errors")
            }
            Ok(result) => debug!(seq_num = result.seq_num, "startup resync done"),
            Err(err) => return Err(err),
        }

        let mut tasks = match self.aggregator.take() {
            Some(aggregator) => aggregator.start(shutdown.clone()),
            None => JoinSet::new(),
        };
        tasks.spawn(forward_device_events(
            self.scheduler.clone(),
            self.device.subscribe(),
            shutdown.clone(),
        ));
        if let Some(interval) = self.config.orchestrator.downstream_resync_interval() {
            tasks.spawn(run_periodic_resync(self.dispatcher.clone(), interval, shutdown.clone()));
        }

        info!("agent running");
        shutdown.cancelled().await;
        info!("stopping agent");
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "agent task failed");
            }
        }
        info!("agent stopped");
        Ok(())
    }

    /// Stops the scheduler. Later pushes fail with a closed-scheduler error.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.scheduler_token.cancel();
    }
}

async fn run_periodic_resync(dispatcher: Dispatcher, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // the first tick completes immediately and startup already resynced
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match dispatcher.resync_downstream().await {
            Ok(result) if !result.is_success() => {
                warn!(seq_num = result.seq_num, "downstream resync finished with errors")
            }
            Ok(_) => {}
            Err(crate::error::OrchestratorError::Scheduler(KvError::SchedulerClosed)) => break,
            Err(err) => warn!(error = %err, "downstream resync failed"),
        }
    }
    debug!("periodic resync stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceOp;
    use crate::interface::{interface_key, Interface, InterfaceType};
    use crate::orchestrator::{ChannelWatcher, WatchEvent};
    use kv_orch_common::{value_ref, KeyIntent, ValueState};
    use pretty_assertions::assert_eq;
    use std::io::Write;

    async fn wait_for_state(scheduler: &KvScheduler, key: &str, state: ValueState) {
        for _ in 0..200 {
            if scheduler.get_value_status(key).value.state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never reached {:?}: {:?}", key, state, scheduler.get_value_status(key));
    }

    // ============================================================================
    // 1. Assembly Tests
    // ============================================================================

    #[tokio::test]
    async fn test_builder_registers_mock_descriptors() {
        let agent = AgentBuilder::new(AgentConfig::default(), MockDevice::new())
            .build()
            .unwrap();
        assert_eq!(
            agent.scheduler().descriptor_names(),
            vec!["mock-interface", "mock-acl", "mock-acl-binding"]
        );
        assert_eq!(agent.configurator().models().names(), vec!["acl", "interface"]);
        agent.shutdown();
    }

    #[tokio::test]
    async fn test_builder_rejects_invalid_config() {
        let mut config = AgentConfig::default();
        config.scheduler.txn_queue_capacity = 0;
        assert!(AgentBuilder::new(config, MockDevice::new()).build().is_err());
    }

    #[tokio::test]
    async fn test_builder_reports_bad_init_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "items:\n  - model: bridge\n    data: {{}}").unwrap();

        let mut config = AgentConfig::default();
        config.orchestrator.init_file = Some(file.path().to_path_buf());
        assert!(AgentBuilder::new(config, MockDevice::new()).build().is_err());
    }

    // ============================================================================
    // 2. Lifecycle Tests
    // ============================================================================

    #[tokio::test]
    async fn test_run_applies_init_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "items:\n  - model: interface\n    data:\n      name: memif0\n      type: MEMIF\n      enabled: true"
        )
        .unwrap();
        let mut config = AgentConfig::default();
        config.orchestrator.init_file = Some(file.path().to_path_buf());

        let mut agent = AgentBuilder::new(config, MockDevice::new()).build().unwrap();
        let scheduler = agent.scheduler().clone();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            agent.run(token).await.unwrap();
            agent
        });

        wait_for_state(&scheduler, &interface_key("memif0"), ValueState::Configured).await;
        shutdown.cancel();
        let agent = handle.await.unwrap();
        assert!(agent.device().interface("memif0").is_some());
        assert_eq!(agent.dispatcher().list_source("initfile"), vec![interface_key("memif0")]);
        agent.shutdown();
    }

    #[tokio::test]
    async fn test_run_forwards_watcher_and_device_events() {
        let device = MockDevice::new();
        let (watcher, tx) = ChannelWatcher::new("etcd");
        let mut agent = AgentBuilder::new(AgentConfig::default(), device.clone())
            .with_watcher(Box::new(watcher))
            .build()
            .unwrap();
        let scheduler = agent.scheduler().clone();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { agent.run(token).await });

        tx.send(WatchEvent::Change {
            changes: vec![KeyIntent::put(
                interface_key("tap0"),
                value_ref(Interface::new("tap0", InterfaceType::Tap)),
            )],
        })
        .unwrap();
        wait_for_state(&scheduler, &interface_key("tap0"), ValueState::Configured).await;

        // give the forwarder time to subscribe before the device acts
        tokio::time::sleep(Duration::from_millis(50)).await;
        device.add_external_interface(Interface::new("loop0", InterfaceType::SoftwareLoopback));
        wait_for_state(&scheduler, &interface_key("loop0"), ValueState::Obtained).await;

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(device.calls_of(DeviceOp::CreateInterface), vec!["tap0"]);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_closes_scheduler() {
        let agent = AgentBuilder::new(AgentConfig::default(), MockDevice::new())
            .build()
            .unwrap();
        agent.shutdown();
        assert!(matches!(
            agent.dispatcher().resync_downstream().await,
            Err(crate::error::OrchestratorError::Scheduler(KvError::SchedulerClosed))
        ));
    }
}
