//! Northbound configurator service.
//!
//! Typed request/response API over the dispatcher, the model registry and
//! the status publisher. Errors are reported as `tonic::Status` so the
//! service can be mounted behind a gRPC transport unchanged.

use crate::error::OrchestratorError;
use crate::models::ModelRegistry;
use crate::notify::{StatusNotification, StatusPublisher, WatchRequest};
use crate::orchestrator::{Dispatcher, Labels, PushContext, PushResult};
use crate::scheduler::DumpView;
use kv_orch_common::{
    strip_key_prefix, BaseValueStatus, KeyIntent, KvError, ResyncType, ValueOrigin, ValueStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

/// Data source of configurator pushes when the request names none.
pub const DEFAULT_DATA_SOURCE: &str = "grpc";

/// Identifies an item by model and name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemId {
    pub model: String,
    pub name: String,
}

impl ItemId {
    pub fn new(model: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            name: name.into(),
        }
    }
}

/// One configuration item. An item without data is a delete.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateItem {
    pub item: Item,
    #[serde(default)]
    pub labels: Labels,
}

impl UpdateItem {
    /// Upsert of `data` under `model`.
    pub fn put(model: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            item: Item {
                id: ItemId::new(model, ""),
                data: Some(data),
            },
            labels: Labels::new(),
        }
    }

    /// Delete of the item `name` of `model`.
    pub fn delete(model: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            item: Item {
                id: ItemId::new(model, name),
                data: None,
            },
            labels: Labels::new(),
        }
    }

    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetConfigRequest {
    pub updates: Vec<UpdateItem>,
    /// Replace everything previously pushed by the data source
    #[serde(default)]
    pub overwrite_all: bool,
    #[serde(default)]
    pub data_source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateResult {
    pub key: String,
    pub status: ValueStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SetConfigResponse {
    pub results: Vec<UpdateResult>,
}

impl SetConfigResponse {
    pub fn get(&self, key: &str) -> Option<&UpdateResult> {
        self.results.iter().find(|r| r.key == key)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetConfigRequest {
    /// Items to return; all items if empty
    #[serde(default)]
    pub ids: Vec<ItemId>,
    /// Label subset an item must carry
    #[serde(default)]
    pub labels: Labels,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigItem {
    pub key: String,
    pub item: Item,
    pub labels: Labels,
    pub status: BaseValueStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GetConfigResponse {
    pub items: Vec<ConfigItem>,
}

/// One value as read from the southbound.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateItem {
    pub key: String,
    pub descriptor: String,
    pub origin: ValueOrigin,
    /// Model encoding of the value, or its debug rendering if no model
    /// covers the key
    pub data: serde_json::Value,
    pub has_metadata: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DumpStateResponse {
    pub items: Vec<StateItem>,
}

/// Stream of status notifications returned by [`Configurator::watch_notifications`].
pub type NotificationStream = ReceiverStream<StatusNotification>;

/// Northbound configuration service.
#[derive(Debug, Clone)]
pub struct Configurator {
    dispatcher: Dispatcher,
    models: Arc<ModelRegistry>,
    publisher: StatusPublisher,
}

impl Configurator {
    pub fn new(dispatcher: Dispatcher, models: Arc<ModelRegistry>, publisher: StatusPublisher) -> Self {
        Self {
            dispatcher,
            models,
            publisher,
        }
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    /// Applies a batch of updates as one transaction.
    ///
    /// Per-key failures fail the call; the per-key results are then attached
    /// to the status details as JSON.
    pub async fn set_config(&self, request: SetConfigRequest) -> Result<SetConfigResponse, Status> {
        let source = request
            .data_source
            .clone()
            .unwrap_or_else(|| DEFAULT_DATA_SOURCE.to_string());
        let resync = if request.overwrite_all {
            ResyncType::FullResync
        } else {
            ResyncType::NotResync
        };
        let mut ctx = PushContext::new()
            .with_data_src(source.clone())
            .with_resync(resync)
            .with_description(format!("set config from {}", source));

        let mut intents = Vec::with_capacity(request.updates.len());
        for update in request.updates {
            let intent = self.intent_of(&update.item).map_err(to_status)?;
            if !update.labels.is_empty() {
                ctx = ctx.with_key_labels(intent.key.clone(), update.labels);
            }
            intents.push(intent);
        }

        tracing::info!(
            source = %source,
            resync = %resync,
            count = intents.len(),
            "set config"
        );
        let pushed = self.dispatcher.push_data(ctx, intents).await.map_err(to_status)?;
        let response = response_of(&pushed);
        match pushed.error {
            None => Ok(response),
            Some(err) => {
                let code = if err.only_invalid_values() {
                    tonic::Code::InvalidArgument
                } else {
                    tonic::Code::FailedPrecondition
                };
                let details = serde_json::to_vec(&response.results).unwrap_or_default();
                Err(Status::with_details(code, err.to_string(), details.into()))
            }
        }
    }

    /// Returns the desired items together with their labels and status.
    pub fn get_config(&self, request: GetConfigRequest) -> Result<GetConfigResponse, Status> {
        let mut wanted = Vec::with_capacity(request.ids.len());
        for id in &request.ids {
            let model = self.models.get(&id.model).map_err(to_status)?;
            wanted.push(model.key_for(&id.name));
        }

        let values = self.dispatcher.list_data();
        let labels = self.dispatcher.list_labels();
        let mut items = Vec::new();
        for (key, value) in values {
            if !wanted.is_empty() && !wanted.contains(&key) {
                continue;
            }
            let item_labels = labels.get(&key).cloned().unwrap_or_default();
            if !request
                .labels
                .iter()
                .all(|(name, v)| item_labels.get(name) == Some(v))
            {
                continue;
            }
            let Some(model) = self.models.model_for_key(&key) else {
                tracing::debug!(key = %key, "no model for stored key");
                continue;
            };
            let name = strip_key_prefix(model.key_prefix(), &key)
                .unwrap_or_default()
                .to_string();
            items.push(ConfigItem {
                item: Item {
                    id: ItemId::new(model.name(), name),
                    data: model.encode(&value),
                },
                labels: item_labels,
                status: self.dispatcher.scheduler().get_value_status(&key),
                key,
            });
        }
        Ok(GetConfigResponse { items })
    }

    /// Reads the southbound state of every descriptor that supports retrieve.
    pub fn dump_state(&self) -> Result<DumpStateResponse, Status> {
        let scheduler = self.dispatcher.scheduler();
        let mut items = Vec::new();
        for descriptor in scheduler.descriptor_names() {
            let values = match scheduler.dump_values(&descriptor, DumpView::Southbound) {
                Ok(values) => values,
                Err(KvError::Unimplemented { .. }) => continue,
                Err(err) => return Err(Status::internal(err.to_string())),
            };
            items.extend(values.into_iter().map(|kv| StateItem {
                data: self
                    .models
                    .encode(&kv.key, &kv.value)
                    .unwrap_or_else(|| serde_json::Value::String(format!("{:?}", kv.value))),
                descriptor: descriptor.clone(),
                origin: kv.origin,
                has_metadata: kv.metadata.is_some(),
                key: kv.key,
            }));
        }
        Ok(DumpStateResponse { items })
    }

    pub fn subscribe(&self) -> Result<(), Status> {
        Err(Status::unimplemented("subscribe is not implemented"))
    }

    /// Streams status notifications, replaying retained ones from `from_index`.
    pub fn watch_notifications(
        &self,
        from_index: Option<u64>,
        filter: BTreeMap<String, String>,
    ) -> NotificationStream {
        let mut request = WatchRequest::default();
        request.from_index = from_index;
        request.filter = filter;
        ReceiverStream::new(self.publisher.watch(request).into_inner())
    }

    fn intent_of(&self, item: &Item) -> Result<KeyIntent, OrchestratorError> {
        let model = self.models.get(&item.id.model)?;
        match &item.data {
            Some(data) => {
                let (key, value) = self.models.decode(&item.id.model, data.clone())?;
                if !item.id.name.is_empty() && key != model.key_for(&item.id.name) {
                    return Err(OrchestratorError::InvalidItem {
                        message: format!("item {} does not match its data ({})", item.id.name, key),
                    });
                }
                Ok(KeyIntent::put(key, value))
            }
            None if item.id.name.is_empty() => Err(OrchestratorError::InvalidItem {
                message: format!("delete of a {} item without name", item.id.model),
            }),
            None => Ok(KeyIntent::delete(model.key_for(&item.id.name))),
        }
    }
}

fn response_of(pushed: &PushResult) -> SetConfigResponse {
    SetConfigResponse {
        results: pushed
            .results
            .iter()
            .map(|r| UpdateResult {
                key: r.key.clone(),
                status: r.status.clone(),
            })
            .collect(),
    }
}

fn to_status(err: OrchestratorError) -> Status {
    if err.is_invalid_argument() {
        return Status::invalid_argument(err.to_string());
    }
    match err {
        OrchestratorError::Scheduler(KvError::SchedulerClosed) => Status::unavailable("scheduler is closed"),
        OrchestratorError::Transaction(err) => Status::failed_precondition(err.to_string()),
        err => Status::internal(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{AclBindingDescriptor, AclDescriptor};
    use crate::config::SchedulerConfig;
    use crate::device::{DeviceOp, MockDevice};
    use crate::interface::{interface_key, InterfaceDescriptor, INTERFACE_KEY_PREFIX};
    use crate::scheduler::KvScheduler;
    use kv_orch_common::{DescriptorAdapter, MetadataRegistry, ValueState};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio_stream::StreamExt;
    use tokio_util::sync::CancellationToken;

    // ========================================================================
    // Fixture
    // ========================================================================

    struct Fixture {
        configurator: Configurator,
        device: MockDevice,
        scheduler: KvScheduler,
    }

    fn fixture() -> Fixture {
        let publisher = StatusPublisher::new(64);
        let registry = MetadataRegistry::new();
        let scheduler = KvScheduler::start(
            &SchedulerConfig::default(),
            publisher.clone(),
            registry.clone(),
            CancellationToken::new(),
        );
        let device = MockDevice::new();
        scheduler
            .register_descriptor(DescriptorAdapter::boxed(InterfaceDescriptor::new(device.clone())))
            .unwrap();
        scheduler
            .register_descriptor(DescriptorAdapter::boxed(AclDescriptor::new(device.clone())))
            .unwrap();
        scheduler
            .register_descriptor(DescriptorAdapter::boxed(AclBindingDescriptor::new(
                device.clone(),
                registry,
            )))
            .unwrap();

        let models = Arc::new(crate::models::mock_models());
        let dispatcher = Dispatcher::new(scheduler.clone(), "global", None);
        Fixture {
            configurator: Configurator::new(dispatcher, models, publisher),
            device,
            scheduler,
        }
    }

    fn memif(name: &str) -> serde_json::Value {
        json!({ "name": name, "type": "MEMIF", "enabled": true })
    }

    // ========================================================================
    // SetConfig
    // ========================================================================

    #[tokio::test]
    async fn test_set_config_put_and_delete() {
        let f = fixture();
        let response = f
            .configurator
            .set_config(SetConfigRequest {
                updates: vec![UpdateItem::put("interface", memif("memif0")).with_label("team", "a")],
                ..Default::default()
            })
            .await
            .unwrap();
        let key = interface_key("memif0");
        assert_eq!(response.get(&key).unwrap().status.state, ValueState::Configured);
        assert!(f.device.interface("memif0").is_some());

        f.configurator
            .set_config(SetConfigRequest {
                updates: vec![UpdateItem::delete("interface", "memif0")],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(f.device.interface("memif0").is_none());
        assert_eq!(f.scheduler.get_value_status(&key).value.state, ValueState::NonExistent);
    }

    #[tokio::test]
    async fn test_set_config_decode_error_is_invalid_argument() {
        let f = fixture();
        let err = f
            .configurator
            .set_config(SetConfigRequest {
                updates: vec![UpdateItem::put("interface", json!({ "name": 5 }))],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        let err = f
            .configurator
            .set_config(SetConfigRequest {
                updates: vec![UpdateItem::put("bridge", json!({}))],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_set_config_validation_error_is_invalid_argument() {
        let f = fixture();
        let err = f
            .configurator
            .set_config(SetConfigRequest {
                updates: vec![UpdateItem::put("interface", json!({ "name": "memif0" }))],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        let results: Vec<serde_json::Value> = serde_json::from_slice(err.details()).unwrap();
        assert_eq!(results[0]["status"]["state"], json!("INVALID"));
    }

    #[tokio::test]
    async fn test_set_config_device_failure_is_failed_precondition() {
        let f = fixture();
        f.device.fail_next(DeviceOp::CreateInterface, false);
        let err = f
            .configurator
            .set_config(SetConfigRequest {
                updates: vec![UpdateItem::put("interface", memif("memif0"))],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_overwrite_all_replaces_source() {
        let f = fixture();
        f.configurator
            .set_config(SetConfigRequest {
                updates: vec![
                    UpdateItem::put("interface", memif("memif0")),
                    UpdateItem::put("interface", memif("memif1")),
                ],
                ..Default::default()
            })
            .await
            .unwrap();

        f.configurator
            .set_config(SetConfigRequest {
                updates: vec![UpdateItem::put("interface", memif("memif1"))],
                overwrite_all: true,
                data_source: None,
            })
            .await
            .unwrap();
        assert!(f.device.interface("memif0").is_none());
        assert!(f.device.interface("memif1").is_some());
    }

    // ========================================================================
    // GetConfig / DumpState
    // ========================================================================

    #[tokio::test]
    async fn test_get_config_filters() {
        let f = fixture();
        f.configurator
            .set_config(SetConfigRequest {
                updates: vec![
                    UpdateItem::put("interface", memif("memif0")).with_label("team", "a"),
                    UpdateItem::put("interface", memif("memif1")).with_label("team", "b"),
                ],
                ..Default::default()
            })
            .await
            .unwrap();

        let all = f.configurator.get_config(GetConfigRequest::default()).unwrap();
        assert_eq!(all.items.len(), 2);

        let mut labels = Labels::new();
        labels.insert("team".to_string(), "b".to_string());
        let by_label = f
            .configurator
            .get_config(GetConfigRequest { ids: vec![], labels })
            .unwrap();
        assert_eq!(by_label.items.len(), 1);
        let item = &by_label.items[0];
        assert_eq!(item.item.id, ItemId::new("interface", "memif1"));
        assert_eq!(item.item.data.as_ref().unwrap()["name"], json!("memif1"));
        assert_eq!(item.status.value.state, ValueState::Configured);

        let by_id = f
            .configurator
            .get_config(GetConfigRequest {
                ids: vec![ItemId::new("interface", "memif0")],
                labels: Labels::new(),
            })
            .unwrap();
        assert_eq!(by_id.items.len(), 1);
        assert_eq!(by_id.items[0].key, format!("{}memif0", INTERFACE_KEY_PREFIX));
    }

    #[tokio::test]
    async fn test_dump_state_reads_device() {
        let f = fixture();
        f.configurator
            .set_config(SetConfigRequest {
                updates: vec![UpdateItem::put("interface", memif("memif0"))],
                ..Default::default()
            })
            .await
            .unwrap();

        let dump = f.configurator.dump_state().unwrap();
        let item = dump
            .items
            .iter()
            .find(|i| i.key == interface_key("memif0"))
            .unwrap();
        assert_eq!(item.descriptor, crate::interface::INTERFACE_DESCRIPTOR);
        assert!(item.has_metadata);
        assert_eq!(item.data["type"], json!("MEMIF"));
    }

    #[tokio::test]
    async fn test_subscribe_is_unimplemented() {
        let f = fixture();
        assert_eq!(f.configurator.subscribe().unwrap_err().code(), tonic::Code::Unimplemented);
    }

    #[tokio::test]
    async fn test_watch_notifications_replays() {
        let f = fixture();
        f.configurator
            .set_config(SetConfigRequest {
                updates: vec![UpdateItem::put("interface", memif("memif0"))],
                ..Default::default()
            })
            .await
            .unwrap();

        let mut filter = BTreeMap::new();
        filter.insert("key".to_string(), interface_key("memif0"));
        let mut stream = f.configurator.watch_notifications(Some(0), filter);
        let first = stream.next().await.unwrap();
        assert_eq!(first.status.value.key, interface_key("memif0"));
    }
}
