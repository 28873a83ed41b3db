//! Registry of northbound models.
//!
//! A model ties a key prefix to a concrete value type. Items arrive as JSON
//! (from the configurator or the init file) and are decoded into typed
//! values through the accessor functions registered here; keys are derived
//! from the decoded value.

use crate::acl::{Acl, ACL_KEY_PREFIX};
use crate::error::{OrchResult, OrchestratorError};
use crate::interface::{Interface, INTERFACE_KEY_PREFIX};
use kv_orch_common::{downcast, key_with_prefix, value_ref, Value, ValueRef};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

type DecodeFn = Arc<dyn Fn(serde_json::Value) -> OrchResult<ValueRef> + Send + Sync>;
type EncodeFn = Arc<dyn Fn(&ValueRef) -> Option<serde_json::Value> + Send + Sync>;
type NameFn = Arc<dyn Fn(&ValueRef) -> Option<String> + Send + Sync>;

/// Accessors of one model.
#[derive(Clone)]
pub struct Model {
    name: String,
    key_prefix: String,
    decode: DecodeFn,
    encode: EncodeFn,
    name_of: NameFn,
}

impl Model {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Parses a JSON payload into a value of the model type.
    pub fn decode(&self, data: serde_json::Value) -> OrchResult<ValueRef> {
        (self.decode)(data)
    }

    /// Renders a value of the model type as JSON.
    pub fn encode(&self, value: &ValueRef) -> Option<serde_json::Value> {
        (self.encode)(value)
    }

    /// Key of a decoded value.
    pub fn key_of(&self, value: &ValueRef) -> OrchResult<String> {
        let name = (self.name_of)(value).ok_or_else(|| OrchestratorError::InvalidItem {
            message: format!("value is not a {} item", self.name),
        })?;
        if name.is_empty() {
            return Err(OrchestratorError::InvalidItem {
                message: format!("{} item has an empty name", self.name),
            });
        }
        Ok(key_with_prefix(&self.key_prefix, &name))
    }

    /// Key of the item called `name`.
    pub fn key_for(&self, name: &str) -> String {
        key_with_prefix(&self.key_prefix, name)
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

/// Models by name.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, Model>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a serde model. `name_of` returns the item name of a value.
    pub fn register<T>(
        &mut self,
        name: impl Into<String>,
        key_prefix: impl Into<String>,
        name_of: fn(&T) -> String,
    ) -> &mut Self
    where
        T: Value + Serialize + DeserializeOwned,
    {
        let name = name.into();
        let model_name = name.clone();
        let model = Model {
            name: name.clone(),
            key_prefix: key_prefix.into(),
            decode: Arc::new(move |data| {
                serde_json::from_value::<T>(data)
                    .map(value_ref)
                    .map_err(|e| OrchestratorError::decode(model_name.clone(), e))
            }),
            encode: Arc::new(|value| {
                downcast::<T>(value).and_then(|typed| serde_json::to_value(typed).ok())
            }),
            name_of: Arc::new(move |value| downcast::<T>(value).map(name_of)),
        };
        tracing::debug!(model = %name, prefix = %model.key_prefix, "model registered");
        self.models.insert(name, model);
        self
    }

    pub fn get(&self, name: &str) -> OrchResult<&Model> {
        self.models
            .get(name)
            .ok_or_else(|| OrchestratorError::UnknownModel {
                model: name.to_string(),
            })
    }

    /// Model owning `key` (longest matching prefix).
    pub fn model_for_key(&self, key: &str) -> Option<&Model> {
        self.models
            .values()
            .filter(|m| key.starts_with(&m.key_prefix))
            .max_by_key(|m| m.key_prefix.len())
    }

    /// Decodes an item of `model`, returning its key and value.
    pub fn decode(&self, model: &str, data: serde_json::Value) -> OrchResult<(String, ValueRef)> {
        let model = self.get(model)?;
        let value = model.decode(data)?;
        let key = model.key_of(&value)?;
        Ok((key, value))
    }

    /// Renders the value stored under `key` as JSON.
    pub fn encode(&self, key: &str, value: &ValueRef) -> Option<serde_json::Value> {
        self.model_for_key(key)?.encode(value)
    }

    pub fn names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    pub fn key_prefixes(&self) -> Vec<String> {
        self.models.values().map(|m| m.key_prefix.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Models of the mock device: "interface" and "acl".
pub fn mock_models() -> ModelRegistry {
    let mut registry = ModelRegistry::new();
    registry
        .register::<Interface>("interface", INTERFACE_KEY_PREFIX, |i| i.name.clone())
        .register::<Acl>("acl", ACL_KEY_PREFIX, |a| a.name.clone());
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Vlan {
        name: String,
        id: u16,
    }

    fn registry() -> ModelRegistry {
        let mut registry = ModelRegistry::new();
        registry.register::<Vlan>("vlan", "config/vlan/", |v| v.name.clone());
        registry
    }

    #[test]
    fn test_decode_derives_key() {
        let registry = registry();
        let (key, value) = registry
            .decode("vlan", json!({"name": "v10", "id": 10}))
            .unwrap();
        assert_eq!(key, "config/vlan/v10");
        assert_eq!(downcast::<Vlan>(&value).map(|v| v.id), Some(10));
        assert_eq!(registry.encode(&key, &value), Some(json!({"name": "v10", "id": 10})));
    }

    #[test]
    fn test_decode_errors() {
        let registry = registry();
        assert!(matches!(
            registry.decode("route", json!({})),
            Err(OrchestratorError::UnknownModel { .. })
        ));
        assert!(matches!(
            registry.decode("vlan", json!({"name": 5})),
            Err(OrchestratorError::Decode { .. })
        ));
        assert!(matches!(
            registry.decode("vlan", json!({"name": "", "id": 1})),
            Err(OrchestratorError::InvalidItem { .. })
        ));
    }

    #[test]
    fn test_model_for_key_prefers_longest_prefix() {
        let mut registry = registry();
        registry.register::<Vlan>("vlan-member", "config/vlan/member/", |v| v.name.clone());

        assert_eq!(
            registry.model_for_key("config/vlan/member/x").map(Model::name),
            Some("vlan-member")
        );
        assert_eq!(registry.model_for_key("config/vlan/v1").map(Model::name), Some("vlan"));
        assert!(registry.model_for_key("config/route/r").is_none());
        assert_eq!(registry.names(), vec!["vlan", "vlan-member"]);
    }

    #[test]
    fn test_mock_models() {
        let registry = mock_models();
        assert_eq!(registry.names(), vec!["acl", "interface"]);
        let (key, _) = registry
            .decode("interface", json!({"name": "memif0", "type": "MEMIF"}))
            .unwrap();
        assert_eq!(key, "config/mock/v1/interfaces/memif0");
        assert_eq!(
            registry.model_for_key("config/mock/v1/acl/acl0/interface/ingress/memif0").map(Model::name),
            None
        );
    }
}
