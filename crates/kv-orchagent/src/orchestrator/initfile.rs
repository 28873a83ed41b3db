//! Initial configuration loaded from a YAML file.
//!
//! ```yaml
//! items:
//!   - model: interface
//!     data: { name: memif0, type: MEMIF, enabled: true }
//!   - model: acl
//!     key: config/mock/v1/acls/acl0
//!     data: { name: acl0, rules: [] }
//! ```
//!
//! The file is offered to the aggregator as a one-shot resync of its own
//! data source.

use super::watcher::{WatchEvent, Watcher};
use crate::error::{OrchResult, OrchestratorError};
use crate::models::ModelRegistry;
use async_trait::async_trait;
use kv_orch_common::{KeyIntent, ValueRef};
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::Path;

/// One item of the init file.
#[derive(Debug, Clone, Deserialize)]
pub struct InitFileItem {
    pub model: String,
    /// Item name; the key is derived from it when `key` is absent
    #[serde(default)]
    pub name: Option<String>,
    /// Explicit key
    #[serde(default)]
    pub key: Option<String>,
    pub data: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct InitFile {
    #[serde(default)]
    items: Vec<InitFileItem>,
}

/// Decoded init file, consumed as a watcher.
#[derive(Debug)]
pub struct InitFileRegistry {
    data_source: String,
    values: Vec<(String, ValueRef)>,
    pushed: bool,
}

impl InitFileRegistry {
    /// Loads and decodes the file. A missing file yields an empty registry.
    pub fn load(path: impl AsRef<Path>, models: &ModelRegistry, data_source: impl Into<String>) -> OrchResult<Self> {
        let path = path.as_ref();
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "init file not found, skipping");
                String::new()
            }
            Err(e) => return Err(OrchestratorError::io(path.display().to_string(), e)),
        };
        let registry = Self::parse(&content, models, data_source)?;
        tracing::info!(
            path = %path.display(),
            items = registry.values.len(),
            "init file loaded"
        );
        Ok(registry)
    }

    /// Decodes YAML content.
    pub fn parse(content: &str, models: &ModelRegistry, data_source: impl Into<String>) -> OrchResult<Self> {
        let file: InitFile = if content.trim().is_empty() {
            InitFile::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| OrchestratorError::decode("init file", e))?
        };

        let mut values = Vec::with_capacity(file.items.len());
        for item in file.items {
            let model = models.get(&item.model)?;
            let value = model.decode(item.data)?;
            let key = match (item.key, item.name) {
                (Some(key), _) => {
                    if !key.starts_with(model.key_prefix()) {
                        return Err(OrchestratorError::InvalidItem {
                            message: format!("key {} does not belong to model {}", key, model.name()),
                        });
                    }
                    key
                }
                (None, Some(name)) => model.key_for(&name),
                (None, None) => model.key_of(&value)?,
            };
            values.push((key, value));
        }

        Ok(Self {
            data_source: data_source.into(),
            values,
            pushed: false,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.iter().map(|(key, _)| key.clone()).collect()
    }
}

#[async_trait]
impl Watcher for InitFileRegistry {
    fn data_source(&self) -> &str {
        &self.data_source
    }

    async fn next_event(&mut self) -> Option<WatchEvent> {
        if self.pushed || self.values.is_empty() {
            return None;
        }
        self.pushed = true;
        let items = self
            .values
            .iter()
            .map(|(key, value)| KeyIntent::put(key.clone(), value.clone()))
            .collect();
        Some(WatchEvent::Resync { items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Serialize;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Port {
        name: String,
        #[serde(default)]
        mtu: u32,
    }

    fn models() -> ModelRegistry {
        let mut models = ModelRegistry::new();
        models.register::<Port>("port", "config/port/", |p| p.name.clone());
        models
    }

    #[tokio::test]
    async fn test_parse_items_once() {
        let content = r#"
items:
  - model: port
    data: { name: eth0, mtu: 9000 }
  - model: port
    name: renamed
    data: { name: eth1 }
  - model: port
    key: config/port/explicit
    data: { name: eth2 }
"#;
        let mut registry = InitFileRegistry::parse(content, &models(), "initfile").unwrap();
        assert_eq!(
            registry.keys(),
            vec!["config/port/eth0", "config/port/renamed", "config/port/explicit"]
        );

        let Some(WatchEvent::Resync { items }) = registry.next_event().await else {
            panic!("expected resync event");
        };
        assert_eq!(items.len(), 3);
        assert!(registry.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_or_empty_file_yields_nothing() {
        let dir = tempdir().unwrap();
        let mut missing =
            InitFileRegistry::load(dir.path().join("none.yaml"), &models(), "initfile").unwrap();
        assert!(missing.is_empty());
        assert!(missing.next_event().await.is_none());

        let path = dir.path().join("empty.yaml");
        fs::write(&path, "\n").unwrap();
        let mut empty = InitFileRegistry::load(&path, &models(), "initfile").unwrap();
        assert!(empty.next_event().await.is_none());
    }

    #[test]
    fn test_invalid_items() {
        let unknown = "items:\n  - model: route\n    data: {}\n";
        assert!(matches!(
            InitFileRegistry::parse(unknown, &models(), "initfile"),
            Err(OrchestratorError::UnknownModel { .. })
        ));

        let foreign_key = "items:\n  - model: port\n    key: config/vlan/x\n    data: { name: x }\n";
        assert!(matches!(
            InitFileRegistry::parse(foreign_key, &models(), "initfile"),
            Err(OrchestratorError::InvalidItem { .. })
        ));

        assert!(matches!(
            InitFileRegistry::parse("items: [", &models(), "initfile"),
            Err(OrchestratorError::Decode { .. })
        ));
    }
}
