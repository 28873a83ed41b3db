//! Configuration file support for kv-orchagent.
//!
//! Loads and validates the agent configuration from a TOML file.
//! Default location: /etc/kv-orchagent/kv-orchagent.toml

use crate::error::ConfigError;
use kv_orch_common::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/kv-orchagent/kv-orchagent.toml";

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Plan every transaction on a copy of the graph before executing it
    #[serde(default)]
    pub enable_txn_simulation: bool,

    /// Keep a history of processed transactions
    #[serde(default = "default_true")]
    pub record_transaction_history: bool,

    /// Age after which recorded transactions are trimmed
    #[serde(default = "default_history_age_limit")]
    pub transaction_history_age_limit_secs: u64,

    /// Transactions recorded this long after start-up are never trimmed
    #[serde(default = "default_init_period")]
    pub permanently_recorded_init_period_secs: u64,

    /// Log every transaction in its full text form
    #[serde(default = "default_true")]
    pub print_txn_summary: bool,

    /// Capacity of the transaction queue
    #[serde(default = "default_txn_queue_capacity")]
    pub txn_queue_capacity: usize,

    /// Number of status notifications kept for replay
    #[serde(default = "default_status_buffer_size")]
    pub status_buffer_size: usize,

    /// Inbox capacity of value-status watchers
    #[serde(default = "default_watcher_inbox_capacity")]
    pub watcher_inbox_capacity: usize,
}

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Data source assigned to pushes without one
    #[serde(default = "default_data_source")]
    pub default_data_source: String,

    /// YAML file with the initial configuration
    #[serde(default)]
    pub init_file: Option<PathBuf>,

    /// Data source of the init file
    #[serde(default = "default_init_file_data_source")]
    pub init_file_data_source: String,

    /// Interval of downstream resyncs (0 = disabled)
    #[serde(default)]
    pub downstream_resync_interval_secs: u64,
}

/// Default retry policy of northbound pushes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry
    #[serde(default = "default_retry_period")]
    pub default_period_ms: u64,

    /// Maximum number of retries (0 = no automatic retry)
    #[serde(default = "default_retry_max_count")]
    pub default_max_count: u32,

    /// Double the delay with every attempt
    #[serde(default = "default_true")]
    pub exp_backoff: bool,
}

/// Complete agent configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Orchestrator configuration
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Retry configuration
    #[serde(default)]
    pub retry: RetryConfig,
}

// Default functions
fn default_true() -> bool {
    true
}

fn default_history_age_limit() -> u64 {
    24 * 60 * 60
}

fn default_init_period() -> u64 {
    60
}

fn default_txn_queue_capacity() -> usize {
    100
}

fn default_status_buffer_size() -> usize {
    1000
}

fn default_watcher_inbox_capacity() -> usize {
    100
}

fn default_data_source() -> String {
    "global".to_string()
}

fn default_init_file_data_source() -> String {
    "initfile".to_string()
}

fn default_retry_period() -> u64 {
    1000
}

fn default_retry_max_count() -> u32 {
    3
}

// Default implementations
impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enable_txn_simulation: false,
            record_transaction_history: default_true(),
            transaction_history_age_limit_secs: default_history_age_limit(),
            permanently_recorded_init_period_secs: default_init_period(),
            print_txn_summary: default_true(),
            txn_queue_capacity: default_txn_queue_capacity(),
            status_buffer_size: default_status_buffer_size(),
            watcher_inbox_capacity: default_watcher_inbox_capacity(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_data_source: default_data_source(),
            init_file: None,
            init_file_data_source: default_init_file_data_source(),
            downstream_resync_interval_secs: 0,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_period_ms: default_retry_period(),
            default_max_count: default_retry_max_count(),
            exp_backoff: default_true(),
        }
    }
}

impl SchedulerConfig {
    /// Get history age limit as Duration
    pub fn history_age_limit(&self) -> Duration {
        Duration::from_secs(self.transaction_history_age_limit_secs)
    }

    /// Get permanent init period as Duration
    pub fn init_period(&self) -> Duration {
        Duration::from_secs(self.permanently_recorded_init_period_secs)
    }
}

impl OrchestratorConfig {
    /// Get downstream resync interval, `None` if disabled
    pub fn downstream_resync_interval(&self) -> Option<Duration> {
        match self.downstream_resync_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl RetryConfig {
    /// Retry policy applied to pushes that carry none, `None` if disabled
    pub fn default_policy(&self) -> Option<RetryPolicy> {
        if self.default_max_count == 0 {
            return None;
        }
        Some(RetryPolicy {
            period: Duration::from_millis(self.default_period_ms),
            exp_backoff: self.exp_backoff,
            max_count: self.default_max_count,
        })
    }
}

impl AgentConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.txn_queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "scheduler.txn_queue_capacity",
                "must be > 0",
            ));
        }

        if self.scheduler.status_buffer_size == 0 {
            return Err(ConfigError::invalid(
                "scheduler.status_buffer_size",
                "must be > 0",
            ));
        }

        if self.scheduler.watcher_inbox_capacity == 0 {
            return Err(ConfigError::invalid(
                "scheduler.watcher_inbox_capacity",
                "must be > 0",
            ));
        }

        if self.orchestrator.default_data_source.is_empty() {
            return Err(ConfigError::invalid(
                "orchestrator.default_data_source",
                "must not be empty",
            ));
        }

        if self.orchestrator.init_file_data_source == self.orchestrator.default_data_source {
            return Err(ConfigError::invalid(
                "orchestrator.init_file_data_source",
                "must differ from default_data_source",
            ));
        }

        if self.retry.default_max_count > 0 && self.retry.default_period_ms == 0 {
            return Err(ConfigError::invalid(
                "retry.default_period_ms",
                "must be > 0 when retries are enabled",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert!(!config.scheduler.enable_txn_simulation);
        assert!(config.scheduler.record_transaction_history);
        assert_eq!(config.scheduler.transaction_history_age_limit_secs, 86400);
        assert_eq!(config.scheduler.permanently_recorded_init_period_secs, 60);
        assert_eq!(config.orchestrator.default_data_source, "global");
        assert_eq!(config.orchestrator.init_file_data_source, "initfile");
        assert_eq!(config.orchestrator.init_file, None);
    }

    #[test]
    fn test_retry_default_policy() {
        let config = RetryConfig::default();
        let policy = config.default_policy().unwrap();
        assert_eq!(policy.period, Duration::from_millis(1000));
        assert_eq!(policy.max_count, 3);
        assert!(policy.exp_backoff);

        let disabled = RetryConfig {
            default_max_count: 0,
            ..RetryConfig::default()
        };
        assert!(disabled.default_policy().is_none());
    }

    #[test]
    fn test_downstream_resync_interval() {
        let mut config = OrchestratorConfig::default();
        assert_eq!(config.downstream_resync_interval(), None);
        config.downstream_resync_interval_secs = 30;
        assert_eq!(
            config.downstream_resync_interval(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(AgentConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_queue_capacity() {
        let mut config = AgentConfig::default();
        config.scheduler.txn_queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_conflicting_data_sources() {
        let mut config = AgentConfig::default();
        config.orchestrator.init_file_data_source = "global".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_str = r#"
[scheduler]
enable_txn_simulation = true
txn_queue_capacity = 10

[orchestrator]
init_file = "/etc/kv-orchagent/init.yaml"
"#;
        let config: AgentConfig = toml::from_str(toml_str).unwrap();
        assert!(config.scheduler.enable_txn_simulation);
        assert_eq!(config.scheduler.txn_queue_capacity, 10);
        assert_eq!(
            config.orchestrator.init_file,
            Some(PathBuf::from("/etc/kv-orchagent/init.yaml"))
        );
        // unspecified values use defaults
        assert!(config.scheduler.print_txn_summary);
        assert_eq!(config.retry.default_max_count, 3);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent.toml");

        let mut config = AgentConfig::default();
        config.orchestrator.downstream_resync_interval_secs = 15;
        config.save(&path).unwrap();

        let loaded = AgentConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_nonexistent_file_defaults() {
        let config = AgentConfig::load_or_default("/nonexistent/path.toml").unwrap();
        assert_eq!(config, AgentConfig::default());
    }

    #[test]
    fn test_load_malformed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        fs::write(&path, "[scheduler\ntxn_queue_capacity = ").unwrap();
        assert!(matches!(
            AgentConfig::load_or_default(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
