//! Error types of the orchestration agent.

use kv_orch_common::{KvError, TransactionError};
use std::io;
use thiserror::Error;

/// Result type alias for orchestrator operations.
pub type OrchResult<T> = Result<T, OrchestratorError>;

/// Errors of the orchestrator, the model registry and the daemon.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Item payload could not be decoded into its model type.
    #[error("failed to decode {model} item: {message}")]
    Decode {
        /// Model name.
        model: String,
        /// Decoder error message.
        message: String,
    },

    /// No model registered under the given name.
    #[error("unknown model '{model}'")]
    UnknownModel {
        /// The model name.
        model: String,
    },

    /// Item id does not identify a key.
    #[error("invalid item id: {message}")]
    InvalidItem {
        /// Error message.
        message: String,
    },

    /// The scheduler failed the transaction as a whole.
    #[error("scheduler error: {0}")]
    Scheduler(#[from] KvError),

    /// Transaction committed with per-key failures.
    #[error("{0}")]
    Transaction(#[from] TransactionError),

    /// Init file or config file could not be read.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Configuration problem.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl OrchestratorError {
    /// Creates a decode error.
    pub fn decode(model: impl Into<String>, message: impl ToString) -> Self {
        Self::Decode {
            model: model.into(),
            message: message.to_string(),
        }
    }

    /// Creates an I/O error for the given path.
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true if the error was caused by the request itself
    /// (bad payload, unknown model, value rejected by validation).
    pub fn is_invalid_argument(&self) -> bool {
        match self {
            Self::Decode { .. } | Self::UnknownModel { .. } | Self::InvalidItem { .. } => true,
            Self::Scheduler(err) => err.is_invalid_value(),
            Self::Transaction(err) => err.only_invalid_values(),
            _ => false,
        }
    }
}

/// Errors of the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file is not valid TOML or has unexpected fields.
    #[error("failed to parse config file {path}: {message}")]
    Parse {
        /// File path.
        path: String,
        /// Parser error message.
        message: String,
    },

    /// The configuration could not be serialized.
    #[error("failed to serialize config: {0}")]
    Serialize(String),

    /// A field has an invalid value.
    #[error("invalid configuration for {field}: {message}")]
    Invalid {
        /// The offending field.
        field: String,
        /// Error message.
        message: String,
    },

    /// The file could not be read or written.
    #[error("config file {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },
}

impl ConfigError {
    /// Creates a validation error.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv_orch_common::{KeyWithError, TxnOperation};

    #[test]
    fn test_invalid_argument_classification() {
        assert!(OrchestratorError::decode("interface", "missing field").is_invalid_argument());
        assert!(OrchestratorError::UnknownModel {
            model: "route".to_string()
        }
        .is_invalid_argument());
        assert!(!OrchestratorError::Scheduler(KvError::SchedulerClosed).is_invalid_argument());
    }

    #[test]
    fn test_transaction_error_classification() {
        let invalid = TransactionError::from_errors(
            3,
            vec![KeyWithError {
                key: "config/mock/v1/interfaces/x".to_string(),
                txn_operation: TxnOperation::Validate,
                error: KvError::invalid_value("name too long", ["name"]),
            }],
        )
        .unwrap();
        assert!(OrchestratorError::from(invalid).is_invalid_argument());

        let failed = TransactionError::from_errors(
            4,
            vec![KeyWithError {
                key: "config/mock/v1/interfaces/x".to_string(),
                txn_operation: TxnOperation::Create,
                error: KvError::permanent("no such device"),
            }],
        )
        .unwrap();
        let err = OrchestratorError::from(failed);
        assert!(!err.is_invalid_argument());
        assert!(err.to_string().contains("transaction 4"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("scheduler.txn_queue_capacity", "must be > 0");
        assert_eq!(
            err.to_string(),
            "invalid configuration for scheduler.txn_queue_capacity: must be > 0"
        );
    }
}
