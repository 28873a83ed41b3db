//! Error types for the KV scheduler.
//!
//! Errors are cloned into value statuses, transaction records and status
//! notifications, so every variant carries owned strings only.

use crate::status::TxnOperation;
use std::fmt;
use thiserror::Error;

/// Result type alias for scheduler and descriptor operations.
pub type KvResult<T> = Result<T, KvError>;

/// Errors produced by descriptors and by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvError {
    /// Value rejected by descriptor validation.
    #[error("invalid value: {message} (invalid fields: {})", .fields.join(", "))]
    InvalidValue {
        /// Human-readable reason.
        message: String,
        /// Names of the offending fields.
        fields: Vec<String>,
    },

    /// Device call failed.
    #[error("device error: {message}")]
    Device {
        /// Error message reported by the device layer.
        message: String,
        /// Whether the failure is transient.
        retriable: bool,
    },

    /// Descriptor does not implement the requested operation.
    #[error("descriptor {descriptor} does not implement {operation}")]
    Unimplemented {
        /// Descriptor name.
        descriptor: String,
        /// Missing operation.
        operation: String,
    },

    /// Value passed to a typed descriptor has an unexpected type.
    #[error("descriptor {descriptor} expected value of type {expected}, got {actual}")]
    TypeMismatch {
        /// Descriptor name.
        descriptor: String,
        /// Expected type name.
        expected: String,
        /// Received type name.
        actual: String,
    },

    /// No registered descriptor owns the key.
    #[error("no descriptor registered for key {key}")]
    UnownedKey {
        /// The key.
        key: String,
    },

    /// Descriptor Retrieve failed.
    #[error("failed to retrieve values of {descriptor}: {message}")]
    Retrieve {
        /// Descriptor name.
        descriptor: String,
        /// Error message.
        message: String,
    },

    /// The scheduler has been shut down.
    #[error("scheduler is not running")]
    SchedulerClosed,

    /// Transaction was cancelled before it finished.
    #[error("transaction was cancelled")]
    Cancelled,

    /// Transaction did not finish in time.
    #[error("transaction timed out after {millis}ms")]
    Timeout {
        /// Elapsed timeout.
        millis: u64,
    },

    /// Internal error (unexpected state).
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl KvError {
    /// Creates an invalid value error for the given fields.
    pub fn invalid_value<I, S>(message: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::InvalidValue {
            message: message.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Creates a transient device error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Device {
            message: message.into(),
            retriable: true,
        }
    }

    /// Creates a permanent device error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Device {
            message: message.into(),
            retriable: false,
        }
    }

    /// Creates an unimplemented-operation error.
    pub fn unimplemented(descriptor: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unimplemented {
            descriptor: descriptor.into(),
            operation: operation.into(),
        }
    }

    /// Creates a retrieve error.
    pub fn retrieve(descriptor: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Retrieve {
            descriptor: descriptor.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if the error came from value validation.
    pub fn is_invalid_value(&self) -> bool {
        matches!(self, KvError::InvalidValue { .. })
    }

    /// Returns the invalid fields of a validation error.
    pub fn invalid_fields(&self) -> &[String] {
        match self {
            KvError::InvalidValue { fields, .. } => fields,
            _ => &[],
        }
    }

    /// Default retriability classification used when a descriptor does not
    /// override `is_retriable_failure`.
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Device { retriable, .. } => *retriable,
            KvError::Retrieve { .. } | KvError::Timeout { .. } => true,
            _ => false,
        }
    }
}

/// Error of one key within a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyWithError {
    /// Key of the failed value.
    pub key: String,
    /// Operation that failed.
    pub txn_operation: TxnOperation,
    /// The error.
    pub error: KvError,
}

impl fmt::Display for KeyWithError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.key, self.txn_operation, self.error)
    }
}

/// Aggregate of per-key errors of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct TransactionError {
    /// Sequence number of the transaction.
    pub seq_num: u64,
    /// Per-key errors, ordered by key.
    pub kv_errors: Vec<KeyWithError>,
}

impl TransactionError {
    /// Creates a transaction error, or `None` if there are no per-key errors.
    pub fn from_errors(seq_num: u64, mut kv_errors: Vec<KeyWithError>) -> Option<Self> {
        if kv_errors.is_empty() {
            return None;
        }
        kv_errors.sort_by(|a, b| a.key.cmp(&b.key));
        Some(Self { seq_num, kv_errors })
    }

    /// Returns true if every failure is a validation failure.
    pub fn only_invalid_values(&self) -> bool {
        self.kv_errors.iter().all(|e| e.error.is_invalid_value())
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transaction {} finished with {} error(s):",
            self.seq_num,
            self.kv_errors.len()
        )?;
        for kv_error in &self.kv_errors {
            write!(f, "\n - {}", kv_error)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_invalid_value_error() {
        let err = KvError::invalid_value("name is too long", ["name"]);
        assert!(err.is_invalid_value());
        assert_eq!(err.invalid_fields(), &["name".to_string()]);
        assert_eq!(
            err.to_string(),
            "invalid value: name is too long (invalid fields: name)"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_device_error_classification() {
        assert!(KvError::transient("busy").is_retryable());
        assert!(!KvError::permanent("unsupported").is_retryable());
        assert!(!KvError::SchedulerClosed.is_retryable());
        assert!(KvError::Timeout { millis: 10 }.is_retryable());
    }

    #[test]
    fn test_transaction_error_sorted() {
        let err = TransactionError::from_errors(
            7,
            vec![
                KeyWithError {
                    key: "b".to_string(),
                    txn_operation: TxnOperation::Create,
                    error: KvError::transient("busy"),
                },
                KeyWithError {
                    key: "a".to_string(),
                    txn_operation: TxnOperation::Delete,
                    error: KvError::permanent("gone"),
                },
            ],
        )
        .unwrap();

        assert_eq!(err.kv_errors[0].key, "a");
        assert!(!err.only_invalid_values());
        let text = err.to_string();
        assert!(text.starts_with("transaction 7 finished with 2 error(s):"));
        assert!(text.contains("a (DELETE): device error: gone"));
    }

    #[test]
    fn test_transaction_error_empty() {
        assert!(TransactionError::from_errors(1, vec![]).is_none());
    }
}
