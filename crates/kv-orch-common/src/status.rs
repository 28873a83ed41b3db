//! Value states and per-key status reporting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a value as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueState {
    /// Value was deleted or has never been requested
    #[default]
    NonExistent,
    /// NB value was configured, but refresh found it missing on the device
    Missing,
    /// NB value has no descriptor to apply it
    Unimplemented,
    /// NB value was removed (terminal, the node is dropped afterwards)
    Removed,
    /// NB value is configured on the device
    Configured,
    /// Value created by the device itself (reported via SB notification)
    Obtained,
    /// NB value found on the device by refresh, with no NB intent yet
    Discovered,
    /// NB value waiting for its dependencies
    Pending,
    /// NB value rejected by validation
    Invalid,
    /// NB value whose last operation failed and will not be retried
    Failed,
    /// NB value whose last operation failed and a retry is scheduled
    Retrying,
}

impl ValueState {
    /// Returns true if the value is present on the device.
    pub fn is_available(&self) -> bool {
        matches!(
            self,
            ValueState::Configured | ValueState::Obtained | ValueState::Discovered
        )
    }

    /// Returns true if the last operation on the value failed.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            ValueState::Failed | ValueState::Retrying | ValueState::Invalid
        )
    }
}

impl fmt::Display for ValueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueState::NonExistent => "NONEXISTENT",
            ValueState::Missing => "MISSING",
            ValueState::Unimplemented => "UNIMPLEMENTED",
            ValueState::Removed => "REMOVED",
            ValueState::Configured => "CONFIGURED",
            ValueState::Obtained => "OBTAINED",
            ValueState::Discovered => "DISCOVERED",
            ValueState::Pending => "PENDING",
            ValueState::Invalid => "INVALID",
            ValueState::Failed => "FAILED",
            ValueState::Retrying => "RETRYING",
        };
        write!(f, "{}", name)
    }
}

/// Operation executed (or planned) for a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxnOperation {
    #[default]
    Undefined,
    Validate,
    Create,
    Update,
    Delete,
}

impl fmt::Display for TxnOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnOperation::Undefined => "UNDEFINED",
            TxnOperation::Validate => "VALIDATE",
            TxnOperation::Create => "CREATE",
            TxnOperation::Update => "UPDATE",
            TxnOperation::Delete => "DELETE",
        };
        write!(f, "{}", name)
    }
}

/// Status of a single (base or derived) value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValueStatus {
    /// Value key
    pub key: String,
    /// Current state
    pub state: ValueState,
    /// Error of the last operation, if it failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Last executed operation
    pub last_operation: TxnOperation,
    /// Unsatisfied dependency labels (Pending) or invalid fields (Invalid)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl ValueStatus {
    /// Status of a key the scheduler knows nothing about.
    pub fn nonexistent(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }
}

/// Status of a base value together with the statuses of its derived values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BaseValueStatus {
    /// Status of the base value
    pub value: ValueStatus,
    /// Statuses of values derived from the base value
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived_values: Vec<ValueStatus>,
}

impl BaseValueStatus {
    /// Returns true if neither the base value nor any derived value has failed.
    pub fn is_healthy(&self) -> bool {
        !self.value.state.is_failed() && self.derived_values.iter().all(|d| !d.state.is_failed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_value_state_classification() {
        assert!(ValueState::Configured.is_available());
        assert!(ValueState::Obtained.is_available());
        assert!(!ValueState::Pending.is_available());
        assert!(!ValueState::Retrying.is_available());

        assert!(ValueState::Failed.is_failed());
        assert!(ValueState::Retrying.is_failed());
        assert!(ValueState::Invalid.is_failed());
        assert!(!ValueState::Pending.is_failed());
    }

    #[test]
    fn test_state_names() {
        let json = serde_json::to_string(&ValueState::NonExistent).unwrap();
        assert_eq!(json, "\"NON_EXISTENT\"");
        assert_eq!(ValueState::Retrying.to_string(), "RETRYING");
        assert_eq!(TxnOperation::Create.to_string(), "CREATE");
    }

    #[test]
    fn test_base_value_status_health() {
        let mut status = BaseValueStatus {
            value: ValueStatus {
                key: "acl/acl0".to_string(),
                state: ValueState::Configured,
                last_operation: TxnOperation::Create,
                ..Default::default()
            },
            derived_values: vec![ValueStatus {
                key: "acl/acl0/interface/memif0".to_string(),
                state: ValueState::Pending,
                details: vec!["interface-exists".to_string()],
                ..Default::default()
            }],
        };
        assert!(status.is_healthy());

        status.derived_values[0].state = ValueState::Failed;
        assert!(!status.is_healthy());
    }

    #[test]
    fn test_nonexistent_status() {
        let status = ValueStatus::nonexistent("x");
        assert_eq!(status.state, ValueState::NonExistent);
        assert_eq!(status.last_operation, TxnOperation::Undefined);
    }
}
