//! Transaction types: options, results and history records.

use crate::error::{KvError, TransactionError};
use crate::status::{TxnOperation, ValueState, ValueStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Kind of transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxnType {
    /// Value reported by the device on its own
    SbNotification,
    /// Change requested by a northbound data source
    NbTransaction,
    /// Re-application of failed operations
    RetryFailedOps,
}

impl fmt::Display for TxnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnType::SbNotification => write!(f, "SB Notification"),
            TxnType::NbTransaction => write!(f, "NB Transaction"),
            TxnType::RetryFailedOps => write!(f, "Retry Failed Operations"),
        }
    }
}

/// Resync mode of a northbound transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResyncType {
    /// Incremental change: only the given keys are touched
    #[default]
    NotResync,
    /// The batch is the complete desired state
    FullResync,
    /// Like FullResync, but never refreshes from the device
    UpstreamResync,
    /// Re-read the device and re-apply the intended state
    DownstreamResync,
}

impl ResyncType {
    /// Returns true for any kind of resync.
    pub fn is_resync(&self) -> bool {
        !matches!(self, ResyncType::NotResync)
    }

    /// Returns true if the batch replaces the whole desired state.
    pub fn replaces_desired_state(&self) -> bool {
        matches!(self, ResyncType::FullResync | ResyncType::UpstreamResync)
    }
}

impl fmt::Display for ResyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResyncType::NotResync => write!(f, "Not Resync"),
            ResyncType::FullResync => write!(f, "Full Resync"),
            ResyncType::UpstreamResync => write!(f, "Upstream Resync"),
            ResyncType::DownstreamResync => write!(f, "Downstream Resync"),
        }
    }
}

/// Policy for automatic retries of failed operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub period: Duration,
    /// Double the delay with every attempt
    pub exp_backoff: bool,
    /// Maximum number of attempts (0 = unlimited)
    pub max_count: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            exp_backoff: true,
            max_count: 3,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given period and attempt limit.
    pub fn new(period: Duration, max_count: u32) -> Self {
        Self {
            period,
            exp_backoff: false,
            max_count,
        }
    }

    /// Enables exponential backoff.
    pub fn with_exp_backoff(mut self) -> Self {
        self.exp_backoff = true;
        self
    }

    /// Returns the delay before the given attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        if !self.exp_backoff || attempt <= 1 {
            return self.period;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.period.saturating_mul(factor)
    }

    /// Returns true if another attempt is allowed after `attempt` attempts.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_count == 0 || attempt < self.max_count
    }
}

/// Options of one transaction, passed by value with the commit.
#[derive(Debug, Clone, Default)]
pub struct TxnOptions {
    pub resync: ResyncType,
    pub retry: Option<RetryPolicy>,
    /// Revert all changes of the transaction if any operation fails
    pub revert_on_failure: bool,
    /// Log values retrieved during refresh
    pub verbose_refresh: bool,
    /// After a downstream resync, retrieve again and compare with the intent
    pub verify_with_retrieve: bool,
    pub description: String,
    /// Upper bound on how long the caller waits for the result
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl TxnOptions {
    /// Options for an incremental change.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resync(mut self, resync: ResyncType) -> Self {
        self.resync = resync;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_revert(mut self) -> Self {
        self.revert_on_failure = true;
        self
    }

    pub fn with_verbose_refresh(mut self) -> Self {
        self.verbose_refresh = true;
        self
    }

    pub fn with_verification(mut self) -> Self {
        self.verify_with_retrieve = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Returns true if the transaction was cancelled by the caller.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }
}

/// Outcome of one key of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyResult {
    pub key: String,
    pub status: ValueStatus,
    /// Error of the last operation on the key, if it failed
    pub error: Option<KvError>,
}

/// Result of a committed transaction.
#[derive(Debug, Clone, Default)]
pub struct CommitResult {
    /// Sequence number assigned to the transaction
    pub seq_num: u64,
    /// Per-key results, ordered by key
    pub results: Vec<KeyResult>,
    /// Aggregate of per-key errors
    pub error: Option<TransactionError>,
}

impl CommitResult {
    /// Returns true if no key failed.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Returns the result of one key.
    pub fn get(&self, key: &str) -> Option<&KeyResult> {
        self.results.iter().find(|r| r.key == key)
    }
}

/// Key-value pair as recorded in the history (value rendered as text).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedKv {
    pub key: String,
    /// `None` for delete
    pub value: Option<String>,
}

/// One operation of a recorded transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordedTxnOp {
    pub operation: TxnOperation,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
    pub prev_state: ValueState,
    pub new_state: ValueState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_error: Option<String>,
    /// Operation changed only the state, no descriptor call was made
    pub noop: bool,
    pub is_derived: bool,
    pub is_revert: bool,
    pub is_retry: bool,
    pub is_recreate: bool,
}

impl RecordedTxnOp {
    fn write_text(&self, out: &mut String, index: usize, indent: &str) -> fmt::Result {
        let mut flags = Vec::new();
        if self.noop {
            flags.push("NOOP");
        }
        if self.is_derived {
            flags.push("DERIVED");
        }
        if self.is_revert {
            flags.push("REVERT");
        }
        if self.is_retry {
            flags.push("RETRY");
        }
        if self.is_recreate {
            flags.push("RECREATE");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };

        writeln!(out, "{}{}. {}{}:", indent, index + 1, self.operation, flags)?;
        writeln!(out, "{}   - key: {}", indent, self.key)?;
        if let Some(prev) = &self.prev_value {
            if self.new_value.as_ref() != Some(prev) {
                writeln!(out, "{}   - prev-value: {}", indent, prev)?;
            }
        }
        if let Some(new) = &self.new_value {
            writeln!(out, "{}   - value: {}", indent, new)?;
        }
        if self.prev_state != self.new_state {
            writeln!(
                out,
                "{}   - state: {} -> {}",
                indent, self.prev_state, self.new_state
            )?;
        } else {
            writeln!(out, "{}   - state: {}", indent, self.new_state)?;
        }
        if let Some(err) = &self.prev_error {
            writeln!(out, "{}   - prev-error: {}", indent, err)?;
        }
        if let Some(err) = &self.new_error {
            writeln!(out, "{}   - error: {}", indent, err)?;
        }
        Ok(())
    }
}

/// Retry attempt information of a RetryFailedOps transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedRetry {
    /// Transaction whose failures are being retried
    pub txn_seq_num: u64,
    /// Attempt number (1-based)
    pub attempt: u32,
}

/// Record of one processed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedTxn {
    pub seq_num: u64,
    pub txn_type: TxnType,
    pub resync_type: ResyncType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RecordedRetry>,
    pub values: Vec<RecordedKv>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub planned: Vec<RecordedTxnOp>,
    pub executed: Vec<RecordedTxnOp>,
}

impl RecordedTxn {
    /// Returns true if any executed operation failed.
    pub fn has_errors(&self) -> bool {
        self.executed.iter().any(|op| op.new_error.is_some())
    }

    /// Counts executed operations per operation type (NOOPs excluded).
    pub fn operation_counts(&self) -> (usize, usize, usize) {
        let count = |kind: TxnOperation| {
            self.executed
                .iter()
                .filter(|op| !op.noop && op.operation == kind)
                .count()
        };
        (
            count(TxnOperation::Create),
            count(TxnOperation::Update),
            count(TxnOperation::Delete),
        )
    }

    /// Renders the multi-line text summary.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        // writing into a String cannot fail
        let _ = self.write_text(&mut out);
        out
    }

    fn write_text(&self, out: &mut String) -> fmt::Result {
        writeln!(
            out,
            "+======================================================================================================================+"
        )?;
        let mut header = format!("| Transaction #{}", self.seq_num);
        if !self.description.is_empty() {
            write!(header, " ({})", self.description)?;
        }
        writeln!(out, "{}", header)?;
        writeln!(
            out,
            "+======================================================================================================================+"
        )?;

        writeln!(out, "  * transaction arguments:")?;
        writeln!(out, "      - seq-num: {}", self.seq_num)?;
        if self.txn_type == TxnType::NbTransaction && self.resync_type.is_resync() {
            writeln!(out, "      - type: {}, {}", self.txn_type, self.resync_type)?;
        } else {
            writeln!(out, "      - type: {}", self.txn_type)?;
        }
        if let Some(retry) = &self.retry {
            writeln!(
                out,
                "      - retry: attempt #{} for txn #{}",
                retry.attempt, retry.txn_seq_num
            )?;
        }
        if self.values.is_empty() {
            writeln!(out, "      - values: NONE")?;
        } else {
            writeln!(out, "      - values:")?;
            for kv in &self.values {
                match &kv.value {
                    Some(value) => writeln!(out, "          - key: {}\n            val: {}", kv.key, value)?,
                    None => writeln!(out, "          - key: {}\n            val: <DELETE>", kv.key)?,
                }
            }
        }

        if !self.planned.is_empty() {
            writeln!(out, "  * planned operations:")?;
            for (i, op) in self.planned.iter().enumerate() {
                op.write_text(out, i, "      ")?;
            }
        }

        let elapsed = self.stop - self.start;
        writeln!(
            out,
            "  * executed operations ({} -> {}, dur = {}ms):",
            self.start.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.stop.format("%H:%M:%S%.3f"),
            elapsed.num_milliseconds()
        )?;
        if self.executed.is_empty() {
            writeln!(out, "      <NONE>")?;
        }
        for (i, op) in self.executed.iter().enumerate() {
            op.write_text(out, i, "      ")?;
        }
        Ok(())
    }
}

impl fmt::Display for RecordedTxn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn recorded(executed: Vec<RecordedTxnOp>) -> RecordedTxn {
        let now = Utc::now();
        RecordedTxn {
            seq_num: 4,
            txn_type: TxnType::NbTransaction,
            resync_type: ResyncType::FullResync,
            description: "initial resync".to_string(),
            start: now,
            stop: now,
            retry: None,
            values: vec![RecordedKv {
                key: "config/if/memif0".to_string(),
                value: Some("Interface { name: \"memif0\" }".to_string()),
            }],
            planned: vec![],
            executed,
        }
    }

    #[test]
    fn test_retry_policy_delay() {
        let policy = RetryPolicy::new(Duration::from_millis(100), 3);
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(100));

        let backoff = policy.with_exp_backoff();
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));

        assert!(backoff.allows(2));
        assert!(!backoff.allows(3));
        assert!(RetryPolicy::new(Duration::ZERO, 0).allows(1000));
    }

    #[test]
    fn test_txn_options_builder() {
        let token = CancellationToken::new();
        let opts = TxnOptions::new()
            .with_resync(ResyncType::DownstreamResync)
            .with_retry(RetryPolicy::default())
            .with_description("drift check")
            .with_cancel(token.clone());

        assert!(opts.resync.is_resync());
        assert!(!opts.resync.replaces_desired_state());
        assert_eq!(opts.retry.map(|r| r.max_count), Some(3));
        assert!(!opts.is_cancelled());
        token.cancel();
        assert!(opts.is_cancelled());
    }

    #[test]
    fn test_recorded_txn_text() {
        let txn = recorded(vec![RecordedTxnOp {
            operation: TxnOperation::Create,
            key: "config/if/memif0".to_string(),
            new_value: Some("Interface { name: \"memif0\" }".to_string()),
            prev_state: ValueState::NonExistent,
            new_state: ValueState::Configured,
            ..Default::default()
        }]);

        let text = txn.to_text();
        assert!(text.contains("Transaction #4 (initial resync)"));
        assert!(text.contains("type: NB Transaction, Full Resync"));
        assert!(text.contains("1. CREATE:"));
        assert!(text.contains("state: NONEXISTENT -> CONFIGURED"));
        assert_eq!(txn.operation_counts(), (1, 0, 0));
        assert!(!txn.has_errors());
    }

    #[test]
    fn test_recorded_txn_json() {
        let txn = recorded(vec![RecordedTxnOp {
            operation: TxnOperation::Delete,
            key: "config/acl/acl0".to_string(),
            new_error: Some("device error: busy".to_string()),
            is_retry: true,
            ..Default::default()
        }]);

        let json = serde_json::to_value(&txn).unwrap();
        assert_eq!(json["txn_type"], "NB_TRANSACTION");
        assert_eq!(json["executed"][0]["operation"], "DELETE");
        assert!(txn.has_errors());

        let back: RecordedTxn = serde_json::from_value(json).unwrap();
        assert_eq!(back, txn);
    }
}
