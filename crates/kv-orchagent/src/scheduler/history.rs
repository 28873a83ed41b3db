//! Transaction history.

use chrono::{DateTime, Duration, Utc};
use kv_orch_common::RecordedTxn;
use std::collections::VecDeque;

fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or_else(|_| Duration::days(36_500))
}

/// Recorded transactions ordered by sequence number.
///
/// Records older than the age limit are trimmed, except those started within
/// the init period after the history was created.
#[derive(Debug)]
pub(crate) struct TxnHistory {
    records: VecDeque<RecordedTxn>,
    enabled: bool,
    created: DateTime<Utc>,
    age_limit: Duration,
    init_period: Duration,
}

impl TxnHistory {
    pub fn new(enabled: bool, age_limit: std::time::Duration, init_period: std::time::Duration) -> Self {
        Self {
            records: VecDeque::new(),
            enabled,
            created: Utc::now(),
            age_limit: to_chrono(age_limit),
            init_period: to_chrono(init_period),
        }
    }

    pub fn push(&mut self, txn: RecordedTxn) {
        if !self.enabled {
            return;
        }
        self.records.push_back(txn);
        self.trim(Utc::now());
    }

    /// Drops records that aged out at `now`.
    pub fn trim(&mut self, now: DateTime<Utc>) {
        let horizon = now - self.age_limit;
        let permanent_until = self.created + self.init_period;
        self.records
            .retain(|txn| txn.start < permanent_until || txn.stop >= horizon);
    }

    /// Records started within `[since, until]`, both bounds optional.
    pub fn range(&self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Vec<RecordedTxn> {
        self.records
            .iter()
            .filter(|txn| since.map_or(true, |since| txn.start >= since))
            .filter(|txn| until.map_or(true, |until| txn.start <= until))
            .cloned()
            .collect()
    }

    pub fn get(&self, seq_num: u64) -> Option<RecordedTxn> {
        self.records.iter().find(|txn| txn.seq_num == seq_num).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[cfg(test)]
    fn set_created(&mut self, created: DateTime<Utc>) {
        self.created = created;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv_orch_common::{ResyncType, TxnType};
    use pretty_assertions::assert_eq;
    use std::time::Duration as StdDuration;

    fn txn(seq_num: u64, start: DateTime<Utc>) -> RecordedTxn {
        RecordedTxn {
            seq_num,
            txn_type: TxnType::NbTransaction,
            resync_type: ResyncType::NotResync,
            description: String::new(),
            start,
            stop: start,
            retry: None,
            values: vec![],
            planned: vec![],
            executed: vec![],
        }
    }

    #[test]
    fn test_disabled_history_records_nothing() {
        let mut history = TxnHistory::new(false, StdDuration::from_secs(60), StdDuration::ZERO);
        history.push(txn(0, Utc::now()));
        assert_eq!(history.len(), 0);
    }

    #[test]
    fn test_trim_by_age_keeps_init_period() {
        let now = Utc::now();
        let mut history = TxnHistory::new(true, StdDuration::from_secs(60), StdDuration::from_secs(10));
        history.set_created(now - Duration::hours(2));

        history.records.push_back(txn(0, now - Duration::hours(2)));
        history.records.push_back(txn(1, now - Duration::hours(1)));
        history.records.push_back(txn(2, now - Duration::seconds(5)));
        history.trim(now);

        let kept: Vec<u64> = history.range(None, None).iter().map(|t| t.seq_num).collect();
        assert_eq!(kept, vec![0, 2]);
    }

    #[test]
    fn test_range_and_get() {
        let now = Utc::now();
        let mut history = TxnHistory::new(true, StdDuration::from_secs(3600), StdDuration::ZERO);
        for i in 0..4 {
            history.push(txn(i, now + Duration::seconds(i as i64)));
        }

        let window = history.range(Some(now + Duration::seconds(1)), Some(now + Duration::seconds(2)));
        assert_eq!(window.iter().map(|t| t.seq_num).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(history.get(3).map(|t| t.seq_num), Some(3));
        assert!(history.get(9).is_none());
    }
}
