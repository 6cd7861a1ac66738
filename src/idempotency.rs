//! Idempotency guard: remembers the outcome of every processed request so a
//! retry resolves to the original outcome instead of a second mutation.
//!
//! Must be consulted and updated under the same per-user lock as the
//! transaction itself. Records may be evicted after a retention window,
//! which only shortens how long replays are detected.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::Amount;
use crate::engine::Rejection;
use crate::journal::Journal;
use crate::ledger::StoreError;
use crate::model::{EntryId, LedgerEntry, RequestId, TransactionResult, TxKind, UserId};

type Key = (UserId, RequestId);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub outcome: TransactionResult,
    pub recorded_at: DateTime<Utc>,
}

pub struct IdempotencyGuard {
    records: Mutex<HashMap<Key, IdempotencyRecord>>,
    journal: Option<Mutex<Journal<OutcomeRow>>>,
    retention: Option<Duration>,
}

impl IdempotencyGuard {
    pub const FILE_NAME: &'static str = "idempotency.csv";

    /// In-memory guard. `retention: None` keeps records forever.
    pub fn new(retention: Option<Duration>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            journal: None,
            retention,
        }
    }

    /// Guard backed by a durable journal at `path`, replaying live records.
    pub fn open(path: impl AsRef<Path>, retention: Option<Duration>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let (journal, rows) = Journal::<OutcomeRow>::open(path)?;
        let cutoff = cutoff(retention, Utc::now());

        let mut records = HashMap::new();
        for (idx, row) in rows.into_iter().enumerate() {
            let (key, record) = row.into_record().map_err(|reason| StoreError::Corrupt {
                path: path.to_path_buf(),
                line: idx as u64 + 1,
                reason,
            })?;
            if cutoff.is_some_and(|c| record.recorded_at < c) {
                continue;
            }
            records.insert(key, record);
        }
        info!(path = %path.display(), records = records.len(), "idempotency journal opened");

        Ok(Self {
            records: Mutex::new(records),
            journal: Some(Mutex::new(journal)),
            retention,
        })
    }

    /// Previously recorded outcome for this request, if any.
    pub fn check(
        &self,
        user_id: UserId,
        request_id: &RequestId,
    ) -> Result<Option<TransactionResult>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::poisoned())?;
        Ok(records
            .get(&(user_id, request_id.clone()))
            .map(|r| r.outcome.clone()))
    }

    /// Record an outcome.
    ///
    /// An applied outcome is installed in memory before the journal write:
    /// its ledger entry already exists and reseeds the guard on restart, so
    /// a journal failure only needs reporting. A rejection has no ledger
    /// trace, so it is journaled first and installed only once durable.
    pub fn record(
        &self,
        user_id: UserId,
        request_id: RequestId,
        outcome: TransactionResult,
    ) -> Result<(), StoreError> {
        let recorded_at = Utc::now();
        let row = OutcomeRow::new(user_id, &request_id, &outcome, recorded_at);
        let applied = outcome.is_applied();
        let record = IdempotencyRecord {
            outcome,
            recorded_at,
        };

        if applied {
            self.install((user_id, request_id), record)?;
            self.journal_append(&row)
        } else {
            self.journal_append(&row)?;
            self.install((user_id, request_id), record)
        }
    }

    /// Install applied outcomes for committed ledger entries that have no
    /// record yet. Entries older than the retention window are skipped.
    pub fn seed<'a>(
        &self,
        entries: impl IntoIterator<Item = &'a LedgerEntry>,
    ) -> Result<usize, StoreError> {
        let cutoff = cutoff(self.retention, Utc::now());
        let mut records = self.records.lock().map_err(|_| StoreError::poisoned())?;
        let mut seeded = 0;
        for entry in entries {
            if cutoff.is_some_and(|c| entry.created_at < c) {
                continue;
            }
            records
                .entry((entry.user_id, entry.request_id.clone()))
                .or_insert_with(|| {
                    seeded += 1;
                    IdempotencyRecord {
                        outcome: TransactionResult::from(entry),
                        recorded_at: entry.created_at,
                    }
                });
        }
        Ok(seeded)
    }

    /// Evict records older than the retention window as of `now`.
    // TODO: rewrite the journal without evicted rows once it outgrows the live set
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let Some(cutoff) = cutoff(self.retention, now) else {
            return Ok(0);
        };
        let mut records = self.records.lock().map_err(|_| StoreError::poisoned())?;
        let before = records.len();
        records.retain(|_, r| r.recorded_at >= cutoff);
        let evicted = before - records.len();
        if evicted > 0 {
            debug!(evicted, "idempotency records purged");
        }
        Ok(evicted)
    }

    fn install(&self, key: Key, record: IdempotencyRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().map_err(|_| StoreError::poisoned())?;
        records.insert(key, record);
        Ok(())
    }

    fn journal_append(&self, row: &OutcomeRow) -> Result<(), StoreError> {
        if let Some(journal) = &self.journal {
            let mut journal = journal.lock().map_err(|_| StoreError::poisoned())?;
            journal.append(row)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn inject_fault(&self, fault: Option<crate::journal::Fault>) {
        if let Some(Ok(mut journal)) = self.journal.as_ref().map(|j| j.lock()) {
            journal.inject_fault(fault);
        }
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::poisoned())?;
        Ok(records.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

fn cutoff(retention: Option<Duration>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let window = TimeDelta::from_std(retention?).unwrap_or(TimeDelta::MAX);
    now.checked_sub_signed(window)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RowStatus {
    Applied,
    Rejected,
}

/// Flat journal row for one recorded outcome.
#[derive(Debug, Serialize, Deserialize)]
struct OutcomeRow {
    user_id: UserId,
    request_id: RequestId,
    status: RowStatus,
    entry_id: Option<EntryId>,
    resulting_balance: Option<Amount>,
    reason: Option<String>,
    kind: Option<TxKind>,
    amount: Option<Amount>,
    balance: Option<Amount>,
    requested: Option<Amount>,
    recorded_at: DateTime<Utc>,
}

impl OutcomeRow {
    fn new(
        user_id: UserId,
        request_id: &RequestId,
        outcome: &TransactionResult,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        let mut row = OutcomeRow {
            user_id,
            request_id: request_id.clone(),
            status: RowStatus::Applied,
            entry_id: None,
            resulting_balance: None,
            reason: None,
            kind: None,
            amount: None,
            balance: None,
            requested: None,
            recorded_at,
        };
        match outcome {
            TransactionResult::Applied {
                entry_id,
                resulting_balance,
            } => {
                row.entry_id = Some(*entry_id);
                row.resulting_balance = Some(*resulting_balance);
            }
            TransactionResult::Rejected { reason } => {
                row.status = RowStatus::Rejected;
                row.reason = Some(reason.code().to_string());
                match reason {
                    Rejection::InvalidAmount { kind, amount } => {
                        row.kind = Some(*kind);
                        row.amount = Some(*amount);
                    }
                    Rejection::InsufficientFunds { balance, requested } => {
                        row.balance = Some(*balance);
                        row.requested = Some(*requested);
                    }
                    Rejection::BalanceOverflow => {}
                }
            }
        }
        row
    }

    fn into_record(self) -> Result<(Key, IdempotencyRecord), String> {
        let outcome = match self.status {
            RowStatus::Applied => TransactionResult::Applied {
                entry_id: self.entry_id.ok_or("applied row without entry_id")?,
                resulting_balance: self
                    .resulting_balance
                    .ok_or("applied row without resulting_balance")?,
            },
            RowStatus::Rejected => {
                let reason = match self.reason.as_deref() {
                    Some("invalid_amount") => Rejection::InvalidAmount {
                        kind: self.kind.ok_or("invalid_amount row without kind")?,
                        amount: self.amount.ok_or("invalid_amount row without amount")?,
                    },
                    Some("insufficient_funds") => Rejection::InsufficientFunds {
                        balance: self.balance.ok_or("insufficient_funds row without balance")?,
                        requested: self
                            .requested
                            .ok_or("insufficient_funds row without requested")?,
                    },
                    Some("balance_overflow") => Rejection::BalanceOverflow,
                    other => return Err(format!("unknown rejection reason {other:?}")),
                };
                TransactionResult::Rejected { reason }
            }
        };
        Ok((
            (self.user_id, self.request_id),
            IdempotencyRecord {
                outcome,
                recorded_at: self.recorded_at,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Fault;
    use tempfile::TempDir;

    fn applied(entry_id: EntryId, balance: i64) -> TransactionResult {
        TransactionResult::Applied {
            entry_id,
            resulting_balance: Amount::from_minor(balance),
        }
    }

    fn rejected(reason: Rejection) -> TransactionResult {
        TransactionResult::Rejected { reason }
    }

    #[test]
    fn check_miss_then_hit() {
        let guard = IdempotencyGuard::new(None);
        let r1 = RequestId::from("r1");
        assert_eq!(guard.check(1, &r1).unwrap(), None);

        guard.record(1, r1.clone(), applied(1, 500)).unwrap();
        assert_eq!(guard.check(1, &r1).unwrap(), Some(applied(1, 500)));
    }

    #[test]
    fn keys_are_scoped_per_user() {
        let guard = IdempotencyGuard::new(None);
        guard.record(1, "r1".into(), applied(1, 500)).unwrap();
        assert_eq!(guard.check(2, &"r1".into()).unwrap(), None);
    }

    #[test]
    fn purge_respects_retention() {
        let guard = IdempotencyGuard::new(Some(Duration::from_secs(60)));
        guard.record(1, "r1".into(), applied(1, 500)).unwrap();

        assert_eq!(guard.purge_expired(Utc::now()).unwrap(), 0);
        let later = Utc::now() + TimeDelta::seconds(120);
        assert_eq!(guard.purge_expired(later).unwrap(), 1);
        assert_eq!(guard.check(1, &"r1".into()).unwrap(), None);
    }

    #[test]
    fn unbounded_retention_never_purges() {
        let guard = IdempotencyGuard::new(None);
        guard.record(1, "r1".into(), applied(1, 500)).unwrap();
        let far = Utc::now() + TimeDelta::days(3650);
        assert_eq!(guard.purge_expired(far).unwrap(), 0);
        assert_eq!(guard.len().unwrap(), 1);
    }

    #[test]
    fn journal_replays_every_outcome_shape() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(IdempotencyGuard::FILE_NAME);
        let outcomes = vec![
            ("a", applied(7, 1234)),
            (
                "b",
                rejected(Rejection::InsufficientFunds {
                    balance: Amount::from_minor(300),
                    requested: Amount::from_minor(-1000),
                }),
            ),
            (
                "c",
                rejected(Rejection::InvalidAmount {
                    kind: TxKind::Withdrawal,
                    amount: Amount::from_minor(5),
                }),
            ),
            ("d", rejected(Rejection::BalanceOverflow)),
        ];
        {
            let guard = IdempotencyGuard::open(&path, None).unwrap();
            for (id, outcome) in &outcomes {
                guard.record(3, (*id).into(), outcome.clone()).unwrap();
            }
        }

        let guard = IdempotencyGuard::open(&path, None).unwrap();
        for (id, outcome) in outcomes {
            assert_eq!(guard.check(3, &id.into()).unwrap(), Some(outcome));
        }
    }

    #[test]
    fn rejection_is_not_installed_when_journal_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(IdempotencyGuard::FILE_NAME);
        let guard = IdempotencyGuard::open(&path, None).unwrap();
        let reason = Rejection::InsufficientFunds {
            balance: Amount::ZERO,
            requested: Amount::from_minor(-10),
        };

        guard.inject_fault(Some(Fault::TornWrite));
        assert!(guard.record(1, "w".into(), rejected(reason.clone())).is_err());
        assert_eq!(guard.check(1, &"w".into()).unwrap(), None);

        guard.inject_fault(None);
        guard.record(1, "w".into(), rejected(reason.clone())).unwrap();
        drop(guard);

        let guard = IdempotencyGuard::open(&path, None).unwrap();
        assert_eq!(guard.check(1, &"w".into()).unwrap(), Some(rejected(reason)));
    }

    #[test]
    fn applied_outcome_is_installed_even_when_journal_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(IdempotencyGuard::FILE_NAME);
        let guard = IdempotencyGuard::open(path, None).unwrap();

        guard.inject_fault(Some(Fault::TornWrite));
        assert!(guard.record(1, "d".into(), applied(1, 10)).is_err());
        assert_eq!(guard.check(1, &"d".into()).unwrap(), Some(applied(1, 10)));
    }

    #[test]
    fn expired_journal_rows_are_skipped_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(IdempotencyGuard::FILE_NAME);
        {
            let guard = IdempotencyGuard::open(&path, None).unwrap();
            guard.record(1, "old".into(), applied(1, 10)).unwrap();
        }

        let guard = IdempotencyGuard::open(&path, Some(Duration::ZERO)).unwrap();
        assert!(guard.is_empty().unwrap());
    }

    #[test]
    fn seed_keeps_existing_records() {
        let guard = IdempotencyGuard::new(None);
        guard
            .record(1, "r1".into(), rejected(Rejection::BalanceOverflow))
            .unwrap();
        let entry = LedgerEntry {
            entry_id: 4,
            user_id: 1,
            amount: Amount::from_minor(10),
            kind: TxKind::Deposit,
            request_id: "r1".into(),
            resulting_balance: Amount::from_minor(10),
            version: 1,
            created_at: Utc::now(),
        };
        let other = LedgerEntry {
            entry_id: 5,
            request_id: "r2".into(),
            ..entry.clone()
        };

        assert_eq!(guard.seed([&entry, &other]).unwrap(), 1);
        assert_eq!(
            guard.check(1, &"r1".into()).unwrap(),
            Some(rejected(Rejection::BalanceOverflow))
        );
        assert_eq!(guard.check(1, &"r2".into()).unwrap(), Some(applied(5, 10)));
    }
}
