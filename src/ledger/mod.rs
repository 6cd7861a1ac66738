//! Ledger store: the append-only, authoritative record of every accepted
//! transaction.
//!
//! Entries get a global, gap-free `entry_id` at append time. Nothing but
//! [`LedgerStore::append`] writes ledger data; balances are derived from the
//! latest entry of each user.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::Amount;
use crate::model::{Account, EntryDraft, EntryId, LedgerEntry, UserId};

mod error;
pub use error::StoreError;

mod file;
pub use file::FileLedger;

mod history;
pub use history::{History, read_history};

mod memory;
pub use memory::MemoryLedger;

/// Durable append-only storage for ledger entries.
///
/// Implementations must make `append` all-or-nothing: on error no id is
/// consumed and no reader can observe the entry.
pub trait LedgerStore: Send + Sync {
    /// Assign `entry_id` and `created_at`, persist, and return the entry.
    ///
    /// Fails with [`StoreError::VersionConflict`] if the user's latest version
    /// is not `draft.expected_version`, and with [`StoreError::Inconsistent`]
    /// if `draft.resulting_balance` does not follow from the latest balance.
    fn append(&self, draft: EntryDraft) -> Result<LedgerEntry, StoreError>;

    /// Balance and version from the user's latest entry, or an empty account.
    fn read_account(&self, user_id: UserId) -> Result<Account, StoreError>;

    /// The user's latest `resulting_balance`, or zero.
    fn read_balance(&self, user_id: UserId) -> Result<Amount, StoreError> {
        Ok(self.read_account(user_id)?.balance)
    }

    /// Up to `max` entries of one user with `entry_id > after`, ascending.
    fn read_page(
        &self,
        user_id: UserId,
        after: Option<EntryId>,
        max: usize,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Up to `max` entries of all users with `entry_id > after`, ascending.
    fn scan(&self, after: Option<EntryId>, max: usize) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Every account that has at least one entry, ordered by user id.
    fn accounts(&self) -> Result<Vec<Account>, StoreError>;
}

/// In-memory view of the ledger shared by both store implementations.
#[derive(Debug, Default)]
struct LedgerIndex {
    /// `entries[i].entry_id == i + 1`
    entries: Vec<LedgerEntry>,
    by_user: HashMap<UserId, Vec<usize>>,
}

impl LedgerIndex {
    /// Rebuild from replayed entries, checking the chain invariants.
    fn replay(entries: Vec<LedgerEntry>, path: &Path) -> Result<Self, StoreError> {
        let mut index = LedgerIndex::default();
        for (pos, entry) in entries.into_iter().enumerate() {
            let corrupt = |reason: String| StoreError::Corrupt {
                path: path.to_path_buf(),
                line: pos as u64 + 1,
                reason,
            };

            if entry.entry_id != index.next_id() {
                return Err(corrupt(format!(
                    "expected entry id {}, found {}",
                    index.next_id(),
                    entry.entry_id
                )));
            }
            let prev = index.account(entry.user_id);
            if entry.version != prev.version + 1 {
                return Err(corrupt(format!(
                    "expected version {}, found {}",
                    prev.version + 1,
                    entry.version
                )));
            }
            if prev.balance.checked_add(entry.amount) != Some(entry.resulting_balance) {
                return Err(corrupt(format!(
                    "resulting balance {} does not follow {} + {}",
                    entry.resulting_balance, prev.balance, entry.amount
                )));
            }
            index.push(entry);
        }
        Ok(index)
    }

    fn next_id(&self) -> EntryId {
        self.entries.len() as EntryId + 1
    }

    fn account(&self, user_id: UserId) -> Account {
        self.by_user
            .get(&user_id)
            .and_then(|idxs| idxs.last())
            .map(|&i| self.entries[i].account())
            .unwrap_or_else(|| Account::empty(user_id))
    }

    /// Validate a draft against the current state and finalize it.
    fn prepare(&self, draft: EntryDraft, now: DateTime<Utc>) -> Result<LedgerEntry, StoreError> {
        let current = self.account(draft.user_id);
        if current.version != draft.expected_version {
            return Err(StoreError::VersionConflict {
                user: draft.user_id,
                expected: draft.expected_version,
                found: current.version,
            });
        }

        let entry_id = self.next_id();
        match current.balance.checked_add(draft.amount) {
            Some(expected) if expected == draft.resulting_balance => {}
            expected => {
                return Err(StoreError::Inconsistent {
                    entry_id,
                    expected: expected.unwrap_or(current.balance),
                    found: draft.resulting_balance,
                });
            }
        }

        Ok(LedgerEntry {
            entry_id,
            user_id: draft.user_id,
            amount: draft.amount,
            kind: draft.kind,
            request_id: draft.request_id,
            resulting_balance: draft.resulting_balance,
            version: current.version + 1,
            created_at: now,
        })
    }

    fn push(&mut self, entry: LedgerEntry) {
        let pos = self.entries.len();
        self.by_user.entry(entry.user_id).or_default().push(pos);
        self.entries.push(entry);
    }

    fn page(&self, user_id: UserId, after: Option<EntryId>, max: usize) -> Vec<LedgerEntry> {
        let Some(idxs) = self.by_user.get(&user_id) else {
            return Vec::new();
        };
        let after = after.unwrap_or(0);
        let start = idxs.partition_point(|&i| self.entries[i].entry_id <= after);
        idxs[start..]
            .iter()
            .take(max)
            .map(|&i| self.entries[i].clone())
            .collect()
    }

    fn scan(&self, after: Option<EntryId>, max: usize) -> Vec<LedgerEntry> {
        // ids are positions + 1
        let start = (after.unwrap_or(0) as usize).min(self.entries.len());
        self.entries[start..].iter().take(max).cloned().collect()
    }

    fn accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<_> = self.by_user.keys().map(|&u| self.account(u)).collect();
        accounts.sort_by_key(|a| a.user_id);
        accounts
    }
}
