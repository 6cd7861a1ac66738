use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use chrono::Utc;
use tracing::{error, info};

use super::{LedgerIndex, LedgerStore, StoreError};
use crate::journal::Journal;
use crate::model::{Account, EntryDraft, EntryId, LedgerEntry, UserId};

/// Durable ledger backed by an append-only CSV journal.
///
/// The whole ledger is replayed into memory on open; an entry becomes
/// visible to readers only after its row is synced to disk. The journal file
/// stays exclusively locked while open, so a second process (or a second
/// `FileLedger` in this one) over the same file fails with
/// [`StoreError::Unavailable`].
pub struct FileLedger {
    index: RwLock<LedgerIndex>,
    journal: Mutex<Journal<LedgerEntry>>,
}

impl FileLedger {
    pub const FILE_NAME: &'static str = "ledger.csv";

    /// Open the ledger journal at `path`, replaying and verifying every entry.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let (journal, entries) = Journal::open(path)?;
        let index = LedgerIndex::replay(entries, path)?;
        info!(
            path = %path.display(),
            entries = index.entries.len(),
            users = index.by_user.len(),
            "ledger opened"
        );
        Ok(Self {
            index: RwLock::new(index),
            journal: Mutex::new(journal),
        })
    }

    /// Open `ledger.csv` inside `dir`.
    pub fn open_in(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open(dir.as_ref().join(Self::FILE_NAME))
    }

    pub fn path(&self) -> Result<PathBuf, StoreError> {
        let journal = self.journal.lock().map_err(|_| StoreError::poisoned())?;
        Ok(journal.path().to_path_buf())
    }
}

impl LedgerStore for FileLedger {
    fn append(&self, draft: EntryDraft) -> Result<LedgerEntry, StoreError> {
        // the index write lock serializes appends so ids follow file order
        let mut index = self.index.write().map_err(|_| StoreError::poisoned())?;
        let entry = index.prepare(draft, Utc::now())?;

        let mut journal = self.journal.lock().map_err(|_| StoreError::poisoned())?;
        if let Err(e) = journal.append(&entry) {
            error!(
                entry = entry.entry_id,
                user = entry.user_id,
                error = %e,
                "ledger append failed"
            );
            return Err(e);
        }

        index.push(entry.clone());
        Ok(entry)
    }

    fn read_account(&self, user_id: UserId) -> Result<Account, StoreError> {
        let index = self.index.read().map_err(|_| StoreError::poisoned())?;
        Ok(index.account(user_id))
    }

    fn read_page(
        &self,
        user_id: UserId,
        after: Option<EntryId>,
        max: usize,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let index = self.index.read().map_err(|_| StoreError::poisoned())?;
        Ok(index.page(user_id, after, max))
    }

    fn scan(&self, after: Option<EntryId>, max: usize) -> Result<Vec<LedgerEntry>, StoreError> {
        let index = self.index.read().map_err(|_| StoreError::poisoned())?;
        Ok(index.scan(after, max))
    }

    fn accounts(&self) -> Result<Vec<Account>, StoreError> {
        let index = self.index.read().map_err(|_| StoreError::poisoned())?;
        Ok(index.accounts())
    }
}

#[cfg(test)]
impl FileLedger {
    pub(crate) fn inject_fault(&self, fault: Option<crate::journal::Fault>) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.inject_fault(fault);
        }
    }
}
