use std::sync::RwLock;

use chrono::Utc;

use super::{LedgerIndex, LedgerStore, StoreError};
use crate::model::{Account, EntryDraft, EntryId, LedgerEntry, UserId};

/// In-memory ledger.
///
/// Intended for tests and dev. Not durable.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    index: RwLock<LedgerIndex>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryLedger {
    fn append(&self, draft: EntryDraft) -> Result<LedgerEntry, StoreError> {
        let mut index = self.index.write().map_err(|_| StoreError::poisoned())?;
        let entry = index.prepare(draft, Utc::now())?;
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
