use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::Amount;
use crate::model::{EntryId, UserId};

/// Failures of the durable stores (ledger and idempotency journal).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The medium could not accept the write. Nothing was changed.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("version conflict for user {user}: expected {expected}, found {found}")]
    VersionConflict {
        user: UserId,
        expected: u64,
        found: u64,
    },

    #[error("entry {entry_id}: expected resulting balance {expected}, found {found}")]
    Inconsistent {
        entry_id: EntryId,
        expected: Amount,
        found: Amount,
    },

    #[error("balance of user {user} out of range")]
    Overflow { user: UserId },

    #[error("{}: line {line}: {reason}", path.display())]
    Corrupt {
        path: PathBuf,
        line: u64,
        reason: String,
    },
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl StoreError {
    pub(crate) fn poisoned() -> Self {
        StoreError::Unavailable("lock poisoned".to_string())
    }
}
