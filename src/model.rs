//! Core domain types for the wallet engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Amount;
use crate::engine::Rejection;

/// User identifier, owned by the user-management layer.
pub type UserId = u64;

/// Global ledger sequence number. The first entry of a store is 1.
pub type EntryId = u64;

/// Caller-supplied idempotency key, scoped per user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        RequestId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::new(value)
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        RequestId(value)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of balance-affecting operation.
///
/// Amounts are signed: deposits must be positive, withdrawals negative,
/// adjustments may carry either sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Deposit,
    Withdrawal,
    Adjustment,
}

impl TxKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TxKind::Deposit => "deposit",
            TxKind::Withdrawal => "withdrawal",
            TxKind::Adjustment => "adjustment",
        }
    }

    /// Whether `amount` has the sign this kind requires.
    pub fn accepts(self, amount: Amount) -> bool {
        match self {
            TxKind::Deposit => amount.is_positive(),
            TxKind::Withdrawal => amount.is_negative(),
            TxKind::Adjustment => !amount.is_zero(),
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to apply `amount` to a user's wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    pub user_id: UserId,
    pub amount: Amount,
    pub kind: TxKind,
    pub request_id: RequestId,
}

impl TransactionRequest {
    pub fn new(
        user_id: UserId,
        amount: Amount,
        kind: TxKind,
        request_id: impl Into<RequestId>,
    ) -> Self {
        Self {
            user_id,
            amount,
            kind,
            request_id: request_id.into(),
        }
    }
}

/// Current state of a user's wallet. Always derivable from the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Account {
    pub user_id: UserId,
    pub balance: Amount,
    /// Number of entries applied to this account.
    pub version: u64,
}

impl Account {
    /// The state of an account with no ledger entries.
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            balance: Amount::ZERO,
            version: 0,
        }
    }
}

/// An entry ready to be appended (not yet assigned an id or timestamp).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDraft {
    pub user_id: UserId,
    pub amount: Amount,
    pub kind: TxKind,
    pub request_id: RequestId,
    pub resulting_balance: Amount,
    /// Account version the draft was computed against.
    pub expected_version: u64,
}

/// An immutable, committed ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: EntryId,
    pub user_id: UserId,
    pub amount: Amount,
    pub kind: TxKind,
    pub request_id: RequestId,
    pub resulting_balance: Amount,
    /// Account version after this entry.
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn account(&self) -> Account {
        Account {
            user_id: self.user_id,
            balance: self.resulting_balance,
            version: self.version,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Applied,
    Rejected,
}

/// The outcome of a submitted transaction. Replays of the same request
/// return an identical value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionResult {
    Applied {
        entry_id: EntryId,
        resulting_balance: Amount,
    },
    Rejected {
        reason: Rejection,
    },
}

impl TransactionResult {
    pub fn status(&self) -> Status {
        match self {
            TransactionResult::Applied { .. } => Status::Applied,
            TransactionResult::Rejected { .. } => Status::Rejected,
        }
    }

    pub fn is_applied(&self) -> bool {
        self.status() == Status::Applied
    }

    pub fn reason(&self) -> Option<&Rejection> {
        match self {
            TransactionResult::Rejected { reason } => Some(reason),
            TransactionResult::Applied { .. } => None,
        }
    }

    pub fn entry_id(&self) -> Option<EntryId> {
        match self {
            TransactionResult::Applied { entry_id, .. } => Some(*entry_id),
            TransactionResult::Rejected { .. } => None,
        }
    }

    pub fn resulting_balance(&self) -> Option<Amount> {
        match self {
            TransactionResult::Applied {
                resulting_balance, ..
            } => Some(*resulting_balance),
            TransactionResult::Rejected { .. } => None,
        }
    }
}

impl From<&LedgerEntry> for TransactionResult {
    fn from(entry: &LedgerEntry) -> Self {
        TransactionResult::Applied {
            entry_id: entry.entry_id,
            resulting_balance: entry.resulting_balance,
        }
    }
}
