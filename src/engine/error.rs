//! Error and rejection types for transaction processing.

use std::time::Duration;

use thiserror::Error;

use crate::Amount;
use crate::ledger::StoreError;
use crate::model::{TxKind, UserId};

/// Top-level failure returned by [`Engine::submit`](super::Engine::submit).
///
/// Business rejections are not errors: they come back as
/// [`TransactionResult::Rejected`](crate::TransactionResult::Rejected).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("request id must not be empty")]
    InvalidRequestId,

    #[error("timed out after {waited:?} waiting for the lock of user {user}")]
    LockTimeout { user: UserId, waited: Duration },

    #[error("ledger store: {0}")]
    Store(#[from] StoreError),

    #[error("transaction task aborted: {0}")]
    Aborted(String),
}

/// Reason a transaction was rejected. Recorded, so retries see the same reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("invalid {kind} amount {amount}")]
    InvalidAmount { kind: TxKind, amount: Amount },

    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: Amount, requested: Amount },

    #[error("resulting balance out of range")]
    BalanceOverflow,
}

impl Rejection {
    /// Stable short code used in journals and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::InvalidAmount { .. } => "invalid_amount",
            Rejection::InsufficientFunds { .. } => "insufficient_funds",
            Rejection::BalanceOverflow => "balance_overflow",
        }
    }
}
