pub mod amount;
pub mod config;
pub mod csv;
pub mod engine;
pub mod idempotency;
mod journal;
pub mod ledger;
pub mod model;
pub mod projector;

pub use amount::Amount;
pub use config::EngineConfig;
pub use engine::{Engine, EngineError, Rejection};
pub use model::{
    Account, EntryId, LedgerEntry, RequestId, Status, TransactionRequest, TransactionResult,
    TxKind, UserId,
};
