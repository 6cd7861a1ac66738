//! Transaction coordinator.
//!
//! The engine turns "apply amount X to user U" requests into exactly-once
//! ledger appends. Every request runs under its user's lock:
//! idempotency check, validation against the projected balance, ledger
//! append, projector update, outcome record.
//! Requests of different users never wait for each other.

use std::fs;
use std::sync::Arc;

use chrono::Utc;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::Amount;
use crate::config::EngineConfig;
use crate::idempotency::IdempotencyGuard;
use crate::ledger::{FileLedger, History, LedgerStore, MemoryLedger, StoreError, read_history};
use crate::model::{
    Account, EntryDraft, EntryId, RequestId, TransactionRequest, TransactionResult, TxKind, UserId,
};
use crate::projector::BalanceProjector;

mod error;
pub use error::{EngineError, Rejection};

mod locks;
pub use locks::{LockTable, UserLock};

/// The wallet transaction engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    ledger: Arc<dyn LedgerStore>,
    projector: BalanceProjector,
    guard: IdempotencyGuard,
    locks: Arc<LockTable>,
    config: EngineConfig,
}

/// Construction
impl Engine {
    /// Build an engine over `ledger`, seeding `guard` with the applied
    /// outcomes the ledger already holds.
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        guard: IdempotencyGuard,
        config: EngineConfig,
    ) -> Result<Self, StoreError> {
        let page_size = config.history_page_size.max(1);
        let mut after = None;
        loop {
            let page = ledger.scan(after, page_size)?;
            let Some(last) = page.last() else { break };
            after = Some(last.entry_id);
            guard.seed(&page)?;
        }

        Ok(Self {
            inner: Arc::new(Inner {
                projector: BalanceProjector::new(ledger.clone(), page_size),
                ledger,
                guard,
                locks: LockTable::new(),
                config,
            }),
        })
    }

    /// Non-durable engine, for tests and dev.
    pub fn in_memory(config: EngineConfig) -> Self {
        let ledger: Arc<dyn LedgerStore> = Arc::new(MemoryLedger::new());
        let page_size = config.history_page_size.max(1);
        Self {
            inner: Arc::new(Inner {
                projector: BalanceProjector::new(ledger.clone(), page_size),
                ledger,
                guard: IdempotencyGuard::new(config.idempotency_retention()),
                locks: LockTable::new(),
                config,
            }),
        }
    }

    /// Durable engine when `config.data_dir` is set, in-memory otherwise.
    pub fn open(config: EngineConfig) -> Result<Self, StoreError> {
        let Some(dir) = config.data_dir.clone() else {
            return Ok(Self::in_memory(config));
        };
        fs::create_dir_all(&dir)?;
        let ledger = Arc::new(FileLedger::open_in(&dir)?);
        let guard = IdempotencyGuard::open(
            dir.join(IdempotencyGuard::FILE_NAME),
            config.idempotency_retention(),
        )?;
        Self::new(ledger, guard, config)
    }
}

/// Public API
impl Engine {
    /// Apply `amount` of `kind` to `user_id`, exactly once per `request_id`.
    pub async fn submit(
        &self,
        user_id: UserId,
        amount: Amount,
        kind: TxKind,
        request_id: impl Into<RequestId>,
    ) -> Result<TransactionResult, EngineError> {
        self.submit_request(TransactionRequest::new(user_id, amount, kind, request_id))
            .await
    }

    /// Submit a prepared request.
    ///
    /// The only suspension point is the wait for the user's lock. Once the
    /// lock is held the request runs to completion on a blocking task, so
    /// dropping this future (e.g. on a caller timeout) never leaves a
    /// half-applied transaction.
    pub async fn submit_request(
        &self,
        req: TransactionRequest,
    ) -> Result<TransactionResult, EngineError> {
        if req.request_id.is_empty() {
            let result = Err(EngineError::InvalidRequestId);
            Self::log_result(&req, &result);
            return result;
        }

        let timeout = self.inner.config.lock_timeout();
        let Some(lock) = self.inner.locks.acquire(req.user_id, timeout).await else {
            let result = Err(EngineError::LockTimeout {
                user: req.user_id,
                waited: timeout,
            });
            Self::log_result(&req, &result);
            return result;
        };

        let inner = self.inner.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _lock = lock;
            let result = inner.apply_locked(&req);
            Self::log_result(&req, &result);
            result
        });
        task.await
            .map_err(|e| EngineError::Aborted(e.to_string()))?
    }

    /// Current balance of `user_id` (zero for unknown users).
    pub fn get_balance(&self, user_id: UserId) -> Result<Amount, EngineError> {
        Ok(self.inner.projector.get(user_id)?)
    }

    pub fn get_account(&self, user_id: UserId) -> Result<Account, EngineError> {
        Ok(self.inner.projector.account(user_id)?)
    }

    /// Lazy history of `user_id` after `since` (exclusive), at most `limit` entries.
    pub fn get_history(
        &self,
        user_id: UserId,
        since: Option<EntryId>,
        limit: Option<usize>,
    ) -> History {
        read_history(
            self.inner.ledger.clone(),
            user_id,
            since,
            limit,
            self.inner.config.history_page_size,
        )
    }

    /// All accounts with at least one entry, by user id.
    pub fn accounts(&self) -> Result<Vec<Account>, EngineError> {
        Ok(self.inner.ledger.accounts()?)
    }

    /// Rebuild the user's cached account from the ledger, verifying the
    /// balance chain of every entry.
    pub async fn verify(&self, user_id: UserId) -> Result<Account, EngineError> {
        let timeout = self.inner.config.lock_timeout();
        let _lock = self
            .inner
            .locks
            .acquire(user_id, timeout)
            .await
            .ok_or(EngineError::LockTimeout {
                user: user_id,
                waited: timeout,
            })?;
        Ok(self.inner.projector.rebuild(user_id)?)
    }

    /// Evict idempotency records older than the configured retention.
    pub fn purge_idempotency(&self) -> Result<usize, EngineError> {
        Ok(self.inner.guard.purge_expired(Utc::now())?)
    }

    /// Run the engine over a stream of requests, in order.
    pub async fn run(&self, mut stream: impl Stream<Item = TransactionRequest> + Unpin) {
        while let Some(req) = stream.next().await {
            // outcomes are logged; a failed request must not stop the run
            let _ = self.submit_request(req).await;
        }
    }
}

/// Private API
impl Engine {
    /// Small helper to log `submit` results
    fn log_result(req: &TransactionRequest, result: &Result<TransactionResult, EngineError>) {
        match result {
            Ok(TransactionResult::Applied {
                entry_id,
                resulting_balance,
            }) => {
                info!(
                    user = req.user_id,
                    request = %req.request_id,
                    amount = %req.amount,
                    entry = entry_id,
                    balance = %resulting_balance,
                    "{} applied",
                    req.kind
                );
            }
            Ok(TransactionResult::Rejected { reason }) => {
                info!(
                    user = req.user_id,
                    request = %req.request_id,
                    amount = %req.amount,
                    reason = %reason,
                    "{} rejected",
                    req.kind
                );
            }
            Err(e) => {
                warn!(
                    user = req.user_id,
                    request = %req.request_id,
                    amount = %req.amount,
                    error = %e,
                    "{} failed",
                    req.kind
                );
            }
        }
    }
}

impl Inner {
    /// Steps run while holding the user's lock.
    fn apply_locked(&self, req: &TransactionRequest) -> Result<TransactionResult, EngineError> {
        if let Some(outcome) = self.guard.check(req.user_id, &req.request_id)? {
            debug!(user = req.user_id, request = %req.request_id, "replayed recorded outcome");
            return Ok(outcome);
        }

        let account = self.projector.account(req.user_id)?;
        let outcome = match Self::validate(&account, req) {
            Err(reason) => TransactionResult::Rejected { reason },
            Ok(resulting_balance) => {
                let draft = EntryDraft {
                    user_id: req.user_id,
                    amount: req.amount,
                    kind: req.kind,
                    request_id: req.request_id.clone(),
                    resulting_balance,
                    expected_version: account.version,
                };
                let entry = match self.ledger.append(draft) {
                    Ok(entry) => entry,
                    Err(e) => {
                        if matches!(e, StoreError::VersionConflict { .. })
                            && let Err(inv) = self.projector.invalidate(req.user_id)
                        {
                            warn!(
                                user = req.user_id,
                                error = %inv,
                                "failed to invalidate projection"
                            );
                        }
                        return Err(e.into());
                    }
                };

                // the entry is durable from here on; a stale projection is
                // caught by the version check of the next append
                if let Err(e) = self.projector.set(entry.account()) {
                    warn!(user = req.user_id, error = %e, "failed to update projection");
                }
                TransactionResult::from(&entry)
            }
        };

        let recorded = self
            .guard
            .record(req.user_id, req.request_id.clone(), outcome.clone());
        match recorded {
            // the ledger entry reseeds the guard on restart
            Err(e) if outcome.is_applied() => warn!(
                user = req.user_id,
                request = %req.request_id,
                error = %e,
                "failed to persist idempotency record"
            ),
            // nothing changed yet, so the caller may retry
            Err(e) => return Err(e.into()),
            Ok(()) => {}
        }
        Ok(outcome)
    }

    /// Returns the resulting balance, or why the request is rejected.
    fn validate(account: &Account, req: &TransactionRequest) -> Result<Amount, Rejection> {
        if !req.kind.accepts(req.amount) {
            return Err(Rejection::InvalidAmount {
                kind: req.kind,
                amount: req.amount,
            });
        }

        let resulting = account
            .balance
            .checked_add(req.amount)
            .ok_or(Rejection::BalanceOverflow)?;

        if req.kind == TxKind::Withdrawal && resulting.is_negative() {
            return Err(Rejection::InsufficientFunds {
                balance: account.balance,
                requested: req.amount,
            });
        }
        Ok(resulting)
    }
}
