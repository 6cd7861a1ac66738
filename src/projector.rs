//! Balance projector: a cache of each user's balance and version.
//!
//! The cache is never the authority. Every value can be re-derived from the
//! ledger, and [`BalanceProjector::rebuild`] does exactly that.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::Amount;
use crate::ledger::{LedgerStore, StoreError, read_history};
use crate::model::{Account, UserId};

pub struct BalanceProjector {
    store: Arc<dyn LedgerStore>,
    cache: RwLock<HashMap<UserId, Account>>,
    page_size: usize,
}

impl BalanceProjector {
    pub fn new(store: Arc<dyn LedgerStore>, page_size: usize) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            page_size,
        }
    }

    /// Cached balance, loaded from the ledger on a miss.
    pub fn get(&self, user_id: UserId) -> Result<Amount, StoreError> {
        Ok(self.account(user_id)?.balance)
    }

    /// Cached account, loaded from the ledger on a miss.
    pub fn account(&self, user_id: UserId) -> Result<Account, StoreError> {
        {
            let cache = self.cache.read().map_err(|_| StoreError::poisoned())?;
            if let Some(account) = cache.get(&user_id) {
                return Ok(*account);
            }
        }

        let account = self.store.read_account(user_id)?;
        let mut cache = self.cache.write().map_err(|_| StoreError::poisoned())?;
        Ok(*cache.entry(user_id).or_insert(account))
    }

    /// Add `amount` to the cached balance and return the new balance.
    ///
    /// The caller must hold the user's lock. No overdraft checks happen here.
    pub fn apply(&self, user_id: UserId, amount: Amount) -> Result<Amount, StoreError> {
        let current = self.account(user_id)?;
        let balance = current
            .balance
            .checked_add(amount)
            .ok_or(StoreError::Overflow { user: user_id })?;
        self.set(Account {
            user_id,
            balance,
            version: current.version + 1,
        })?;
        Ok(balance)
    }

    /// Install a snapshot taken from a committed ledger entry.
    pub fn set(&self, account: Account) -> Result<(), StoreError> {
        let mut cache = self.cache.write().map_err(|_| StoreError::poisoned())?;
        cache.insert(account.user_id, account);
        Ok(())
    }

    pub fn invalidate(&self, user_id: UserId) -> Result<(), StoreError> {
        let mut cache = self.cache.write().map_err(|_| StoreError::poisoned())?;
        cache.remove(&user_id);
        Ok(())
    }

    /// Re-derive the account by folding the user's full history.
    ///
    /// Fails with [`StoreError::Inconsistent`] if any entry's
    /// `resulting_balance` disagrees with the running sum.
    pub fn rebuild(&self, user_id: UserId) -> Result<Account, StoreError> {
        let mut account = Account::empty(user_id);
        for entry in read_history(self.store.clone(), user_id, None, None, self.page_size) {
            let entry = entry?;
            let expected = account
                .balance
                .checked_add(entry.amount)
                .ok_or(StoreError::Overflow { user: user_id })?;
            if expected != entry.resulting_balance {
                warn!(
                    user = user_id,
                    entry = entry.entry_id,
                    expected = %expected,
                    found = %entry.resulting_balance,
                    "ledger balance chain broken"
                );
                return Err(StoreError::Inconsistent {
                    entry_id: entry.entry_id,
                    expected,
                    found: entry.resulting_balance,
                });
            }
            account = Account {
                user_id,
                balance: expected,
                version: account.version + 1,
            };
        }
        self.set(account)?;
        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::model::{EntryDraft, RequestId, TxKind};

    fn store_with(amounts: &[i64]) -> Arc<dyn LedgerStore> {
        let ledger = MemoryLedger::new();
        let mut balance = Amount::ZERO;
        for (version, &amount) in amounts.iter().enumerate() {
            balance += Amount::from_minor(amount);
            ledger
                .append(EntryDraft {
                    user_id: 1,
                    amount: Amount::from_minor(amount),
                    kind: TxKind::Adjustment,
                    request_id: RequestId::new(format!("r{version}")),
                    resulting_balance: balance,
                    expected_version: version as u64,
                })
                .unwrap();
        }
        Arc::new(ledger)
    }

    #[test]
    fn get_falls_back_to_ledger() {
        let projector = BalanceProjector::new(store_with(&[500, -200]), 16);
        assert_eq!(projector.get(1).unwrap(), Amount::from_minor(300));
        assert_eq!(projector.account(1).unwrap().version, 2);
        assert_eq!(projector.get(2).unwrap(), Amount::ZERO);
    }

    #[test]
    fn apply_updates_cache_only() {
        let store = store_with(&[500]);
        let projector = BalanceProjector::new(store.clone(), 16);
        assert_eq!(projector.apply(1, Amount::from_minor(-100)).unwrap(), Amount::from_minor(400));
        assert_eq!(projector.get(1).unwrap(), Amount::from_minor(400));
        assert_eq!(projector.account(1).unwrap().version, 2);

        // the ledger is untouched; a rebuild restores the authoritative value
        assert_eq!(store.read_balance(1).unwrap(), Amount::from_minor(500));
        let rebuilt = projector.rebuild(1).unwrap();
        assert_eq!(rebuilt.balance, Amount::from_minor(500));
        assert_eq!(projector.get(1).unwrap(), Amount::from_minor(500));
    }

    #[test]
    fn apply_out_of_range_leaves_cache_untouched() {
        let projector = BalanceProjector::new(store_with(&[i64::MAX]), 16);
        assert!(matches!(
            projector.apply(1, Amount::from_minor(1)),
            Err(StoreError::Overflow { user: 1 })
        ));
        assert_eq!(projector.account(1).unwrap().version, 1);
        assert_eq!(projector.get(1).unwrap(), Amount::from_minor(i64::MAX));
    }

    #[test]
    fn invalidate_reloads_from_ledger() {
        let projector = BalanceProjector::new(store_with(&[500]), 16);
        projector
            .set(Account {
                user_id: 1,
                balance: Amount::from_minor(1),
                version: 9,
            })
            .unwrap();
        projector.invalidate(1).unwrap();
        assert_eq!(projector.get(1).unwrap(), Amount::from_minor(500));
    }

    #[test]
    fn rebuild_folds_many_pages() {
        let amounts: Vec<i64> = (1..=50).collect();
        let projector = BalanceProjector::new(store_with(&amounts), 4);
        let account = projector.rebuild(1).unwrap();
        assert_eq!(account.balance, Amount::from_minor(1275));
        assert_eq!(account.version, 50);
    }
}
