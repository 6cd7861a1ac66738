use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::model::UserId;

type Slot = Arc<AsyncMutex<()>>;

/// One exclusive lock per user.
///
/// A user's slot exists only while someone holds or awaits its lock, so the
/// table does not grow with the number of users ever seen.
#[derive(Debug, Default)]
pub struct LockTable {
    slots: Mutex<HashMap<UserId, Slot>>,
}

/// Held lock of one user. Released on drop.
pub struct UserLock {
    user_id: UserId,
    table: Arc<LockTable>,
    // `None` only while dropping
    guard: Option<OwnedMutexGuard<()>>,
}

impl LockTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait up to `timeout` for the lock of `user_id`.
    ///
    /// Returns `None` when the wait timed out. Waiters are served in FIFO order.
    pub async fn acquire(self: &Arc<Self>, user_id: UserId, timeout: Duration) -> Option<UserLock> {
        let slot = self.slots().entry(user_id).or_default().clone();

        match tokio::time::timeout(timeout, slot.lock_owned()).await {
            Ok(guard) => Some(UserLock {
                user_id,
                table: self.clone(),
                guard: Some(guard),
            }),
            Err(_) => {
                // the dropped wait released its reference to the slot
                self.retire(user_id);
                None
            }
        }
    }

    /// Number of users with a live slot.
    pub fn active(&self) -> usize {
        self.slots().len()
    }

    /// Remove the slot once only the table references it.
    fn retire(&self, user_id: UserId) {
        let mut slots = self.slots();
        if slots
            .get(&user_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&user_id);
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<UserId, Slot>> {
        // the map stays consistent even if a holder panicked
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl UserLock {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}

impl Drop for UserLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.table.retire(self.user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn second_acquire_times_out_while_held() {
        let table = LockTable::new();
        let held = table.acquire(1, WAIT).await.unwrap();
        assert!(table.acquire(1, WAIT).await.is_none());
        drop(held);
        assert!(table.acquire(1, WAIT).await.is_some());
    }

    #[tokio::test]
    async fn distinct_users_do_not_contend() {
        let table = LockTable::new();
        let _one = table.acquire(1, WAIT).await.unwrap();
        let two = table.acquire(2, WAIT).await.unwrap();
        assert_eq!(two.user_id(), 2);
        assert_eq!(table.active(), 2);
    }

    #[tokio::test]
    async fn idle_slots_are_retired() {
        let table = LockTable::new();
        {
            let _lock = table.acquire(1, WAIT).await.unwrap();
            assert_eq!(table.active(), 1);
        }
        assert_eq!(table.active(), 0);

        let held = table.acquire(2, WAIT).await.unwrap();
        assert!(table.acquire(2, WAIT).await.is_none());
        assert_eq!(table.active(), 1);
        drop(held);
        assert_eq!(table.active(), 0);
    }

    #[tokio::test]
    async fn waiter_gets_lock_after_release() {
        let table = LockTable::new();
        let held = table.acquire(1, WAIT).await.unwrap();

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.acquire(1, Duration::from_secs(5)).await.is_some() })
        };
        tokio::task::yield_now().await;
        drop(held);

        assert!(waiter.await.unwrap());
        assert_eq!(table.active(), 0);
    }
}
