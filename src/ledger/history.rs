use std::collections::VecDeque;
use std::sync::Arc;

use super::{LedgerStore, StoreError};
use crate::model::{EntryId, LedgerEntry, UserId};

/// Lazy, paged iterator over one user's ledger entries in `entry_id` order.
///
/// Pages are fetched from the store on demand, so entries appended while
/// iterating may show up. The iterator is finite; it can be restarted from
/// [`History::resume_after`] with a new call to [`read_history`].
pub struct History {
    store: Arc<dyn LedgerStore>,
    user_id: UserId,
    after: Option<EntryId>,
    remaining: Option<usize>,
    page_size: usize,
    page: VecDeque<LedgerEntry>,
    done: bool,
}

/// Read the history of `user_id`, starting after `since` (exclusive) and
/// yielding at most `limit` entries.
pub fn read_history(
    store: Arc<dyn LedgerStore>,
    user_id: UserId,
    since: Option<EntryId>,
    limit: Option<usize>,
    page_size: usize,
) -> History {
    History {
        store,
        user_id,
        after: since,
        remaining: limit,
        page_size: page_size.max(1),
        page: VecDeque::new(),
        done: false,
    }
}

impl History {
    /// Id of the last entry yielded (or the starting point if none was).
    pub fn resume_after(&self) -> Option<EntryId> {
        self.after
    }

    fn fill(&mut self) -> Result<(), StoreError> {
        let want = match self.remaining {
            Some(remaining) => remaining.min(self.page_size),
            None => self.page_size,
        };
        let page = self.store.read_page(self.user_id, self.after, want)?;
        if page.len() < want {
            self.done = true;
        }
        self.page.extend(page);
        Ok(())
    }
}

impl Iterator for History {
    type Item = Result<LedgerEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == Some(0) {
            return None;
        }
        if self.page.is_empty() {
            if self.done {
                return None;
            }
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }

        let entry = self.page.pop_front()?;
        self.after = Some(entry.entry_id);
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(Ok(entry))
    }
}
