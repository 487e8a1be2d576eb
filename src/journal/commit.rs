//! Commit queue: assigns monotonic tx_ids and hands off sealed containers
//! to the apply worker.

use super::JournalContainer;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

#[derive(Default)]
struct Inner {
    queue: VecDeque<JournalContainer>,
}

pub struct CommitQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
    next_tx_id: AtomicU64,
}

impl Default for CommitQueue {
    fn default() -> Self {
        Self { inner: Mutex::new(Inner::default()), cond: Condvar::new(), next_tx_id: AtomicU64::new(1) }
    }
}

impl CommitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns `container` a fresh tx_id, appends it to the FIFO, and
    /// wakes the apply worker. Returns the assigned tx_id.
    pub fn commit(&self, mut container: JournalContainer) -> u64 {
        let tx_id = self.next_tx_id.fetch_add(1, Ordering::SeqCst);
        container.tx_id = tx_id;
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(container);
        self.cond.notify_all();
        tx_id
    }

    /// Blocks until a container is available, then pops and returns it.
    pub fn wait_pop(&self) -> JournalContainer {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(c) = inner.queue.pop_front() {
                return c;
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Non-blocking pop, used by the apply worker's shutdown drain.
    pub fn try_pop(&self) -> Option<JournalContainer> {
        self.inner.lock().unwrap().queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_assigns_monotonic_tx_ids() {
        let q = CommitQueue::new();
        let a = q.commit(JournalContainer::default());
        let b = q.commit(JournalContainer::default());
        assert!(b > a);
    }

    #[test]
    fn wait_pop_returns_in_fifo_order() {
        let q = CommitQueue::new();
        let a = q.commit(JournalContainer::default());
        let b = q.commit(JournalContainer::default());
        assert_eq!(q.wait_pop().tx_id, a);
        assert_eq!(q.wait_pop().tx_id, b);
    }
}
