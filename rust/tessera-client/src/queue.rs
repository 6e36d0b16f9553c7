//! Per-connection send queue.
//!
//! A priority queue of handles waiting to be sent, ordered by
//! (priority ascending, sequence ascending): lower priority number wins,
//! ties break FIFO by the global admission sequence. The request contexts
//! themselves live in the registry; the queue only carries handles, so a
//! request that times out while queued is simply skipped by the worker.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueuedEntry {
    pub priority: u8,
    pub sequence: u64,
    pub handle: i64,
}

// BinaryHeap is a max-heap; invert so the smallest (priority, sequence)
// pair is popped first.
impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.sequence).cmp(&(self.priority, self.sequence))
    }
}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub(crate) struct SendQueue {
    heap: Mutex<BinaryHeap<QueuedEntry>>,
    notify: Notify,
}

impl SendQueue {
    pub(crate) fn push(&self, entry: QueuedEntry) {
        self.heap.lock().unwrap().push(entry);
        self.notify.notify_one();
    }

    pub(crate) fn try_pop(&self) -> Option<QueuedEntry> {
        self.heap.lock().unwrap().pop()
    }

    /// Wait until an entry may be available. Callers loop:
    /// `try_pop`, and if empty, `wait().await` before retrying.
    pub(crate) async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Wake all waiters without queueing anything; used at teardown so
    /// the send worker observes the disconnect.
    pub(crate) fn wake_all(&self) {
        self.notify.notify_waiters();
        // A worker between try_pop and notified() would miss notify_waiters;
        // the stored permit from notify_one covers that window.
        self.notify.notify_one();
    }

    pub(crate) fn clear(&self) {
        self.heap.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(priority: u8, sequence: u64) -> QueuedEntry {
        QueuedEntry {
            priority,
            sequence,
            handle: sequence as i64,
        }
    }

    #[test]
    fn lower_priority_number_wins() {
        let q = SendQueue::default();
        q.push(entry(5, 1));
        q.push(entry(1, 2));
        q.push(entry(8, 3));
        assert_eq!(q.try_pop().unwrap().priority, 1);
        assert_eq!(q.try_pop().unwrap().priority, 5);
        assert_eq!(q.try_pop().unwrap().priority, 8);
    }

    #[test]
    fn equal_priority_is_fifo_by_sequence() {
        let q = SendQueue::default();
        for seq in [10u64, 11, 12, 13] {
            q.push(entry(4, seq));
        }
        let order: Vec<u64> = std::iter::from_fn(|| q.try_pop()).map(|e| e.sequence).collect();
        assert_eq!(order, vec![10, 11, 12, 13]);
    }

    #[tokio::test]
    async fn wait_wakes_on_push() {
        let q = std::sync::Arc::new(SendQueue::default());
        let q2 = q.clone();
        let waiter = tokio::spawn(async move {
            loop {
                if let Some(e) = q2.try_pop() {
                    return e.handle;
                }
                q2.wait().await;
            }
        });
        tokio::task::yield_now().await;
        q.push(entry(3, 42));
        let handle = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle, 42);
    }
}
