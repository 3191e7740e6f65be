//! Stable min-heap priority queue for execution dispatch (spec §4.1).
//!
//! Ordered by `(priority, enqueue_sequence)`; the sequence tie-break
//! guarantees FIFO ordering among items of equal priority. Safe for
//! multiple producers and a single logical consumer — `pop` may be polled
//! from more than one task, but each popped item is delivered to exactly
//! one caller.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

#[derive(Debug, Clone, Eq, PartialEq)]
struct QueueItem {
    priority: i32,
    sequence: u64,
    execution_id: Uuid,
}

// `BinaryHeap` is a max-heap; invert the comparison so the lowest priority
// integer (most urgent, per spec §3) and lowest sequence sort to the top.
impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    heap: Mutex<BinaryHeap<QueueItem>>,
    notify: Notify,
    shutdown: AtomicBool,
}

/// Shared handle to the scheduler's dispatch queue.
#[derive(Clone)]
pub struct ExecutionQueue {
    inner: Arc<Inner>,
}

impl Default for ExecutionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                heap: Mutex::new(BinaryHeap::new()),
                notify: Notify::new(),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue an execution id at the given priority (1..=5, lower is more
    /// urgent) with a fresh sequence number for FIFO tie-breaking.
    pub async fn push(&self, priority: i32, sequence: u64, execution_id: Uuid) {
        let mut heap = self.inner.heap.lock().await;
        heap.push(QueueItem {
            priority,
            sequence,
            execution_id,
        });
        drop(heap);
        self.inner.notify.notify_one();
    }

    /// Block until an item is available or the queue is shut down.
    ///
    /// Returns `None` only once shutdown has been signalled and the queue
    /// has drained.
    pub async fn pop(&self) -> Option<(i32, u64, Uuid)> {
        loop {
            {
                let mut heap = self.inner.heap.lock().await;
                if let Some(item) = heap.pop() {
                    return Some((item.priority, item.sequence, item.execution_id));
                }
                if self.inner.shutdown.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn len_blocking(&self) -> usize {
        self.inner.heap.blocking_lock().len()
    }

    /// Wake every blocked `pop` and make subsequent empty pops return `None`.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }
}
