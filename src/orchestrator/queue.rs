//! Bounded priority queue for admission (C5.1): ordered first by descending
//! priority, then by ascending enqueue time (FIFO within a priority level).

use crate::protocol::Priority;
use crate::utils::error::{CoreError, Result};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Anything the orchestrator needs to carry through the queue; opaque to
/// the queue itself beyond its priority and arrival time.
pub struct QueuedTask<T> {
    priority: Priority,
    enqueued_at: Instant,
    sequence: u64,
    pub payload: T,
}

impl<T> QueuedTask<T> {
    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }
}

impl<T> PartialEq for QueuedTask<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
            && self.enqueued_at == other.enqueued_at
            && self.sequence == other.sequence
    }
}
impl<T> Eq for QueuedTask<T> {}

impl<T> PartialOrd for QueuedTask<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueuedTask<T> {
    /// Higher priority sorts greater (`BinaryHeap::pop` returns the
    /// greatest element first). Within a priority, the earlier-enqueued
    /// task must pop first, so time comparison is reversed.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

pub struct PriorityQueue<T> {
    heap: Mutex<BinaryHeap<QueuedTask<T>>>,
    max_size: usize,
    queue_timeout: Duration,
    sequence: AtomicU64,
    len_hint: AtomicUsize,
}

impl<T> PriorityQueue<T> {
    pub fn new(max_size: usize, queue_timeout: Duration) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            max_size,
            queue_timeout,
            sequence: AtomicU64::new(0),
            len_hint: AtomicUsize::new(0),
        }
    }

    /// Fails with `QueueFull` once the queue is at capacity.
    pub async fn enqueue(&self, priority: Priority, payload: T) -> Result<()> {
        let mut heap = self.heap.lock().await;
        if heap.len() >= self.max_size {
            return Err(CoreError::QueueFull);
        }
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        heap.push(QueuedTask {
            priority,
            enqueued_at: Instant::now(),
            sequence,
            payload,
        });
        self.len_hint.store(heap.len(), AtomicOrdering::Relaxed);
        Ok(())
    }

    /// Put a task back at the front of its priority band, preserving the
    /// original `enqueued_at` so a later `dispatch_pass` still expires it
    /// relative to when it first arrived. Used when the dispatch loop pops
    /// a task but finds no free concurrency slot to run it.
    pub async fn requeue(&self, priority: Priority, enqueued_at: Instant, payload: T) {
        let mut heap = self.heap.lock().await;
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        heap.push(QueuedTask {
            priority,
            enqueued_at,
            sequence,
            payload,
        });
        self.len_hint.store(heap.len(), AtomicOrdering::Relaxed);
    }

    /// Remove tasks that have waited past `queue_timeout` and return them
    /// (for `QUEUE_TIMEOUT` reporting), then pop and return the next
    /// dispatchable task, if any and if the queue isn't empty.
    pub async fn dispatch_pass(&self) -> (Vec<T>, Option<T>) {
        let mut heap = self.heap.lock().await;
        let now = Instant::now();

        let mut kept = BinaryHeap::with_capacity(heap.len());
        let mut expired = Vec::new();
        while let Some(task) = heap.pop() {
            if now.duration_since(task.enqueued_at) > self.queue_timeout {
                expired.push(task.payload);
            } else {
                kept.push(task);
            }
        }

        let next = kept.pop().map(|t| t.payload);
        *heap = kept;
        self.len_hint.store(heap.len(), AtomicOrdering::Relaxed);
        (expired, next)
    }

    /// Pop every task regardless of its expiry, for shutdown draining
    /// (spec.md §9). Leaves the queue empty.
    pub async fn drain_all(&self) -> Vec<T> {
        let mut heap = self.heap.lock().await;
        let drained = std::mem::take(&mut *heap).into_sorted_vec();
        self.len_hint.store(0, AtomicOrdering::Relaxed);
        drained.into_iter().map(|t| t.payload).collect()
    }

    /// Approximate length for observability; may be briefly stale relative
    /// to a concurrent enqueue/dispatch.
    pub fn len(&self) -> usize {
        self.len_hint.load(AtomicOrdering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatches_highest_priority_first() {
        let queue: PriorityQueue<&str> = PriorityQueue::new(10, Duration::from_secs(60));
        queue.enqueue(Priority::Background, "bg").await.unwrap();
        queue.enqueue(Priority::Interactive, "interactive").await.unwrap();
        queue.enqueue(Priority::OneShot, "oneshot").await.unwrap();

        let (_, next) = queue.dispatch_pass().await;
        assert_eq!(next, Some("interactive"));
    }

    #[tokio::test]
    async fn fifo_within_the_same_priority() {
        let queue: PriorityQueue<&str> = PriorityQueue::new(10, Duration::from_secs(60));
        queue.enqueue(Priority::OneShot, "first").await.unwrap();
        queue.enqueue(Priority::OneShot, "second").await.unwrap();

        let (_, next) = queue.dispatch_pass().await;
        assert_eq!(next, Some("first"));
    }

    #[tokio::test]
    async fn enqueue_fails_at_capacity() {
        let queue: PriorityQueue<&str> = PriorityQueue::new(1, Duration::from_secs(60));
        queue.enqueue(Priority::Background, "a").await.unwrap();
        let second = queue.enqueue(Priority::Background, "b").await;
        assert!(matches!(second, Err(CoreError::QueueFull)));
    }

    #[tokio::test]
    async fn dispatch_pass_expires_stale_tasks() {
        let queue: PriorityQueue<&str> = PriorityQueue::new(10, Duration::from_millis(10));
        queue.enqueue(Priority::Background, "stale").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (expired, next) = queue.dispatch_pass().await;
        assert_eq!(expired, vec!["stale"]);
        assert_eq!(next, None);
    }

    #[tokio::test]
    async fn len_reflects_pending_tasks() {
        let queue: PriorityQueue<&str> = PriorityQueue::new(10, Duration::from_secs(60));
        assert_eq!(queue.len(), 0);
        queue.enqueue(Priority::Background, "a").await.unwrap();
        assert_eq!(queue.len(), 1);
        queue.dispatch_pass().await;
        assert_eq!(queue.len(), 0);
    }
}
