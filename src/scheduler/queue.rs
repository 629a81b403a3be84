use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::scheduler::job::Priority;

const DEFAULT_MAX_DEPTH: usize = 1_000;

/// A "ready to run" record. Lives only between enqueue and dequeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub job_id: String,
    seq: u64,
}

impl QueueEntry {
    pub fn sequence(&self) -> u64 {
        self.seq
    }
}

// BinaryHeap is a max-heap: "greater" means "dequeued sooner".
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| other.job_id.cmp(&self.job_id))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Bounded priority queue shared between the fire handler and the worker pool.
///
/// Ordering: priority descending, then enqueue time ascending, then job id.
/// `dequeue` suspends until an entry is available.
#[derive(Debug)]
pub struct DispatchQueue {
    heap: Mutex<BinaryHeap<QueueEntry>>,
    available: Notify,
    idle: Notify,
    unfinished: AtomicUsize,
    next_seq: AtomicU64,
    max_depth: usize,
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_DEPTH)
    }

    pub fn with_capacity(max_depth: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            available: Notify::new(),
            idle: Notify::new(),
            unfinished: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            max_depth,
        }
    }

    /// Push an entry. Returns false if the queue is at capacity.
    pub fn enqueue(&self, priority: Priority, now: DateTime<Utc>, job_id: &str) -> bool {
        {
            let mut heap = self.lock_heap();
            if heap.len() >= self.max_depth {
                return false;
            }
            heap.push(QueueEntry {
                priority,
                enqueued_at: now,
                job_id: job_id.to_string(),
                seq: self.next_seq.fetch_add(1, AtomicOrdering::Relaxed),
            });
            self.unfinished.fetch_add(1, AtomicOrdering::SeqCst);
        }
        self.available.notify_one();
        true
    }

    /// Pop the highest-ranked entry, waiting for one if the queue is empty.
    pub async fn dequeue(&self) -> QueueEntry {
        loop {
            let notified = self.available.notified();
            if let Some(entry) = self.try_dequeue() {
                return entry;
            }
            notified.await;
        }
    }

    pub fn try_dequeue(&self) -> Option<QueueEntry> {
        let mut heap = self.lock_heap();
        let entry = heap.pop();
        if entry.is_some() && !heap.is_empty() {
            // Another entry is waiting; make sure a second consumer wakes up.
            self.available.notify_one();
        }
        entry
    }

    /// Mark one dequeued entry as fully processed.
    pub fn task_done(&self) {
        let previous = self
            .unfinished
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .unwrap_or(0);
        if previous == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Wait until every enqueued entry has been dequeued and marked done.
    pub async fn join(&self) {
        loop {
            let idle = self.idle.notified();
            if self.unfinished.load(AtomicOrdering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Drop every queued entry for `job_id`. Returns how many were removed.
    pub fn remove_job(&self, job_id: &str) -> usize {
        let mut heap = self.lock_heap();
        let before = heap.len();
        heap.retain(|entry| entry.job_id != job_id);
        let removed = before - heap.len();
        drop(heap);
        for _ in 0..removed {
            self.task_done();
        }
        removed
    }

    /// Discard everything still queued. Entries are not persisted.
    pub fn clear(&self) -> usize {
        let drained: Vec<QueueEntry> = self.lock_heap().drain().collect();
        for _ in 0..drained.len() {
            self.task_done();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock_heap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_heap().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock_heap().len() >= self.max_depth
    }

    /// Entries dequeued but not yet marked done, plus those still queued.
    pub fn unfinished(&self) -> usize {
        self.unfinished.load(AtomicOrdering::SeqCst)
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.lock_heap().iter().any(|entry| entry.job_id == job_id)
    }

    fn lock_heap(&self) -> std::sync::MutexGuard<'_, BinaryHeap<QueueEntry>> {
        // A panic while holding this lock cannot leave the heap half-updated.
        self.heap.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn dequeues_by_priority_then_fifo() {
        let queue = DispatchQueue::new();
        let now = Utc::now();
        queue.enqueue(Priority::Normal, now, "n1");
        queue.enqueue(Priority::High, now, "h1");
        queue.enqueue(Priority::Normal, now, "n2");
        queue.enqueue(Priority::Critical, now, "c1");

        let order: Vec<String> = std::iter::from_fn(|| queue.try_dequeue())
            .map(|e| e.job_id)
            .collect();
        assert_eq!(order, vec!["c1", "h1", "n1", "n2"]);
    }

    #[test]
    fn earlier_enqueue_time_wins_within_priority() {
        let queue = DispatchQueue::new();
        let now = Utc::now();
        queue.enqueue(Priority::Low, now, "later");
        queue.enqueue(Priority::Low, now - chrono::Duration::seconds(5), "earlier");
        assert_eq!(queue.try_dequeue().unwrap().job_id, "earlier");
    }

    #[test]
    fn rejects_when_full() {
        let queue = DispatchQueue::with_capacity(2);
        let now = Utc::now();
        assert!(queue.enqueue(Priority::Low, now, "a"));
        assert!(queue.enqueue(Priority::Low, now, "b"));
        assert!(queue.is_full());
        assert!(!queue.enqueue(Priority::Critical, now, "c"));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn remove_job_drops_all_entries_for_job() {
        let queue = DispatchQueue::new();
        let now = Utc::now();
        queue.enqueue(Priority::Low, now, "a");
        queue.enqueue(Priority::High, now, "a");
        queue.enqueue(Priority::Low, now, "b");
        assert_eq!(queue.remove_job("a"), 2);
        assert!(!queue.contains("a"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.unfinished(), 1);
    }

    #[tokio::test]
    async fn dequeue_waits_for_enqueue() {
        let queue = Arc::new(DispatchQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        queue.enqueue(Priority::Normal, Utc::now(), "late");
        let entry = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.job_id, "late");
    }

    #[tokio::test]
    async fn join_returns_after_all_tasks_done() {
        let queue = Arc::new(DispatchQueue::new());
        let now = Utc::now();
        queue.enqueue(Priority::Normal, now, "a");
        queue.enqueue(Priority::Normal, now, "b");

        let joiner = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.join().await })
        };

        queue.try_dequeue().unwrap();
        queue.task_done();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!joiner.is_finished());

        queue.try_dequeue().unwrap();
        queue.task_done();
        tokio::time::timeout(Duration::from_secs(1), joiner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.unfinished(), 0);
    }

    #[test]
    fn clear_releases_unfinished_count() {
        let queue = DispatchQueue::new();
        queue.enqueue(Priority::Normal, Utc::now(), "a");
        queue.enqueue(Priority::Normal, Utc::now(), "b");
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.unfinished(), 0);
    }
}
