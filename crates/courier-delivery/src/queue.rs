//! Delayed work queue and per-pair locks.
//!
//! The queue is a min-heap keyed by due time. Workers pop only tasks whose
//! due time has passed and otherwise park on a `Notify` until either a new
//! task arrives or the earliest task falls due. `PairLocks` keeps two
//! workers from executing attempts for the same (webhook, event) pair at
//! once.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashSet},
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use courier_core::{DeliveryAttempt, DeliveryId, EventId, WebhookId};
use tokio::sync::Notify;

/// One queued attempt execution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeliveryTask {
    /// Attempt row to execute.
    pub attempt_id: DeliveryId,
    /// Target webhook.
    pub webhook_id: WebhookId,
    /// Event being delivered.
    pub event_id: EventId,
    /// Attempt number of the row.
    pub attempt_number: u32,
}

impl DeliveryTask {
    /// Task executing `attempt`.
    pub fn for_attempt(attempt: &DeliveryAttempt) -> Self {
        Self {
            attempt_id: attempt.id,
            webhook_id: attempt.webhook_id,
            event_id: attempt.event_id.clone(),
            attempt_number: attempt.attempt_number,
        }
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    due_at: DateTime<Utc>,
    seq: u64,
    task: DeliveryTask,
}

#[derive(Debug, Default)]
struct Heap {
    entries: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

/// Shared min-heap of delivery tasks ordered by due time, then insertion.
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    heap: Mutex<Heap>,
    notify: Notify,
}

impl DeliveryQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `task` to run at or after `due_at`.
    pub fn push(&self, task: DeliveryTask, due_at: DateTime<Utc>) {
        {
            let mut heap = self.lock();
            let seq = heap.next_seq;
            heap.next_seq += 1;
            heap.entries.push(Reverse(Entry { due_at, seq, task }));
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Removes and returns the earliest task due at `now`.
    pub fn pop_due(&self, now: DateTime<Utc>) -> Option<DeliveryTask> {
        let mut heap = self.lock();
        if heap.entries.peek().is_some_and(|Reverse(entry)| entry.due_at <= now) {
            heap.entries.pop().map(|Reverse(entry)| entry.task)
        } else {
            None
        }
    }

    /// Due time of the earliest task.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.lock().entries.peek().map(|Reverse(entry)| entry.due_at)
    }

    /// Number of queued tasks, due or not.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the queue holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves when a task is pushed.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Heap> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Advisory locks over (webhook, event) pairs.
#[derive(Debug, Clone, Default)]
pub struct PairLocks {
    held: Arc<Mutex<HashSet<(WebhookId, EventId)>>>,
}

impl PairLocks {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock for a pair, or returns `None` if another worker holds
    /// it. The lock is released when the guard drops.
    pub fn try_lock(&self, webhook_id: WebhookId, event_id: &EventId) -> Option<PairGuard> {
        let key = (webhook_id, event_id.clone());
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(key.clone()) {
            return None;
        }
        Some(PairGuard { held: Arc::clone(&self.held), key })
    }

    /// Number of pairs currently locked.
    pub fn held(&self) -> usize {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Releases its pair lock on drop.
#[derive(Debug)]
pub struct PairGuard {
    held: Arc<Mutex<HashSet<(WebhookId, EventId)>>>,
    key: (WebhookId, EventId),
}

impl Drop for PairGuard {
    fn drop(&mut self) {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn task(n: u32) -> DeliveryTask {
        DeliveryTask {
            attempt_id: DeliveryId::new(),
            webhook_id: WebhookId::new(),
            event_id: EventId::parse(format!("evt_{n}")).unwrap(),
            attempt_number: n,
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap()
    }

    #[test]
    fn pops_only_due_tasks_in_due_order() {
        let queue = DeliveryQueue::new();
        queue.push(task(3), at(30));
        queue.push(task(1), at(1));
        queue.push(task(2), at(5));

        assert_eq!(queue.next_due(), Some(at(1)));
        assert!(queue.pop_due(at(0)).is_none());
        assert_eq!(queue.pop_due(at(10)).unwrap().attempt_number, 1);
        assert_eq!(queue.pop_due(at(10)).unwrap().attempt_number, 2);
        assert!(queue.pop_due(at(10)).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn equal_due_times_keep_insertion_order() {
        let queue = DeliveryQueue::new();
        let first = task(1);
        let second = task(2);
        queue.push(first.clone(), at(1));
        queue.push(second.clone(), at(1));

        assert_eq!(queue.pop_due(at(1)), Some(first));
        assert_eq!(queue.pop_due(at(1)), Some(second));
        assert!(queue.is_empty());
    }

    #[test]
    fn pair_lock_is_exclusive_until_dropped() {
        let locks = PairLocks::new();
        let webhook_id = WebhookId::new();
        let event_id = EventId::parse("evt_1").unwrap();

        let guard = locks.try_lock(webhook_id, &event_id).unwrap();
        assert!(locks.try_lock(webhook_id, &event_id).is_none());
        assert!(locks.try_lock(WebhookId::new(), &event_id).is_some());

        drop(guard);
        assert!(locks.try_lock(webhook_id, &event_id).is_some());
        assert_eq!(locks.held(), 0);
    }

    #[tokio::test]
    async fn push_wakes_waiting_worker() {
        let queue = Arc::new(DeliveryQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.notified().await })
        };
        tokio::task::yield_now().await;

        queue.push(task(1), at(0));

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
