//! Cooperative alarm queue.
//!
//! A deadline-ordered heap of scheduled work tokens. The event loop asks for
//! the next deadline, sleeps until it, and drains everything due. Alarms fire
//! in strictly increasing due-time order with ties broken by registration
//! order; cancellation is O(log n) amortized and idempotent (cancelled
//! entries are tombstoned and skipped on pop).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

/// Handle to a scheduled alarm, used for cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AlarmId(u64);

struct Entry<T> {
    deadline: Instant,
    seq: u64,
    id: AlarmId,
    action: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline pops
        // first, with the lower sequence number winning ties.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Deadline-ordered queue of pending work tokens.
pub struct AlarmQueue<T> {
    heap: BinaryHeap<Entry<T>>,
    /// Ids scheduled and neither fired nor cancelled yet.
    live: HashSet<AlarmId>,
    /// Cancelled ids still sitting in the heap as tombstones.
    cancelled: HashSet<AlarmId>,
    next_seq: u64,
}

impl<T> Default for AlarmQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AlarmQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashSet::new(),
            cancelled: HashSet::new(),
            next_seq: 0,
        }
    }

    /// Schedules `action` to fire `delay` after `now`.
    pub fn register(&mut self, now: Instant, delay: Duration, action: T) -> AlarmId {
        let seq = self.next_seq;
        self.next_seq += 1;
        let id = AlarmId(seq);
        self.live.insert(id);
        self.heap.push(Entry {
            deadline: now + delay,
            seq,
            id,
            action,
        });
        id
    }

    /// Cancels a scheduled alarm. Safe to call more than once, and safe to
    /// call after the alarm has already fired.
    pub fn unregister(&mut self, id: AlarmId) {
        if self.live.remove(&id) {
            self.cancelled.insert(id);
        }
    }

    /// Deadline of the earliest live alarm, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_cancelled();
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pops every alarm due at or before `now`, in firing order.
    pub fn fire_due(&mut self, now: Instant) -> Vec<T> {
        let mut fired = Vec::new();
        loop {
            self.discard_cancelled();
            match self.heap.peek() {
                Some(entry) if entry.deadline <= now => {
                    let entry = self.heap.pop().expect("peeked entry present");
                    self.live.remove(&entry.id);
                    fired.push(entry.action);
                }
                _ => break,
            }
        }
        fired
    }

    /// Number of live (non-cancelled) alarms.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// True if no live alarms remain.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn discard_cancelled(&mut self) {
        while let Some(entry) = self.heap.peek() {
            if self.cancelled.contains(&entry.id) {
                let entry = self.heap.pop().expect("peeked entry present");
                self.cancelled.remove(&entry.id);
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_in_deadline_order() {
        let now = Instant::now();
        let mut queue = AlarmQueue::new();
        queue.register(now, Duration::from_secs(3), "c");
        queue.register(now, Duration::from_secs(1), "a");
        queue.register(now, Duration::from_secs(2), "b");

        let fired = queue.fire_due(now + Duration::from_secs(5));
        assert_eq!(fired, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_ties_break_by_registration_order() {
        let now = Instant::now();
        let mut queue = AlarmQueue::new();
        queue.register(now, Duration::from_secs(1), 1);
        queue.register(now, Duration::from_secs(1), 2);
        queue.register(now, Duration::from_secs(1), 3);

        assert_eq!(queue.fire_due(now + Duration::from_secs(1)), vec![1, 2, 3]);
    }

    #[test]
    fn test_only_due_alarms_fire() {
        let now = Instant::now();
        let mut queue = AlarmQueue::new();
        queue.register(now, Duration::from_secs(1), "due");
        queue.register(now, Duration::from_secs(10), "later");

        assert_eq!(queue.fire_due(now + Duration::from_secs(2)), vec!["due"]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let now = Instant::now();
        let mut queue = AlarmQueue::new();
        let id = queue.register(now, Duration::from_secs(1), "x");
        queue.unregister(id);
        queue.unregister(id);

        assert!(queue.fire_due(now + Duration::from_secs(2)).is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancel_after_fire_is_harmless() {
        let now = Instant::now();
        let mut queue = AlarmQueue::new();
        let id = queue.register(now, Duration::from_secs(1), "x");
        assert_eq!(queue.fire_due(now + Duration::from_secs(2)), vec!["x"]);
        queue.unregister(id);
        queue.register(now, Duration::from_secs(1), "y");
        assert_eq!(queue.fire_due(now + Duration::from_secs(2)), vec!["y"]);
    }

    #[test]
    fn test_next_deadline_skips_cancelled() {
        let now = Instant::now();
        let mut queue = AlarmQueue::new();
        let early = queue.register(now, Duration::from_secs(1), "early");
        queue.register(now, Duration::from_secs(5), "late");
        queue.unregister(early);

        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(5)));
    }
}
