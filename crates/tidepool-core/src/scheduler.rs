//! Virtual-time timer queue.
//!
//! Entries are ordered by deadline, then by insertion sequence. Two entries
//! due at the same instant therefore fire in the order they were scheduled,
//! never concurrently.
//!
//! # Invariants
//!
//! - Pop order is nondecreasing in deadline
//! - Ties on deadline pop in insertion (FIFO) order
//! - A cancelled entry is never popped

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashSet},
    fmt,
    time::Duration,
};

/// Identifier of a scheduled entry, unique within one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    /// Insertion sequence number of this entry.
    pub fn sequence(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

struct Entry<T> {
    deadline: Duration,
    seq: u64,
    payload: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: earliest deadline first, then lowest sequence
        other.deadline.cmp(&self.deadline).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A popped entry.
#[derive(Debug)]
pub struct Due<T> {
    /// Entry identifier.
    pub id: TimerId,
    /// Deadline the entry was scheduled for.
    pub deadline: Duration,
    /// Scheduled payload.
    pub payload: T,
}

/// Priority queue keyed by `(deadline, insertion sequence)`.
///
/// Cancellation is lazy: cancelled entries stay in the heap until they reach
/// the head, where they are discarded.
pub struct TimerQueue<T> {
    heap: BinaryHeap<Entry<T>>,
    live: HashSet<u64>,
    next_seq: u64,
}

impl<T> TimerQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new(), live: HashSet::new(), next_seq: 0 }
    }

    /// Schedule `payload` at `deadline`.
    pub fn insert(&mut self, deadline: Duration, payload: T) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(seq);
        self.heap.push(Entry { deadline, seq, payload });
        TimerId(seq)
    }

    /// Cancel a pending entry. Returns `false` if it already fired or was
    /// cancelled before.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.live.remove(&id.0)
    }

    /// Whether the entry is still pending.
    pub fn is_pending(&self, id: TimerId) -> bool {
        self.live.contains(&id.0)
    }

    /// Sequence number the next insertion will receive.
    ///
    /// Used as a watermark so that a dispatch batch never runs entries that
    /// were scheduled while the batch itself was running.
    pub fn watermark(&self) -> u64 {
        self.next_seq
    }

    /// Deadline of the earliest live entry.
    pub fn next_deadline(&mut self) -> Option<Duration> {
        self.purge_cancelled();
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pop the earliest live entry if it is due at `now` and was inserted
    /// before `watermark`.
    pub fn pop_due(&mut self, now: Duration, watermark: u64) -> Option<Due<T>> {
        self.purge_cancelled();
        let head = self.heap.peek()?;
        if head.deadline > now || head.seq >= watermark {
            return None;
        }

        let entry = self.heap.pop()?;
        self.live.remove(&entry.seq);
        Some(Due { id: TimerId(entry.seq), deadline: entry.deadline, payload: entry.payload })
    }

    /// Remove every entry, returning the payloads of the live ones.
    ///
    /// Payloads are handed back instead of dropped in place so the caller can
    /// drop them outside of any borrow it holds on the queue.
    pub fn drain(&mut self) -> Vec<T> {
        let live = std::mem::take(&mut self.live);
        let mut entries = std::mem::take(&mut self.heap).into_sorted_vec();
        // into_sorted_vec is ascending by Ord, which is reversed for the heap
        entries.reverse();
        entries.into_iter().filter(|e| live.contains(&e.seq)).map(|e| e.payload).collect()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether no live entries remain.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn purge_cancelled(&mut self) {
        while let Some(head) = self.heap.peek() {
            if self.live.contains(&head.seq) {
                break;
            }
            self.heap.pop();
        }
    }
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for TimerQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("live", &self.live.len())
            .field("next_seq", &self.next_seq)
            .finish_non_exhaustive()
    }
}
