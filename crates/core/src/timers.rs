use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

/// Handle to one armed timer, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct Entry<T> {
    at: f64,
    seq: u64,
    payload: T,
}

// Min-heap on (at, seq): earliest first, ties in arming order.
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .total_cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

/// One-shot timers keyed on audio-clock time. Cancelled entries are dropped
/// lazily when they reach the front.
pub struct TimerQueue<T> {
    heap: BinaryHeap<Entry<T>>,
    armed: HashSet<u64>,
    next_seq: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            armed: HashSet::new(),
            next_seq: 0,
        }
    }

    pub fn schedule(&mut self, at: f64, payload: T) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { at, seq, payload });
        self.armed.insert(seq);
        TimerId(seq)
    }

    /// Returns whether the timer was still armed.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.armed.remove(&id.0)
    }

    /// Pop the earliest armed timer due at or before `now`.
    pub fn pop_due(&mut self, now: f64) -> Option<(TimerId, T)> {
        while let Some(entry) = self.heap.peek() {
            if !self.armed.contains(&entry.seq) {
                self.heap.pop();
                continue;
            }
            if entry.at > now {
                return None;
            }
            let entry = self.heap.pop()?;
            self.armed.remove(&entry.seq);
            return Some((TimerId(entry.seq), entry.payload));
        }
        None
    }

    /// Time of the earliest armed timer.
    pub fn next_due(&self) -> Option<f64> {
        self.heap
            .iter()
            .filter(|e| self.armed.contains(&e.seq))
            .map(|e| e.at)
            .min_by(f64::total_cmp)
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}
