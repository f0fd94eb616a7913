use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

/// An item waiting for its deadline before entering a lane.
pub(crate) struct Delayed<T> {
    pub(crate) deadline: Instant,
    /// Insertion order; breaks deadline ties so equal deadlines stay FIFO.
    pub(crate) seq: u64,
    pub(crate) lane: usize,
    pub(crate) item: T,
}

impl<T> PartialEq for Delayed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<T> Eq for Delayed<T> {}

impl<T> PartialOrd for Delayed<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed: `BinaryHeap` is a max-heap and the earliest deadline must be on top.
impl<T> Ord for Delayed<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Deadline-ordered holding area.
pub(crate) struct DelayQueue<T> {
    heap: BinaryHeap<Delayed<T>>,
    next_seq: u64,
}

impl<T> DelayQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn push(&mut self, deadline: Instant, lane: usize, item: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Delayed {
            deadline,
            seq,
            lane,
            item,
        });
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|d| d.deadline)
    }

    /// Pop every item whose deadline is at or before `now`, earliest first.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Vec<Delayed<T>> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|d| d.deadline <= now) {
            if let Some(d) = self.heap.pop() {
                due.push(d);
            }
        }
        due
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn due_items_pop_in_deadline_then_insertion_order() {
        let now = Instant::now();
        let mut queue = DelayQueue::new();
        queue.push(now + Duration::from_millis(30), 0, "late");
        queue.push(now + Duration::from_millis(10), 0, "early-a");
        queue.push(now + Duration::from_millis(10), 0, "early-b");
        queue.push(now + Duration::from_secs(60), 0, "future");

        let due: Vec<&str> = queue
            .pop_due(now + Duration::from_millis(30))
            .into_iter()
            .map(|d| d.item)
            .collect();

        assert_eq!(due, vec!["early-a", "early-b", "late"]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(60)));
    }
}
