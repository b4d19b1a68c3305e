// Pending wake-ups ordered by (deadline, spawn order)
//
// BinaryHeap with reversed Ord gives a min-heap. Cancellation never
// digs entries out of the heap; the kernel re-validates each entry
// against the owning task's state and suspension sequence when it
// surfaces, so removal costs nothing and expiry stays O(log n).

use alloc::collections::BinaryHeap;
use core::cmp::Ordering;

use crate::task::TaskId;
use crate::time::Instant;

#[derive(Debug)]
pub(crate) struct TimerEntry {
    pub(crate) at: Instant,
    /// Tie-break: tasks whose timers expire together wake in spawn order.
    pub(crate) spawn_seq: u64,
    /// Suspension sequence of the registration; stale entries fail the
    /// kernel's validity check and are discarded at pop.
    pub(crate) seq: u64,
    pub(crate) task: TaskId,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.spawn_seq == other.spawn_seq
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: earliest deadline (then earliest spawn) on top
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.spawn_seq.cmp(&self.spawn_seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub(crate) fn insert(&mut self, entry: TimerEntry) {
        self.heap.push(entry);
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
    }

    /// Pop the earliest entry that is due at `now` and still valid.
    /// Invalid due entries are discarded along the way.
    pub(crate) fn pop_due(
        &mut self,
        now: Instant,
        valid: impl Fn(&TimerEntry) -> bool,
    ) -> Option<TimerEntry> {
        while let Some(top) = self.heap.peek() {
            if top.at > now {
                return None;
            }
            let entry = self.heap.pop()?;
            if valid(&entry) {
                return Some(entry);
            }
        }
        None
    }

    /// Earliest valid deadline; prunes invalidated entries off the top.
    pub(crate) fn next_deadline(
        &mut self,
        valid: impl Fn(&TimerEntry) -> bool,
    ) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if valid(top) {
                return Some(top.at);
            }
            self.heap.pop();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(at: u64, spawn_seq: u64, seq: u64) -> TimerEntry {
        TimerEntry {
            at: Instant::from_ticks(at),
            spawn_seq,
            seq,
            task: TaskId {
                index: spawn_seq as u32,
                generation: 0,
            },
        }
    }

    #[test]
    fn pops_in_deadline_order() {
        let mut q = TimerQueue::new();
        q.insert(entry(30, 0, 0));
        q.insert(entry(10, 1, 0));
        q.insert(entry(20, 2, 0));

        let now = Instant::from_ticks(100);
        let order: std::vec::Vec<u64> = core::iter::from_fn(|| q.pop_due(now, |_| true))
            .map(|e| e.at.ticks())
            .collect();
        assert_eq!(order, [10, 20, 30]);
    }

    #[test]
    fn same_deadline_breaks_ties_by_spawn_order() {
        let mut q = TimerQueue::new();
        q.insert(entry(5, 7, 0));
        q.insert(entry(5, 2, 0));
        q.insert(entry(5, 4, 0));

        let now = Instant::from_ticks(5);
        let order: std::vec::Vec<u64> = core::iter::from_fn(|| q.pop_due(now, |_| true))
            .map(|e| e.spawn_seq)
            .collect();
        assert_eq!(order, [2, 4, 7]);
    }

    #[test]
    fn not_due_entries_stay_put() {
        let mut q = TimerQueue::new();
        q.insert(entry(50, 0, 0));
        assert!(q.pop_due(Instant::from_ticks(49), |_| true).is_none());
        assert_eq!(q.next_deadline(|_| true), Some(Instant::from_ticks(50)));
        assert!(q.pop_due(Instant::from_ticks(50), |_| true).is_some());
    }

    #[test]
    fn invalid_entries_are_discarded_lazily() {
        let mut q = TimerQueue::new();
        q.insert(entry(10, 0, 0));
        q.insert(entry(20, 1, 1));

        // seq 0 was superseded; only the seq-1 entry may surface
        let now = Instant::from_ticks(100);
        let e = q.pop_due(now, |e| e.seq == 1).unwrap();
        assert_eq!(e.seq, 1);
        assert!(q.pop_due(now, |_| true).is_none());
    }

    #[test]
    fn next_deadline_skips_stale_tops() {
        let mut q = TimerQueue::new();
        q.insert(entry(10, 0, 0));
        q.insert(entry(40, 1, 1));
        assert_eq!(
            q.next_deadline(|e| e.seq == 1),
            Some(Instant::from_ticks(40))
        );
        // the stale head was pruned while answering
        let e = q.pop_due(Instant::from_ticks(100), |_| true).unwrap();
        assert_eq!(e.seq, 1);
        assert!(q.pop_due(Instant::from_ticks(100), |_| true).is_none());
    }
}
