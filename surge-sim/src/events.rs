//! Scheduled continuations and their ordering.

use std::cmp::Ordering;
use std::fmt;

use crate::SimTime;

/// Continuation waiting in the event queue.
pub(crate) struct ScheduledTask {
    /// Sequence number; breaks ties between tasks due at the same time
    pub id: u64,
    /// Virtual time at which the task runs
    pub deadline: SimTime,
    pub callback: Box<dyn FnOnce()>,
}

impl ScheduledTask {
    pub fn new(id: u64, deadline: SimTime, callback: Box<dyn FnOnce()>) -> Self {
        Self {
            id,
            deadline,
            callback,
        }
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl Eq for ScheduledTask {}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earlier deadline first, then FIFO by sequence number.
        // Reversed for min-heap behavior in BinaryHeap.
        match self.deadline.cmp(&other.deadline) {
            Ordering::Equal => self.id.cmp(&other.id).reverse(),
            other => other.reverse(),
        }
    }
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BinaryHeap;
    use std::time::Duration;

    use super::*;

    fn task(id: u64, millis: u64) -> ScheduledTask {
        ScheduledTask::new(
            id,
            SimTime::from_duration(Duration::from_millis(millis)),
            Box::new(|| {}),
        )
    }

    #[test]
    fn test_earlier_deadline_pops_first() {
        let mut heap = BinaryHeap::new();
        heap.push(task(0, 500));
        heap.push(task(1, 100));
        heap.push(task(2, 300));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|t| t.id)).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_same_deadline_is_fifo() {
        let mut heap = BinaryHeap::new();
        for id in [3, 1, 2, 0] {
            heap.push(task(id, 10));
        }

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|t| t.id)).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }
}
