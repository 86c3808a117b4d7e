//! The key by which the priority queue orders task sources.
use std::time::Instant;

use crate::task_traits::TaskPriority;

/// Scheduling precedence of a task source.  A greater key is scheduled sooner.
///
/// Ordering is lexicographic on (priority descending, workers currently running the source
/// ascending, earliest-ready-time ascending): urgent work first, then sources with the fewest
/// workers already on them, then oldest work first for fairness.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct TaskSourceSortKey {
    priority: TaskPriority,
    worker_count: u8,
    ready_time: Instant,
}

impl TaskSourceSortKey {
    pub(crate) fn new(
        priority: TaskPriority,
        worker_count: u8,
        ready_time: Instant,
    ) -> TaskSourceSortKey {
        TaskSourceSortKey {
            priority,
            worker_count,
            ready_time,
        }
    }

    pub(crate) fn priority(&self) -> TaskPriority {
        self.priority
    }

    pub(crate) fn worker_count(&self) -> u8 {
        self.worker_count
    }
}

impl Ord for TaskSourceSortKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.worker_count.cmp(&self.worker_count))
            .then_with(|| other.ready_time.cmp(&self.ready_time))
    }
}

impl PartialOrd for TaskSourceSortKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
