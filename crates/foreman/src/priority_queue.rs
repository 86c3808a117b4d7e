//! A priority queue of task sources.
//!
//! Not thread-safe: always used under the owning thread group's (or single-thread worker's) lock.
//! Implemented as a binary max-heap over a `Vec`, with each source's current heap index written
//! back into the source so that removal and re-keying from an arbitrary position stay `O(log n)`.
use crate::sort_key::TaskSourceSortKey;
use crate::task_source::{RegisteredTaskSource, TaskSource, INVALID_HEAP_INDEX};
use crate::task_traits::TaskPriority;

struct HeapEntry {
    key: TaskSourceSortKey,
    source: RegisteredTaskSource,
}

#[derive(Default)]
pub(crate) struct PriorityQueue {
    heap: Vec<HeapEntry>,
    num_task_sources_per_priority: [usize; TaskPriority::COUNT],
    is_flush_task_sources_on_destroy_enabled: bool,
}

impl PriorityQueue {
    pub(crate) fn new() -> PriorityQueue {
        PriorityQueue::default()
    }

    pub(crate) fn push(&mut self, source: RegisteredTaskSource, key: TaskSourceSortKey) {
        debug_assert!(
            source.source().heap_index() == INVALID_HEAP_INDEX,
            "a task source can be in at most one priority queue"
        );
        self.num_task_sources_per_priority[key.priority().index()] += 1;
        let index = self.heap.len();
        self.heap.push(HeapEntry { key, source });
        self.set_index(index, index);
        self.sift_up(index);
    }

    pub(crate) fn peek_sort_key(&self) -> Option<TaskSourceSortKey> {
        self.heap.first().map(|entry| entry.key)
    }

    pub(crate) fn peek_task_source(&self) -> Option<&RegisteredTaskSource> {
        self.heap.first().map(|entry| &entry.source)
    }

    pub(crate) fn pop_task_source(&mut self) -> Option<RegisteredTaskSource> {
        self.pop_entry().map(|(source, _key)| source)
    }

    pub(crate) fn pop_entry(&mut self) -> Option<(RegisteredTaskSource, TaskSourceSortKey)> {
        if self.heap.is_empty() {
            return None;
        }
        let entry = self.remove_at(0);
        Some((entry.source, entry.key))
    }

    /// Removes `source` wherever it sits in the queue.  Returns the registration token, or `None`
    /// if the source is not currently queued here (e.g. a worker is running it).
    pub(crate) fn remove_task_source(
        &mut self,
        source: &dyn TaskSource,
    ) -> Option<RegisteredTaskSource> {
        let index = self.index_of(source)?;
        Some(self.remove_at(index).source)
    }

    /// Re-keys `source` and restores the heap property.  Returns false (and does nothing) if the
    /// source is not queued here.
    pub(crate) fn update_sort_key(&mut self, source: &dyn TaskSource, key: TaskSourceSortKey) -> bool {
        let Some(index) = self.index_of(source) else {
            return false;
        };
        let old_key = self.heap[index].key;
        self.num_task_sources_per_priority[old_key.priority().index()] -= 1;
        self.num_task_sources_per_priority[key.priority().index()] += 1;
        self.heap[index].key = key;
        if key > old_key {
            self.sift_up(index);
        } else {
            self.sift_down(index);
        }
        true
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn num_task_sources_with_priority(&self, priority: TaskPriority) -> usize {
        self.num_task_sources_per_priority[priority.index()]
    }

    /// Makes destruction drop all queued tasks instead of asserting emptiness.  Test teardown
    /// needs this because of the TaskSource → Task → TaskRunner → TaskSource reference cycle.
    pub(crate) fn enable_flush_task_sources_on_destroy_for_testing(&mut self) {
        self.is_flush_task_sources_on_destroy_enabled = true;
    }

    fn index_of(&self, source: &dyn TaskSource) -> Option<usize> {
        let index = source.heap_index();
        if index == INVALID_HEAP_INDEX || index >= self.heap.len() {
            return None;
        }
        // The handle is only trustworthy if it points back at this exact source; a source queued
        // in a different group's queue has a valid handle for that queue, not this one.
        let at_index: *const () =
            self.heap[index].source.source().as_ref() as *const dyn TaskSource as *const ();
        if std::ptr::eq(at_index, source as *const dyn TaskSource as *const ()) {
            Some(index)
        } else {
            None
        }
    }

    fn remove_at(&mut self, index: usize) -> HeapEntry {
        let entry = self.heap.swap_remove(index);
        entry.source.source().set_heap_index(INVALID_HEAP_INDEX);
        self.num_task_sources_per_priority[entry.key.priority().index()] -= 1;
        if index < self.heap.len() {
            self.set_index(index, index);
            self.sift_down(index);
            self.sift_up(index);
        }
        entry
    }

    fn set_index(&mut self, heap_position: usize, index: usize) {
        self.heap[heap_position].source.source().set_heap_index(index);
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.heap[index].key <= self.heap[parent].key {
                break;
            }
            self.heap.swap(index, parent);
            self.set_index(index, index);
            self.set_index(parent, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        loop {
            let left = 2 * index + 1;
            let right = 2 * index + 2;
            let mut largest = index;
            if left < self.heap.len() && self.heap[left].key > self.heap[largest].key {
                largest = left;
            }
            if right < self.heap.len() && self.heap[right].key > self.heap[largest].key {
                largest = right;
            }
            if largest == index {
                break;
            }
            self.heap.swap(index, largest);
            self.set_index(index, index);
            self.set_index(largest, largest);
            index = largest;
        }
    }
}

impl Drop for PriorityQueue {
    fn drop(&mut self) {
        if self.heap.is_empty() {
            return;
        }
        debug_assert!(
            self.is_flush_task_sources_on_destroy_enabled,
            "priority queue destroyed while non-empty"
        );
        for entry in &self.heap {
            entry.source.source().set_heap_index(INVALID_HEAP_INDEX);
            entry.source.source().clear();
        }
        // The RegisteredTaskSource drops unregister each source with the tracker.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::Sequence;
    use crate::task::Task;
    use crate::task_source::TaskSourceExecutionMode;
    use crate::task_traits::TaskTraits;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn sequence_with_priority(priority: TaskPriority) -> Arc<Sequence> {
        let sequence = Sequence::new(
            TaskTraits::new().with_priority(priority),
            TaskSourceExecutionMode::Sequenced,
        );
        {
            let mut transaction = sequence.begin_transaction();
            transaction.will_push_immediate_task();
            transaction.push_immediate_task(Task::new(|| {}), None);
        }
        sequence
    }

    fn registered(sequence: &Arc<Sequence>) -> RegisteredTaskSource {
        RegisteredTaskSource::create_for_testing(sequence.clone())
    }

    #[test]
    fn pops_in_priority_order() {
        let mut queue = PriorityQueue::new();
        queue.enable_flush_task_sources_on_destroy_for_testing();

        for priority in [
            TaskPriority::BestEffort,
            TaskPriority::UserBlocking,
            TaskPriority::UserVisible,
        ] {
            let sequence = sequence_with_priority(priority);
            let key = sequence.sort_key();
            queue.push(registered(&sequence), key);
        }

        assert_eq!(
            queue.peek_sort_key().unwrap().priority(),
            TaskPriority::UserBlocking
        );
        let order: Vec<TaskPriority> = std::iter::from_fn(|| {
            queue
                .pop_entry()
                .map(|(source, key)| {
                    source.source().clear();
                    key.priority()
                })
        })
        .collect();
        assert_eq!(
            order,
            vec![
                TaskPriority::UserBlocking,
                TaskPriority::UserVisible,
                TaskPriority::BestEffort
            ]
        );
    }

    #[test]
    fn per_priority_counts_track_contents() {
        let mut queue = PriorityQueue::new();
        queue.enable_flush_task_sources_on_destroy_for_testing();

        let best_effort = sequence_with_priority(TaskPriority::BestEffort);
        let user_blocking = sequence_with_priority(TaskPriority::UserBlocking);
        queue.push(registered(&best_effort), best_effort.sort_key());
        queue.push(registered(&user_blocking), user_blocking.sort_key());

        assert_eq!(queue.num_task_sources_with_priority(TaskPriority::BestEffort), 1);
        assert_eq!(queue.num_task_sources_with_priority(TaskPriority::UserBlocking), 1);
        assert_eq!(queue.num_task_sources_with_priority(TaskPriority::UserVisible), 0);

        let popped = queue.pop_task_source().unwrap();
        popped.source().clear();
        assert_eq!(queue.num_task_sources_with_priority(TaskPriority::UserBlocking), 0);
    }

    #[test]
    fn remove_from_middle_keeps_heap_consistent() {
        let mut queue = PriorityQueue::new();
        queue.enable_flush_task_sources_on_destroy_for_testing();

        let sequences: Vec<_> = [
            TaskPriority::UserBlocking,
            TaskPriority::BestEffort,
            TaskPriority::UserVisible,
            TaskPriority::UserVisible,
        ]
        .into_iter()
        .map(sequence_with_priority)
        .collect();
        for sequence in &sequences {
            queue.push(registered(sequence), sequence.sort_key());
        }

        let removed = queue
            .remove_task_source(sequences[2].as_ref())
            .expect("queued source should be removable");
        removed.source().clear();
        assert_eq!(queue.len(), 3);
        assert!(queue.remove_task_source(sequences[2].as_ref()).is_none());

        // Remaining sources still pop in priority order.
        let first = queue.pop_task_source().unwrap();
        assert_eq!(first.source().priority_racy(), TaskPriority::UserBlocking);
        first.source().clear();
    }

    #[test]
    fn update_sort_key_reorders() {
        let mut queue = PriorityQueue::new();
        queue.enable_flush_task_sources_on_destroy_for_testing();

        let background = sequence_with_priority(TaskPriority::BestEffort);
        let foreground = sequence_with_priority(TaskPriority::UserVisible);
        queue.push(registered(&background), background.sort_key());
        queue.push(registered(&foreground), foreground.sort_key());

        background.update_priority(TaskPriority::UserBlocking);
        queue.update_sort_key(background.as_ref(), background.sort_key());

        assert_eq!(
            queue.peek_sort_key().unwrap().priority(),
            TaskPriority::UserBlocking
        );
        assert_eq!(queue.num_task_sources_with_priority(TaskPriority::BestEffort), 0);
        assert_eq!(queue.num_task_sources_with_priority(TaskPriority::UserBlocking), 1);
    }

    #[test]
    fn model_check_against_sorted_pops() {
        use proptest::prelude::*;

        proptest!(|(priorities in proptest::collection::vec(0u8..3, 1..40))| {
            let base = Instant::now();
            let mut queue = PriorityQueue::new();
            queue.enable_flush_task_sources_on_destroy_for_testing();
            let mut expected: Vec<(u8, usize)> = Vec::new();

            for (i, p) in priorities.iter().enumerate() {
                let priority = match p {
                    0 => TaskPriority::BestEffort,
                    1 => TaskPriority::UserVisible,
                    _ => TaskPriority::UserBlocking,
                };
                let sequence = sequence_with_priority(priority);
                // Synthesize deterministic ready times so the expected order is total.
                let key = TaskSourceSortKey::new(priority, 0, base + Duration::from_millis(i as u64));
                queue.push(registered(&sequence), key);
                expected.push((*p, i));
            }

            // Highest priority first; ties by insertion (ready time) order.
            expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

            let mut popped = Vec::new();
            while let Some((source, key)) = queue.pop_entry() {
                source.source().clear();
                popped.push(key.priority());
            }
            let expected_priorities: Vec<TaskPriority> = expected
                .iter()
                .map(|(p, _)| match p {
                    0 => TaskPriority::BestEffort,
                    1 => TaskPriority::UserVisible,
                    _ => TaskPriority::UserBlocking,
                })
                .collect();
            prop_assert_eq!(popped, expected_priorities);
        });
    }
}
