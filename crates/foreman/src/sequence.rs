//! A FIFO task source with a concurrency of one.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use pool_synchronization::{CheckedLock, CheckedLockGuard};

use crate::execution_environment::{
    ExecutionEnvironment, SequenceLocalStorageMap, SequenceToken,
};
use crate::sort_key::TaskSourceSortKey;
use crate::task::Task;
use crate::task_runner::TaskRunner;
use crate::task_source::{
    HeapHandle, RunIntent, TaskSource, TaskSourceExecutionMode,
};
use crate::task_traits::{TaskPriority, TaskShutdownBehavior, TaskTraits, ThreadPolicy};

fn priority_from_u8(value: u8) -> TaskPriority {
    match value {
        0 => TaskPriority::BestEffort,
        1 => TaskPriority::UserVisible,
        _ => TaskPriority::UserBlocking,
    }
}

struct SequenceInner {
    queue: VecDeque<Task>,
    /// Time used by the next sort: the front task's queue time, refreshed on re-enqueue.
    ready_time: Instant,
    /// Strong reference to the TaskRunner that feeds this sequence, held only while the sequence
    /// has queued immediate tasks.  This is what keeps a runner alive while work it posted is
    /// still pending, without creating a permanent runner↔sequence cycle.
    task_runner: Option<Arc<dyn TaskRunner>>,
}

pub(crate) struct Sequence {
    base_traits: TaskTraits,
    priority: AtomicU8,
    execution_mode: TaskSourceExecutionMode,
    token: SequenceToken,
    storage: Arc<Mutex<SequenceLocalStorageMap>>,
    /// Whether a worker currently holds this sequence (between `will_run_task` and
    /// `did_process_task`).  A sequence is never in a queue while this is set, so the flag is
    /// only ever flipped by the single worker that owns the run slot.
    has_worker: AtomicBool,
    heap_handle: HeapHandle,
    // The sequence lock is the universal predecessor of the lock order: it may be held while any
    // other scheduler lock is acquired.
    inner: CheckedLock<SequenceInner>,
}

impl Sequence {
    pub(crate) fn new(traits: TaskTraits, execution_mode: TaskSourceExecutionMode) -> Arc<Sequence> {
        Arc::new(Sequence {
            priority: AtomicU8::new(traits.priority as u8),
            base_traits: traits,
            execution_mode,
            token: SequenceToken::new(),
            storage: Arc::new(Mutex::new(SequenceLocalStorageMap::default())),
            has_worker: AtomicBool::new(false),
            heap_handle: HeapHandle::invalid(),
            inner: CheckedLock::universal_predecessor(SequenceInner {
                queue: VecDeque::new(),
                ready_time: Instant::now(),
                task_runner: None,
            }),
        })
    }

    pub(crate) fn token(&self) -> SequenceToken {
        self.token
    }

    /// Begins a transaction: a scope during which nothing else can touch the sequence's queue.
    pub(crate) fn begin_transaction(&self) -> SequenceTransaction<'_> {
        SequenceTransaction {
            sequence: self,
            inner: self.inner.lock(),
        }
    }
}

/// Multiple operations performed atomically on a [`Sequence`].  Holds the sequence lock; per the
/// lock order, it must be released before the sequence is moved into a priority queue.
pub(crate) struct SequenceTransaction<'a> {
    sequence: &'a Sequence,
    inner: CheckedLockGuard<'a, SequenceInner>,
}

impl SequenceTransaction<'_> {
    /// Returns true iff the task about to be pushed requires the sequence to be queued (it is
    /// empty and no worker is currently running it).  Must be paired with
    /// [`SequenceTransaction::push_immediate_task`] within the same transaction.
    pub(crate) fn will_push_immediate_task(&self) -> bool {
        self.inner.queue.is_empty() && !self.sequence.has_worker.load(Ordering::Relaxed)
    }

    pub(crate) fn push_immediate_task(
        &mut self,
        task: Task,
        task_runner: Option<Arc<dyn TaskRunner>>,
    ) {
        if self.inner.queue.is_empty() {
            self.inner.ready_time = task.queue_time;
        }
        self.inner.queue.push_back(task);
        if let Some(runner) = task_runner {
            self.inner.task_runner = Some(runner);
        }
    }

    pub(crate) fn traits(&self) -> TaskTraits {
        self.sequence.traits()
    }
}

impl TaskSource for Sequence {
    fn traits(&self) -> TaskTraits {
        TaskTraits {
            priority: self.priority_racy(),
            ..self.base_traits
        }
    }

    fn execution_mode(&self) -> TaskSourceExecutionMode {
        self.execution_mode
    }

    fn shutdown_behavior(&self) -> TaskShutdownBehavior {
        self.base_traits.shutdown_behavior
    }

    fn priority_racy(&self) -> TaskPriority {
        priority_from_u8(self.priority.load(Ordering::Relaxed))
    }

    fn thread_policy(&self) -> ThreadPolicy {
        self.base_traits.thread_policy
    }

    fn sort_key(&self) -> TaskSourceSortKey {
        let inner = self.inner.lock();
        TaskSourceSortKey::new(self.priority_racy(), 0, inner.ready_time)
    }

    fn will_run_task(&self) -> RunIntent {
        // The caller popped this sequence from a queue, so it is the only worker that can reach
        // it; a sequence saturates with its first worker.
        let had_worker = self.has_worker.swap(true, Ordering::Relaxed);
        debug_assert!(!had_worker, "a sequence can only be run by one worker at a time");
        RunIntent::AllowedSaturated
    }

    fn take_task(&self) -> Option<Task> {
        debug_assert!(self.has_worker.load(Ordering::Relaxed));
        let mut inner = self.inner.lock();
        let task = inner.queue.pop_front();
        debug_assert!(task.is_some(), "take_task on an empty sequence");
        task
    }

    fn did_process_task(&self) -> bool {
        let released_runner;
        let should_be_queued;
        {
            let mut inner = self.inner.lock();
            self.has_worker.store(false, Ordering::Relaxed);
            should_be_queued = !inner.queue.is_empty();
            released_runner = if should_be_queued {
                None
            } else {
                inner.task_runner.take()
            };
        }
        // The runner (and whatever it transitively owns) is dropped outside the sequence lock.
        drop(released_runner);
        should_be_queued
    }

    fn will_reenqueue(&self, now: Instant) {
        self.inner.lock().ready_time = now;
    }

    fn clear(&self) {
        let (tasks, runner) = {
            let mut inner = self.inner.lock();
            let tasks: Vec<Task> = inner.queue.drain(..).collect();
            (tasks, inner.task_runner.take())
        };
        drop(tasks);
        drop(runner);
    }

    fn remaining_concurrency(&self) -> usize {
        usize::from(!self.has_worker.load(Ordering::Relaxed))
    }

    fn update_priority(&self, priority: TaskPriority) {
        self.priority.store(priority as u8, Ordering::Relaxed);
    }

    fn execution_environment(&self) -> Option<ExecutionEnvironment> {
        Some(ExecutionEnvironment {
            token: self.token,
            storage: Some(self.storage.clone()),
        })
    }

    fn heap_index(&self) -> usize {
        self.heap_handle.get()
    }

    fn set_heap_index(&self, index: usize) {
        self.heap_handle.set(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(sequence: &Sequence, task: Task) -> bool {
        let mut transaction = sequence.begin_transaction();
        let should_queue = transaction.will_push_immediate_task();
        transaction.push_immediate_task(task, None);
        should_queue
    }

    #[test]
    fn first_push_queues_later_pushes_do_not() {
        let sequence = Sequence::new(TaskTraits::new(), TaskSourceExecutionMode::Sequenced);
        assert!(push(&sequence, Task::new(|| {})));
        assert!(!push(&sequence, Task::new(|| {})));
    }

    #[test]
    fn tasks_come_out_in_posting_order() {
        let sequence = Sequence::new(TaskTraits::new(), TaskSourceExecutionMode::Sequenced);
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            push(&sequence, Task::new(move || log.lock().unwrap().push(i)));
        }

        for _ in 0..3 {
            assert_eq!(sequence.will_run_task(), RunIntent::AllowedSaturated);
            let task = sequence.take_task().unwrap();
            (task.closure)();
            sequence.did_process_task();
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn did_process_task_reports_remaining_work() {
        let sequence = Sequence::new(TaskTraits::new(), TaskSourceExecutionMode::Sequenced);
        push(&sequence, Task::new(|| {}));
        push(&sequence, Task::new(|| {}));

        sequence.will_run_task();
        sequence.take_task().unwrap();
        assert!(sequence.did_process_task());

        sequence.will_run_task();
        sequence.take_task().unwrap();
        assert!(!sequence.did_process_task());
    }

    #[test]
    fn push_while_worker_runs_last_task_does_not_requeue() {
        let sequence = Sequence::new(TaskTraits::new(), TaskSourceExecutionMode::Sequenced);
        push(&sequence, Task::new(|| {}));

        sequence.will_run_task();
        sequence.take_task().unwrap();
        // Queue is empty but the worker still holds the sequence: the post must not requeue.
        assert!(!push(&sequence, Task::new(|| {})));
        // The worker notices the new task and requeues itself.
        assert!(sequence.did_process_task());
    }

    #[test]
    fn priority_update_is_visible_in_sort_key() {
        let traits = TaskTraits::new().with_priority(TaskPriority::BestEffort);
        let sequence = Sequence::new(traits, TaskSourceExecutionMode::Sequenced);
        assert_eq!(sequence.sort_key().priority(), TaskPriority::BestEffort);
        sequence.update_priority(TaskPriority::UserBlocking);
        assert_eq!(sequence.sort_key().priority(), TaskPriority::UserBlocking);
        // Shutdown behavior is not affected by priority updates.
        assert_eq!(
            sequence.shutdown_behavior(),
            TaskTraits::new().shutdown_behavior
        );
    }
}
