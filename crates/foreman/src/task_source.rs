//! The polymorphic unit of schedulable work.
//!
//! A task source yields a series of tasks.  A worker that wants to run from a source first calls
//! [`TaskSource::will_run_task`], which reserves a run slot and reports whether the source is now
//! saturated (must leave the queue) or can still accept more workers (cooperative jobs).  After
//! running, [`TaskSource::did_process_task`] releases the slot and reports whether the source
//! still has work and should be re-enqueued.
//!
//! There is a known reference cycle in this architecture: TaskSource → TaskRunner → TaskSource.
//! It is not a leak because the source only holds its TaskRunner reference while it has at least
//! one queued immediate task; the moment the source drains, the backref is dropped.  The other
//! owners (a priority queue or a worker, in alternation) are obligated to keep running the source
//! until `did_process_task` returns false, at which point releasing it is safe.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::execution_environment::ExecutionEnvironment;
use crate::sort_key::TaskSourceSortKey;
use crate::task::Task;
use crate::task_tracker::TaskTracker;
use crate::task_traits::{TaskPriority, TaskShutdownBehavior, TaskTraits, ThreadPolicy};

/// How tasks from one source may be interleaved.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskSourceExecutionMode {
    /// Each task is independent; the source holds exactly one.
    Parallel,
    /// Tasks run one at a time in posting order, on any thread.
    Sequenced,
    /// Tasks run one at a time in posting order, all on the same thread.
    SingleThread,
}

/// Result of reserving a run slot on a source.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum RunIntent {
    /// The source cannot run right now (canceled job, or concurrency limit raced to full).
    Disallowed,
    /// The slot was reserved and the source can still take more workers.
    AllowedNotSaturated,
    /// The slot was reserved and the source is now at its concurrency limit.
    AllowedSaturated,
}

/// Sentinel for "not currently in a priority queue".
pub(crate) const INVALID_HEAP_INDEX: usize = usize::MAX;

pub(crate) trait TaskSource: Send + Sync {
    fn traits(&self) -> TaskTraits;
    fn execution_mode(&self) -> TaskSourceExecutionMode;
    /// Immutable for the lifetime of the source; readable without synchronization.
    fn shutdown_behavior(&self) -> TaskShutdownBehavior;
    /// Racy read of the current priority (it may be concurrently updated).
    fn priority_racy(&self) -> TaskPriority;
    fn thread_policy(&self) -> ThreadPolicy;

    fn sort_key(&self) -> TaskSourceSortKey;

    /// Reserves a run slot.  Must not be called on an empty source.
    fn will_run_task(&self) -> RunIntent;
    /// Takes the next task.  Only valid after a successful `will_run_task`.
    fn take_task(&self) -> Option<Task>;
    /// Releases the run slot taken by `will_run_task`.  Returns true iff the source still has
    /// work and should be re-enqueued.
    fn did_process_task(&self) -> bool;
    /// Stamps the readiness time used by the next sort, just before re-enqueueing.
    fn will_reenqueue(&self, now: Instant);
    /// Drops all remaining tasks (shutdown path, test teardown).
    fn clear(&self);

    /// How many more workers the source could use right now.
    fn remaining_concurrency(&self) -> usize;

    fn update_priority(&self, priority: TaskPriority);

    /// The environment to install around this source's tasks, if it is sequenced.
    fn execution_environment(&self) -> Option<ExecutionEnvironment>;

    /// Position in the owning priority queue.  Only read or written under that queue's lock; the
    /// atomic exists because Rust has no way to say "guarded by a foreign lock".
    fn heap_index(&self) -> usize;
    fn set_heap_index(&self, index: usize);
}

/// Shared heap-handle storage for `TaskSource` implementations.
pub(crate) struct HeapHandle(AtomicUsize);

impl HeapHandle {
    pub(crate) fn invalid() -> HeapHandle {
        HeapHandle(AtomicUsize::new(INVALID_HEAP_INDEX))
    }

    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn set(&self, index: usize) {
        self.0.store(index, Ordering::Relaxed);
    }
}

/// A move-only token proving that a source was admitted by the tracker.
///
/// Dropping the token without [`RegisteredTaskSource::unregister`] reports the source as complete
/// to the tracker, which is what keeps the incomplete-source count (and the blocking-shutdown
/// claim of BlockShutdown sources) balanced no matter which path releases the source.
pub(crate) struct RegisteredTaskSource {
    inner: Option<(Arc<dyn TaskSource>, Option<Arc<TaskTracker>>)>,
}

impl RegisteredTaskSource {
    pub(crate) fn new(
        source: Arc<dyn TaskSource>,
        tracker: Arc<TaskTracker>,
    ) -> RegisteredTaskSource {
        RegisteredTaskSource {
            inner: Some((source, Some(tracker))),
        }
    }

    /// A token with no tracker obligation, for tests that exercise queues directly.
    #[cfg(test)]
    pub(crate) fn create_for_testing(source: Arc<dyn TaskSource>) -> RegisteredTaskSource {
        RegisteredTaskSource {
            inner: Some((source, None)),
        }
    }

    pub(crate) fn source(&self) -> &Arc<dyn TaskSource> {
        &self.inner.as_ref().unwrap().0
    }

    /// Discharges the obligation and returns the underlying source.
    pub(crate) fn unregister(mut self) -> Arc<dyn TaskSource> {
        let (source, tracker) = self.inner.take().unwrap();
        if let Some(tracker) = tracker {
            tracker.unregister_task_source(source.as_ref());
        }
        source
    }
}

impl Drop for RegisteredTaskSource {
    fn drop(&mut self) {
        if let Some((source, tracker)) = self.inner.take() {
            if let Some(tracker) = tracker {
                tracker.unregister_task_source(source.as_ref());
            }
        }
    }
}

impl std::fmt::Debug for RegisteredTaskSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTaskSource")
            .field("registered", &self.inner.is_some())
            .finish()
    }
}
