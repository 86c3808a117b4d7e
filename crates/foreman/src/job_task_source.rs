//! A cooperative-parallel task source.
//!
//! A job is a single logical operation that many workers can help with at once, such as "compress
//! these 400 chunks".  The caller provides a worker function (one invocation = one slice of help)
//! and a concurrency function that bounds how many workers may be helping simultaneously, given
//! how many already are.  Workers keep re-invoking the worker function until the concurrency
//! function says no more help is useful or the job is canceled.
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::execution_environment::{ExecutionEnvironment, SequenceToken};
use crate::sort_key::TaskSourceSortKey;
use crate::task::Task;
use crate::task_source::{HeapHandle, RunIntent, TaskSource, TaskSourceExecutionMode};
use crate::task_traits::{TaskPriority, TaskShutdownBehavior, TaskTraits, ThreadPolicy};
use crate::thread_pool::ThreadPoolCore;

fn priority_from_u8(value: u8) -> TaskPriority {
    match value {
        0 => TaskPriority::BestEffort,
        1 => TaskPriority::UserVisible,
        _ => TaskPriority::UserBlocking,
    }
}

pub(crate) struct JobTaskSource {
    base_traits: TaskTraits,
    priority: AtomicU8,
    token: SequenceToken,
    worker_task: Box<dyn Fn(&JobDelegate) + Send + Sync>,
    /// Given the number of workers currently on the job, how many could contribute.
    max_concurrency_fn: Box<dyn Fn(usize) -> usize + Send + Sync>,
    worker_count: AtomicUsize,
    canceled: AtomicBool,
    ready_time: Instant,
    heap_handle: HeapHandle,
    self_weak: Weak<JobTaskSource>,
    core: Weak<ThreadPoolCore>,
}

impl JobTaskSource {
    pub(crate) fn new(
        traits: TaskTraits,
        worker_task: impl Fn(&JobDelegate) + Send + Sync + 'static,
        max_concurrency_fn: impl Fn(usize) -> usize + Send + Sync + 'static,
        core: Weak<ThreadPoolCore>,
    ) -> Arc<JobTaskSource> {
        Arc::new_cyclic(|self_weak| JobTaskSource {
            priority: AtomicU8::new(traits.priority as u8),
            base_traits: traits,
            token: SequenceToken::new(),
            worker_task: Box::new(worker_task),
            max_concurrency_fn: Box::new(max_concurrency_fn),
            worker_count: AtomicUsize::new(0),
            canceled: AtomicBool::new(false),
            ready_time: Instant::now(),
            heap_handle: HeapHandle::invalid(),
            self_weak: self_weak.clone(),
            core,
        })
    }

    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Relaxed)
    }

    fn max_concurrency(&self, worker_count: usize) -> usize {
        (self.max_concurrency_fn)(worker_count)
    }
}

impl TaskSource for JobTaskSource {
    fn traits(&self) -> TaskTraits {
        TaskTraits {
            priority: self.priority_racy(),
            ..self.base_traits
        }
    }

    fn execution_mode(&self) -> TaskSourceExecutionMode {
        TaskSourceExecutionMode::Parallel
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
        let worker_count = self.worker_count.load(Ordering::Relaxed).min(u8::MAX as usize);
        TaskSourceSortKey::new(self.priority_racy(), worker_count as u8, self.ready_time)
    }

    fn will_run_task(&self) -> RunIntent {
        // Reserve a run slot unless the concurrency limit is reached.  CAS loop because several
        // workers can race here through different queues (one in the queue, others via
        // `did_process_task` re-entry).
        let mut count = self.worker_count.load(Ordering::Relaxed);
        loop {
            if self.is_canceled() {
                return RunIntent::Disallowed;
            }
            let max = self.max_concurrency(count);
            if count >= max {
                return RunIntent::Disallowed;
            }
            match self.worker_count.compare_exchange_weak(
                count,
                count + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return if count + 1 >= max {
                        RunIntent::AllowedSaturated
                    } else {
                        RunIntent::AllowedNotSaturated
                    };
                }
                Err(observed) => count = observed,
            }
        }
    }

    fn take_task(&self) -> Option<Task> {
        let weak = self.self_weak.clone();
        Some(Task::new(move || {
            if let Some(source) = weak.upgrade() {
                if !source.is_canceled() {
                    let delegate = JobDelegate { source: &source };
                    (source.worker_task)(&delegate);
                }
            }
        }))
    }

    fn did_process_task(&self) -> bool {
        let count = self.worker_count.fetch_sub(1, Ordering::Relaxed) - 1;
        !self.is_canceled() && self.max_concurrency(count) > count
    }

    fn will_reenqueue(&self, _now: Instant) {
        // Jobs sort by their original enqueue time; the worker count is what moves them.
    }

    fn clear(&self) {
        self.cancel();
    }

    fn remaining_concurrency(&self) -> usize {
        let count = self.worker_count.load(Ordering::Relaxed);
        self.max_concurrency(count).saturating_sub(count)
    }

    fn update_priority(&self, priority: TaskPriority) {
        self.priority.store(priority as u8, Ordering::Relaxed);
    }

    fn execution_environment(&self) -> Option<ExecutionEnvironment> {
        Some(ExecutionEnvironment {
            token: self.token,
            storage: None,
        })
    }

    fn heap_index(&self) -> usize {
        self.heap_handle.get()
    }

    fn set_heap_index(&self, index: usize) {
        self.heap_handle.set(index);
    }
}

/// Handed to each invocation of a job's worker function.
pub struct JobDelegate<'a> {
    source: &'a Arc<JobTaskSource>,
}

impl JobDelegate<'_> {
    /// True when the current invocation should return promptly so the worker can pick up more
    /// important work.  The job is re-enqueued and loses nothing by yielding.
    pub fn should_yield(&self) -> bool {
        match self.source.core.upgrade() {
            Some(core) => core.should_yield(self.source.as_ref() as &dyn TaskSource),
            None => true,
        }
    }
}

/// Owner-side handle to a running job.  Dropping the handle detaches the job: it keeps running to
/// completion unless canceled.
pub struct JobHandle {
    source: Arc<JobTaskSource>,
    core: Weak<ThreadPoolCore>,
}

impl JobHandle {
    pub(crate) fn new(source: Arc<JobTaskSource>, core: Weak<ThreadPoolCore>) -> JobHandle {
        JobHandle { source, core }
    }

    /// Tells the scheduler that `max_concurrency` may now return a larger value, so more workers
    /// should be invited.
    pub fn notify_concurrency_increase(&self) {
        if self.source.is_canceled() {
            return;
        }
        if let Some(core) = self.core.upgrade() {
            core.enqueue_job_task_source(self.source.clone());
        }
    }

    pub fn update_priority(&self, priority: TaskPriority) {
        if let Some(core) = self.core.upgrade() {
            core.update_priority(self.source.clone(), priority);
        }
    }

    /// Stops inviting workers and drops the job from its queue.  Invocations already running
    /// finish on their own.
    pub fn cancel(&self) {
        self.source.cancel();
        if let Some(core) = self.core.upgrade() {
            core.remove_job_task_source(&self.source);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_max(max: usize) -> Arc<JobTaskSource> {
        JobTaskSource::new(
            TaskTraits::new(),
            |_delegate| {},
            move |_worker_count| max,
            Weak::new(),
        )
    }

    #[test]
    fn saturates_at_max_concurrency() {
        let job = job_with_max(2);
        assert_eq!(job.will_run_task(), RunIntent::AllowedNotSaturated);
        assert_eq!(job.will_run_task(), RunIntent::AllowedSaturated);
        assert_eq!(job.will_run_task(), RunIntent::Disallowed);

        // Releasing a slot re-opens the job.
        assert!(job.did_process_task());
        assert_eq!(job.will_run_task(), RunIntent::AllowedSaturated);
    }

    #[test]
    fn canceled_job_rejects_workers_and_requeueing() {
        let job = job_with_max(4);
        assert_eq!(job.will_run_task(), RunIntent::AllowedNotSaturated);
        job.cancel();
        assert_eq!(job.will_run_task(), RunIntent::Disallowed);
        assert!(!job.did_process_task());
    }

    #[test]
    fn worker_count_is_reflected_in_sort_key() {
        let job = job_with_max(8);
        assert_eq!(job.sort_key().worker_count(), 0);
        job.will_run_task();
        job.will_run_task();
        assert_eq!(job.sort_key().worker_count(), 2);
    }

    #[test]
    fn spawned_task_runs_worker_function() {
        use std::sync::atomic::AtomicUsize;

        let invocations = Arc::new(AtomicUsize::new(0));
        let invocations2 = invocations.clone();
        let job = JobTaskSource::new(
            TaskTraits::new(),
            move |_delegate| {
                invocations2.fetch_add(1, Ordering::Relaxed);
            },
            |_| 1,
            Weak::new(),
        );

        job.will_run_task();
        let task = job.take_task().unwrap();
        (task.closure)();
        job.did_process_task();
        assert_eq!(invocations.load(Ordering::Relaxed), 1);
    }
}
