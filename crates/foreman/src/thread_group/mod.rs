//! A group of worker threads multiplexed over one priority queue.
//!
//! The group expands and contracts its usable concurrency in response to blocking tasks (a
//! blocked thread gives its run slot back by raising `max_tasks` for the duration of the blocking
//! scope), routes re-enqueued sources to the group their traits now select, and hands excess
//! workers back to the OS after an idle period.
//!
//! Everything mutable lives under one lock.  Because that lock sits on the post path, nothing
//! slow happens inside it: thread starts, wake-ups, source releases and service-thread
//! scheduling are gathered in a [`ScopedCommandsExecutor`] and performed after the lock is
//! released.
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use pool_synchronization::{
    CheckedCondvar, CheckedLock, CheckedLockGuard, ResetPolicy, WaitableEvent,
};
use smallvec::SmallVec;

use crate::blocking::{
    clear_blocking_observer_for_current_thread, set_blocking_observer_for_current_thread,
    BlockingObserver, BlockingType,
};
use crate::delayed_task_manager::DelayedTaskManager;
use crate::priority_queue::PriorityQueue;
use crate::sort_key::TaskSourceSortKey;
use crate::task_source::{RegisteredTaskSource, RunIntent, TaskSource};
use crate::task_tracker::TaskTracker;
use crate::task_traits::{TaskPriority, TaskShutdownBehavior, TaskTraits};
use crate::work_tracker::WorkTracker;
use crate::worker::{ThreadType, WorkerDelegate, WorkerThread, WorkerThreadObserver};

/// Hard ceiling on workers per group, including blocking-scope inflation.
const MAX_NUMBER_OF_WORKERS: usize = 256;

/// Default timeout after which a MayBlock scope is treated as actually blocking.
const DEFAULT_MAY_BLOCK_THRESHOLD: Duration = Duration::from_millis(10);

/// Default interval of the service-thread poll that resolves MayBlock scopes.
const DEFAULT_BLOCKED_WORKERS_POLL_PERIOD: Duration = Duration::from_millis(50);

/// Ceiling on workers created by a single `ensure_enough_workers` pass.
const DEFAULT_MAX_NUM_WORKERS_CREATED: usize = 2;

/// Environment set up on each worker.  `ComMta` only means something on Windows, where workers
/// would initialize a COM multi-threaded apartment; elsewhere it is configuration-compatible and
/// inert.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) enum WorkerEnvironment {
    #[default]
    None,
    ComMta,
}

/// Routes a re-enqueued task source to the group its current traits select.
pub(crate) trait ThreadGroupDelegate: Send + Sync {
    fn thread_group_for_traits(&self, traits: TaskTraits) -> Arc<ThreadGroup>;
}

/// Start-time configuration, write-once at `start()`.
pub(crate) struct ThreadGroupStartParams {
    pub(crate) max_tasks: usize,
    pub(crate) max_best_effort_tasks: usize,
    pub(crate) suggested_reclaim_time: Duration,
    pub(crate) no_worker_reclaim: bool,
    pub(crate) worker_environment: WorkerEnvironment,
    pub(crate) may_block_threshold: Option<Duration>,
    pub(crate) blocked_workers_poll_period: Option<Duration>,
    pub(crate) service: Arc<DelayedTaskManager>,
    pub(crate) worker_thread_observer: Option<Arc<dyn WorkerThreadObserver>>,
}

struct InitializedInStart {
    initial_max_tasks: usize,
    suggested_reclaim_time: Duration,
    no_worker_reclaim: bool,
    #[allow(dead_code)]
    worker_environment: WorkerEnvironment,
    may_block_threshold: Duration,
    blocked_workers_poll_period: Duration,
    max_num_workers_created: usize,
    service: Arc<DelayedTaskManager>,
    worker_thread_observer: Option<Arc<dyn WorkerThreadObserver>>,
}

/// Scheduling state of one worker, guarded by the group lock.
struct WorkerState {
    worker: Arc<WorkerThread>,
    id: usize,
    /// Set between `get_work` handing out a source and `swap_processed_task` returning it.
    current_task_priority: Option<TaskPriority>,
    current_shutdown_behavior: Option<TaskShutdownBehavior>,
    /// When the current blocking scope started; cleared when it ends.
    blocking_start_time: Option<Instant>,
    /// Whether this worker holds an entry in `num_unresolved_may_block` (and the best-effort
    /// counterpart).
    may_block_pending: bool,
    best_effort_may_block_pending: bool,
    /// Whether `max_tasks` (and the best-effort limit) were raised for this worker's blocking
    /// scope.
    incremented_max_tasks_since_blocked: bool,
    incremented_max_best_effort_tasks_since_blocked: bool,
    /// Whether `max_tasks` was raised because this worker runs a ContinueOnShutdown task through
    /// shutdown.  Released in the next `swap_processed_task`.
    incremented_max_tasks_for_shutdown: bool,
}

impl WorkerState {
    fn new(worker: Arc<WorkerThread>) -> WorkerState {
        let id = worker.sequence_num();
        WorkerState {
            worker,
            id,
            current_task_priority: None,
            current_shutdown_behavior: None,
            blocking_start_time: None,
            may_block_pending: false,
            best_effort_may_block_pending: false,
            incremented_max_tasks_since_blocked: false,
            incremented_max_best_effort_tasks_since_blocked: false,
            incremented_max_tasks_for_shutdown: false,
        }
    }
}

/// The idle workers, most-recently-idled first so that waking reuses warm threads and the
/// longest-idle workers age toward reclaim.
#[derive(Default)]
struct IdleWorkerSet {
    ids: Vec<usize>,
}

impl IdleWorkerSet {
    fn contains(&self, id: usize) -> bool {
        self.ids.contains(&id)
    }

    fn insert_front(&mut self, id: usize) {
        debug_assert!(!self.contains(id));
        self.ids.insert(0, id);
    }

    fn take_front(&mut self) -> Option<usize> {
        if self.ids.is_empty() {
            None
        } else {
            Some(self.ids.remove(0))
        }
    }

    fn remove(&mut self, id: usize) {
        self.ids.retain(|&other| other != id);
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

struct ThreadGroupInner {
    priority_queue: PriorityQueue,
    workers: Vec<WorkerState>,
    idle_workers: IdleWorkerSet,
    worker_sequence_num: usize,

    shutdown_started: bool,
    join_called_for_testing: bool,
    worker_cleanup_disallowed_for_testing: bool,
    adjust_max_tasks_posted: bool,
    num_workers_cleaned_up_for_testing: usize,

    /// Concurrency limit before blocking-scope adjustments.
    baseline_max_tasks: usize,
    /// Current concurrency limit, including adjustments.  Zero until `start()`.
    max_tasks: usize,
    max_best_effort_tasks: usize,
    num_running_tasks: usize,
    num_running_best_effort_tasks: usize,
    /// Workers inside a MayBlock scope that hasn't caused a max-tasks increase yet.
    num_unresolved_may_block: usize,
    num_unresolved_best_effort_may_block: usize,
}

impl ThreadGroupInner {
    fn num_awake_workers(&self) -> usize {
        self.workers.len() - self.idle_workers.len()
    }

    fn worker_index_by_id(&self, id: usize) -> Option<usize> {
        self.workers.iter().position(|state| state.id == id)
    }

    fn increment_tasks_running(&mut self, priority: TaskPriority) {
        self.num_running_tasks += 1;
        if priority == TaskPriority::BestEffort {
            self.num_running_best_effort_tasks += 1;
        }
    }

    fn decrement_tasks_running(&mut self, priority: TaskPriority) {
        debug_assert!(self.num_running_tasks > 0);
        self.num_running_tasks -= 1;
        if priority == TaskPriority::BestEffort {
            debug_assert!(self.num_running_best_effort_tasks > 0);
            self.num_running_best_effort_tasks -= 1;
        }
    }

    /// Raises the concurrency limits once for the worker at `index`.  When the worker is inside
    /// a blocking scope, the increase is booked against that scope (flag set, pending MayBlock
    /// entry canceled) and reverted when the scope ends; otherwise the caller owns the reversal
    /// (the shutdown compensation reverts in `swap_processed_task`).
    fn increment_max_tasks_for_worker(&mut self, index: usize) {
        let is_best_effort =
            self.workers[index].current_task_priority == Some(TaskPriority::BestEffort);
        let in_blocking_scope = self.workers[index].blocking_start_time.is_some();
        if !self.workers[index].incremented_max_tasks_since_blocked
            && self.max_tasks < MAX_NUMBER_OF_WORKERS
        {
            self.max_tasks += 1;
            if in_blocking_scope {
                self.workers[index].incremented_max_tasks_since_blocked = true;
                if self.workers[index].may_block_pending {
                    self.workers[index].may_block_pending = false;
                    debug_assert!(self.num_unresolved_may_block > 0);
                    self.num_unresolved_may_block -= 1;
                }
            }
        }
        if is_best_effort
            && !self.workers[index].incremented_max_best_effort_tasks_since_blocked
            && self.max_best_effort_tasks < MAX_NUMBER_OF_WORKERS
        {
            self.max_best_effort_tasks += 1;
            if in_blocking_scope {
                self.workers[index].incremented_max_best_effort_tasks_since_blocked = true;
                if self.workers[index].best_effort_may_block_pending {
                    self.workers[index].best_effort_may_block_pending = false;
                    debug_assert!(self.num_unresolved_best_effort_may_block > 0);
                    self.num_unresolved_best_effort_may_block -= 1;
                }
            }
        }
    }
}

/// Deferred side effects of lock-held decisions, performed after the group lock is released.
pub(crate) struct ScopedCommandsExecutor {
    workers_to_wake: SmallVec<[Arc<WorkerThread>; 2]>,
    workers_to_start: SmallVec<[(Arc<WorkerThread>, String); 2]>,
    task_sources_to_release: Vec<RegisteredTaskSource>,
    must_schedule_adjust_max_tasks: bool,
}

impl ScopedCommandsExecutor {
    fn new() -> ScopedCommandsExecutor {
        ScopedCommandsExecutor {
            workers_to_wake: SmallVec::new(),
            workers_to_start: SmallVec::new(),
            task_sources_to_release: Vec::new(),
            must_schedule_adjust_max_tasks: false,
        }
    }

    fn schedule_wake_up(&mut self, worker: Arc<WorkerThread>) {
        self.workers_to_wake.push(worker);
    }

    fn schedule_start(&mut self, worker: Arc<WorkerThread>, thread_name: String) {
        self.workers_to_start.push((worker, thread_name));
    }

    fn schedule_release_task_source(&mut self, task_source: RegisteredTaskSource) {
        self.task_sources_to_release.push(task_source);
    }

    fn flush(self, group: &ThreadGroup) {
        CheckedLock::<()>::assert_no_lock_held_on_current_thread();
        // Workers and polls only exist after start(), so `after_start` is resolved lazily: a
        // pre-start push legitimately flushes an empty executor.
        for (worker, thread_name) in self.workers_to_start {
            let observer = group.after_start().worker_thread_observer.clone();
            worker.start(thread_name, observer);
        }
        for worker in self.workers_to_wake {
            worker.wake_up();
        }
        drop(self.task_sources_to_release);
        if self.must_schedule_adjust_max_tasks {
            let after_start = group.after_start();
            let weak = group.self_weak.clone();
            after_start.service.schedule(
                after_start.blocked_workers_poll_period,
                Box::new(move || {
                    if let Some(group) = weak.upgrade() {
                        group.adjust_max_tasks();
                    }
                }),
            );
        }
    }
}

fn next_group_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Packed (priority, worker count) used by the yield contract.
fn pack_yield_key(priority: TaskPriority, worker_count: u8) -> u32 {
    ((priority as u32) << 8) | worker_count as u32
}

fn unpack_yield_key(packed: u32) -> (TaskPriority, u8) {
    let priority = match packed >> 8 {
        0 => TaskPriority::BestEffort,
        1 => TaskPriority::UserVisible,
        _ => TaskPriority::UserBlocking,
    };
    (priority, (packed & 0xff) as u8)
}

/// Sentinel: no waiting source requires anyone to yield.
const YIELD_KEY_NONE: u32 = u32::MAX;

pub(crate) struct ThreadGroup {
    id: u64,
    label: String,
    thread_type_hint: ThreadType,
    task_tracker: Arc<TaskTracker>,
    self_weak: Weak<ThreadGroup>,
    delegate: OnceLock<Weak<dyn ThreadGroupDelegate>>,
    work_tracker: WorkTracker,
    inner: CheckedLock<ThreadGroupInner>,
    /// Sort key of the next source to schedule while the group is at capacity; `YIELD_KEY_NONE`
    /// otherwise.  Written under the lock, read anywhere.
    min_allowed_sort_key: AtomicU32,
    after_start: OnceLock<InitializedInStart>,
    idle_workers_cv_for_testing: CheckedCondvar,
    cleaned_up_cv_for_testing: CheckedCondvar,
    num_unnecessary_wakeups_for_testing: AtomicUsize,
}

impl ThreadGroup {
    pub(crate) fn new(
        label: &str,
        thread_type_hint: ThreadType,
        task_tracker: Arc<TaskTracker>,
    ) -> Arc<ThreadGroup> {
        Arc::new_cyclic(|self_weak| ThreadGroup {
            id: next_group_id(),
            label: label.to_owned(),
            thread_type_hint,
            task_tracker,
            self_weak: self_weak.clone(),
            delegate: OnceLock::new(),
            work_tracker: WorkTracker::new(),
            inner: CheckedLock::new(ThreadGroupInner {
                priority_queue: PriorityQueue::new(),
                workers: Vec::new(),
                idle_workers: IdleWorkerSet::default(),
                worker_sequence_num: 0,
                shutdown_started: false,
                join_called_for_testing: false,
                worker_cleanup_disallowed_for_testing: false,
                adjust_max_tasks_posted: false,
                num_workers_cleaned_up_for_testing: 0,
                baseline_max_tasks: 0,
                max_tasks: 0,
                max_best_effort_tasks: 0,
                num_running_tasks: 0,
                num_running_best_effort_tasks: 0,
                num_unresolved_may_block: 0,
                num_unresolved_best_effort_may_block: 0,
            }),
            min_allowed_sort_key: AtomicU32::new(YIELD_KEY_NONE),
            after_start: OnceLock::new(),
            idle_workers_cv_for_testing: CheckedCondvar::new(),
            cleaned_up_cv_for_testing: CheckedCondvar::new(),
            num_unnecessary_wakeups_for_testing: AtomicUsize::new(0),
        })
    }

    pub(crate) fn set_delegate(&self, delegate: Weak<dyn ThreadGroupDelegate>) {
        if self.delegate.set(delegate).is_err() {
            panic!("thread group delegate can only be set once");
        }
    }

    pub(crate) fn work_tracker(&self) -> &WorkTracker {
        &self.work_tracker
    }

    fn after_start(&self) -> &InitializedInStart {
        self.after_start
            .get()
            .expect("thread group used before start()")
    }

    /// Creates workers and allows existing and future task sources to run.  Single-shot.
    pub(crate) fn start(&self, params: ThreadGroupStartParams) {
        let init = InitializedInStart {
            initial_max_tasks: params.max_tasks.min(MAX_NUMBER_OF_WORKERS),
            suggested_reclaim_time: params.suggested_reclaim_time,
            no_worker_reclaim: params.no_worker_reclaim,
            worker_environment: params.worker_environment,
            may_block_threshold: params
                .may_block_threshold
                .unwrap_or(DEFAULT_MAY_BLOCK_THRESHOLD),
            blocked_workers_poll_period: params
                .blocked_workers_poll_period
                .unwrap_or(DEFAULT_BLOCKED_WORKERS_POLL_PERIOD),
            max_num_workers_created: DEFAULT_MAX_NUM_WORKERS_CREATED,
            service: params.service,
            worker_thread_observer: params.worker_thread_observer,
        };
        if self.after_start.set(init).is_err() {
            panic!("thread group can only be started once");
        }

        let mut executor = ScopedCommandsExecutor::new();
        {
            let mut inner = self.inner.lock();
            debug_assert!(inner.workers.is_empty());
            inner.baseline_max_tasks = self.after_start().initial_max_tasks;
            inner.max_tasks = inner.baseline_max_tasks;
            inner.max_best_effort_tasks = params.max_best_effort_tasks.min(inner.max_tasks);
            self.ensure_enough_workers_lock_required(&mut inner, &mut executor);
        }
        executor.flush(self);
        log::info!(
            "thread group {} started with max_tasks={}",
            self.label,
            self.after_start().initial_max_tasks
        );
    }

    /// Pushes a task source and wakes workers as appropriate.  If the source's traits route to a
    /// different group by now (a priority update raced), forwards it there.
    pub(crate) fn push_task_source_and_wake_up_workers(
        &self,
        task_source: RegisteredTaskSource,
    ) {
        if let Some(destination) = self.resolve_destination(task_source.source().traits()) {
            if destination.id != self.id {
                return destination.push_task_source_and_wake_up_workers_here(task_source);
            }
        }
        self.push_task_source_and_wake_up_workers_here(task_source);
    }

    fn push_task_source_and_wake_up_workers_here(
        &self,
        task_source: RegisteredTaskSource,
    ) {
        self.work_tracker.will_request_reload_immediate_work_queue();
        // Per the lock order, the sort key is computed before the group lock is taken and no
        // source lock is held while the source is moved into the queue.
        let sort_key = task_source.source().sort_key();
        let mut executor = ScopedCommandsExecutor::new();
        {
            let mut inner = self.inner.lock();
            if inner
                .priority_queue
                .update_sort_key(task_source.source().as_ref(), sort_key)
            {
                // Already queued here (e.g. a job whose concurrency increased): the fresh
                // registration is redundant.
                executor.schedule_release_task_source(task_source);
            } else {
                inner.priority_queue.push(task_source, sort_key);
            }
            self.ensure_enough_workers_lock_required(&mut inner, &mut executor);
        }
        executor.flush(self);
    }

    /// Re-heapifies `source` in place after a priority change that keeps it in this group.
    pub(crate) fn update_sort_key(&self, source: &dyn TaskSource) {
        let sort_key = source.sort_key();
        let mut executor = ScopedCommandsExecutor::new();
        {
            let mut inner = self.inner.lock();
            inner.priority_queue.update_sort_key(source, sort_key);
            self.ensure_enough_workers_lock_required(&mut inner, &mut executor);
        }
        executor.flush(self);
    }

    /// Removes `source` from this group's queue, if queued.
    pub(crate) fn remove_task_source(&self, source: &dyn TaskSource) -> Option<RegisteredTaskSource> {
        let mut inner = self.inner.lock();
        inner.priority_queue.remove_task_source(source)
    }

    /// Moves every queued source to `destination`.
    pub(crate) fn handoff_all_task_sources_to_other_thread_group(
        &self,
        destination: &Arc<ThreadGroup>,
    ) {
        let mut moved = PriorityQueue::new();
        {
            let mut inner = self.inner.lock();
            std::mem::swap(&mut inner.priority_queue, &mut moved);
        }
        destination.enqueue_all_task_sources(&mut moved);
    }

    /// Moves every queued source except the UserBlocking ones to `destination`.
    pub(crate) fn handoff_non_user_blocking_task_sources_to_other_thread_group(
        &self,
        destination: &Arc<ThreadGroup>,
    ) {
        let mut kept = PriorityQueue::new();
        {
            let mut inner = self.inner.lock();
            // UserBlocking sources are all at the front of the queue; carve them off, then swap
            // the remainder out.
            while inner
                .priority_queue
                .peek_sort_key()
                .is_some_and(|key| key.priority() == TaskPriority::UserBlocking)
            {
                let (source, key) = inner.priority_queue.pop_entry().unwrap();
                kept.push(source, key);
            }
            std::mem::swap(&mut inner.priority_queue, &mut kept);
        }
        destination.enqueue_all_task_sources(&mut kept);
    }

    fn enqueue_all_task_sources(&self, queue: &mut PriorityQueue) {
        let mut executor = ScopedCommandsExecutor::new();
        {
            let mut inner = self.inner.lock();
            while let Some((source, key)) = queue.pop_entry() {
                inner.priority_queue.push(source, key);
            }
            self.ensure_enough_workers_lock_required(&mut inner, &mut executor);
        }
        executor.flush(self);
    }

    /// True if a task with `sort_key` running in this group should return ASAP.  Thread-safe but
    /// may be outdated; an unnecessary yield only costs a reschedule.
    pub(crate) fn should_yield(&self, sort_key: TaskSourceSortKey) -> bool {
        if !self.task_tracker.can_run_priority(sort_key.priority()) {
            return true;
        }
        let packed = self.min_allowed_sort_key.load(Ordering::Relaxed);
        if packed == YIELD_KEY_NONE {
            return false;
        }
        let (allowed_priority, allowed_worker_count) = unpack_yield_key(packed);
        if sort_key.priority() > allowed_priority
            || (sort_key.priority() == allowed_priority
                && sort_key.worker_count() <= allowed_worker_count)
        {
            return false;
        }
        // Reset so that a single yield suffices for the waiting source.
        let _ = self.min_allowed_sort_key.compare_exchange(
            packed,
            YIELD_KEY_NONE,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        true
    }

    /// Wakes workers as appropriate after a CanRunPolicy change.
    pub(crate) fn did_update_can_run_policy(&self) {
        let mut executor = ScopedCommandsExecutor::new();
        {
            let mut inner = self.inner.lock();
            self.ensure_enough_workers_lock_required(&mut inner, &mut executor);
        }
        executor.flush(self);
    }

    /// Raises `max_tasks` to cover in-flight ContinueOnShutdown tasks so BlockShutdown work is
    /// not starved during shutdown.  Each adjustment is reverted when its task completes.
    pub(crate) fn on_shutdown_started(&self) {
        let mut executor = ScopedCommandsExecutor::new();
        {
            let mut inner = self.inner.lock();
            if inner.max_tasks == 0 || inner.shutdown_started {
                // Never started, or already notified.
                return;
            }
            for index in 0..inner.workers.len() {
                if inner.workers[index].current_shutdown_behavior
                    != Some(TaskShutdownBehavior::ContinueOnShutdown)
                {
                    continue;
                }
                inner.workers[index].incremented_max_tasks_for_shutdown = true;
                inner.increment_max_tasks_for_worker(index);
            }
            inner.shutdown_started = true;
            self.ensure_enough_workers_lock_required(&mut inner, &mut executor);
        }
        executor.flush(self);
    }

    /// Sets a new baseline concurrency, preserving outstanding blocking-scope adjustments.
    pub(crate) fn set_max_tasks(&self, max_tasks: usize) {
        let mut executor = ScopedCommandsExecutor::new();
        {
            let mut inner = self.inner.lock();
            if inner.max_tasks == 0 {
                return;
            }
            let blocked_adjustment = inner.max_tasks - inner.baseline_max_tasks;
            inner.baseline_max_tasks = max_tasks.min(MAX_NUMBER_OF_WORKERS);
            inner.max_tasks =
                (inner.baseline_max_tasks + blocked_adjustment).min(MAX_NUMBER_OF_WORKERS);
            self.ensure_enough_workers_lock_required(&mut inner, &mut executor);
        }
        executor.flush(self);
    }

    pub(crate) fn reset_max_tasks(&self) {
        self.set_max_tasks(self.after_start().initial_max_tasks);
    }

    /// Service-thread callback: resolves MayBlock scopes older than the threshold into max-tasks
    /// increases, then reschedules itself while needed.
    pub(crate) fn adjust_max_tasks(&self) {
        let now = Instant::now();
        let threshold = self.after_start().may_block_threshold;
        let mut executor = ScopedCommandsExecutor::new();
        {
            let mut inner = self.inner.lock();
            debug_assert!(inner.adjust_max_tasks_posted);
            inner.adjust_max_tasks_posted = false;
            for index in 0..inner.workers.len() {
                let blocked_long_enough = inner.workers[index]
                    .blocking_start_time
                    .is_some_and(|start| now.duration_since(start) >= threshold);
                if blocked_long_enough {
                    inner.increment_max_tasks_for_worker(index);
                }
            }
            self.ensure_enough_workers_lock_required(&mut inner, &mut executor);
        }
        executor.flush(self);
    }

    /// Wakes every worker and joins the underlying threads.  Queued sources are flushed.
    pub(crate) fn join_for_testing(&self) {
        let workers_copy: Vec<Arc<WorkerThread>>;
        {
            let mut inner = self.inner.lock();
            inner
                .priority_queue
                .enable_flush_task_sources_on_destroy_for_testing();
            assert!(!inner.join_called_for_testing, "joined twice");
            inner.join_called_for_testing = true;
            inner.worker_cleanup_disallowed_for_testing = true;
            workers_copy = inner.workers.iter().map(|state| state.worker.clone()).collect();
        }
        for worker in &workers_copy {
            worker.join_for_testing();
        }
        let flushed_queue = {
            let mut inner = self.inner.lock();
            inner.workers.clear();
            inner.idle_workers.ids.clear();
            std::mem::take(&mut inner.priority_queue)
        };
        // Dropped outside the lock: flushing clears sources (their own locks) and may release
        // task-runner backrefs that reach into other components.
        drop(flushed_queue);
    }

    pub(crate) fn max_tasks_for_testing(&self) -> usize {
        self.inner.lock().max_tasks
    }

    pub(crate) fn max_best_effort_tasks_for_testing(&self) -> usize {
        self.inner.lock().max_best_effort_tasks
    }

    pub(crate) fn num_workers_for_testing(&self) -> usize {
        self.inner.lock().workers.len()
    }

    pub(crate) fn num_queued_task_sources_for_testing(&self) -> usize {
        self.inner.lock().priority_queue.len()
    }

    #[cfg(test)]
    pub(crate) fn workers_for_testing(&self) -> Vec<Arc<WorkerThread>> {
        self.inner
            .lock()
            .workers
            .iter()
            .map(|state| state.worker.clone())
            .collect()
    }

    pub(crate) fn num_idle_workers_for_testing(&self) -> usize {
        self.inner.lock().idle_workers.len()
    }

    pub(crate) fn num_unnecessary_wakeups_for_testing(&self) -> usize {
        self.num_unnecessary_wakeups_for_testing.load(Ordering::Relaxed)
    }

    pub(crate) fn wait_for_workers_idle_for_testing(&self, n: usize) {
        let mut inner = self.inner.lock();
        while inner.idle_workers.len() < n {
            inner = self.idle_workers_cv_for_testing.wait(inner);
        }
    }

    pub(crate) fn wait_for_workers_cleaned_up_for_testing(&self, n: usize) {
        let mut inner = self.inner.lock();
        while inner.num_workers_cleaned_up_for_testing < n {
            inner = self.cleaned_up_cv_for_testing.wait(inner);
        }
        inner.num_workers_cleaned_up_for_testing -= n;
    }

    pub(crate) fn may_block_threshold_for_testing(&self) -> Duration {
        self.after_start().may_block_threshold
    }

    fn resolve_destination(&self, traits: TaskTraits) -> Option<Arc<ThreadGroup>> {
        self.delegate.get()?.upgrade().map(|delegate| delegate.thread_group_for_traits(traits))
    }

    // ---- lock-required internals ----

    fn ensure_enough_workers_lock_required(
        &self,
        inner: &mut ThreadGroupInner,
        executor: &mut ScopedCommandsExecutor,
    ) {
        if inner.max_tasks == 0 || inner.join_called_for_testing {
            return;
        }
        let desired_num_awake_workers = self.get_desired_num_awake_workers_lock_required(inner);
        let num_awake_workers = inner.num_awake_workers();

        let num_workers_to_wake_up = desired_num_awake_workers
            .saturating_sub(num_awake_workers)
            .min(self.after_start().max_num_workers_created);
        for _ in 0..num_workers_to_wake_up {
            self.maintain_at_least_one_idle_worker_lock_required(inner, executor);
            let Some(id) = inner.idle_workers.take_front() else {
                break;
            };
            let index = inner.worker_index_by_id(id).unwrap();
            inner.workers[index].worker.end_unused_period();
            executor.schedule_wake_up(inner.workers[index].worker.clone());
        }

        // When no worker was woken (e.g. called from the last awake worker), keep one idle worker
        // in reserve so the next post wakes someone instantly.
        if desired_num_awake_workers == num_awake_workers {
            self.maintain_at_least_one_idle_worker_lock_required(inner, executor);
        }

        self.update_min_allowed_priority_lock_required(inner);
        self.maybe_schedule_adjust_max_tasks_lock_required(inner, executor);
    }

    fn maintain_at_least_one_idle_worker_lock_required(
        &self,
        inner: &mut ThreadGroupInner,
        executor: &mut ScopedCommandsExecutor,
    ) {
        if !inner.idle_workers.is_empty() {
            return;
        }
        self.create_and_register_worker_lock_required(inner, executor);
    }

    fn create_and_register_worker_lock_required(
        &self,
        inner: &mut ThreadGroupInner,
        executor: &mut ScopedCommandsExecutor,
    ) {
        if inner.workers.len() >= MAX_NUMBER_OF_WORKERS || inner.workers.len() >= inner.max_tasks {
            return;
        }
        debug_assert!(!inner.join_called_for_testing);
        let after_start = self.after_start();
        let id = inner.worker_sequence_num;
        inner.worker_sequence_num += 1;
        let is_excess = if after_start.no_worker_reclaim {
            inner.workers.len() >= after_start.initial_max_tasks
        } else {
            true
        };
        let delegate = GroupWorkerDelegate::new(self.self_weak.clone(), id, is_excess);
        let worker = WorkerThread::new(
            self.thread_type_hint,
            delegate,
            self.task_tracker.clone(),
            id,
        );
        worker.begin_unused_period(Instant::now());
        inner.workers.push(WorkerState::new(worker.clone()));
        inner.idle_workers.insert_front(id);
        let thread_name = format!("foreman-{}-{}", self.label, id);
        executor.schedule_start(worker, thread_name);
    }

    fn get_num_additional_workers_for_best_effort_lock_required(
        &self,
        inner: &ThreadGroupInner,
    ) -> usize {
        let num_queued = inner
            .priority_queue
            .num_task_sources_with_priority(TaskPriority::BestEffort);
        if num_queued == 0 || !self.task_tracker.can_run_priority(TaskPriority::BestEffort) {
            return 0;
        }
        match inner.priority_queue.peek_sort_key() {
            Some(key) if key.priority() == TaskPriority::BestEffort => {
                let peek = inner.priority_queue.peek_task_source().unwrap();
                peek.source().remaining_concurrency().max(1)
            }
            _ => 1,
        }
    }

    fn get_num_additional_workers_for_foreground_lock_required(
        &self,
        inner: &ThreadGroupInner,
    ) -> usize {
        let num_queued = inner
            .priority_queue
            .num_task_sources_with_priority(TaskPriority::UserVisible)
            + inner
                .priority_queue
                .num_task_sources_with_priority(TaskPriority::UserBlocking);
        if num_queued == 0 || !self.task_tracker.can_run_priority(TaskPriority::UserVisible) {
            return 0;
        }
        match inner.priority_queue.peek_sort_key() {
            Some(key) if key.priority() > TaskPriority::BestEffort => {
                let peek = inner.priority_queue.peek_task_source().unwrap();
                peek.source().remaining_concurrency().max(1)
            }
            _ => 1,
        }
    }

    fn get_desired_num_awake_workers_lock_required(&self, inner: &ThreadGroupInner) -> usize {
        let num_running_or_queued_best_effort = inner.num_running_best_effort_tasks
            + self.get_num_additional_workers_for_best_effort_lock_required(inner);
        let workers_for_best_effort = num_running_or_queued_best_effort
            .min(inner.max_best_effort_tasks)
            .max(inner.num_running_best_effort_tasks);

        let workers_for_foreground =
            (inner.num_running_tasks - inner.num_running_best_effort_tasks)
                + self.get_num_additional_workers_for_foreground_lock_required(inner);

        (workers_for_best_effort + workers_for_foreground)
            .min(inner.max_tasks)
            .min(MAX_NUMBER_OF_WORKERS)
    }

    fn update_min_allowed_priority_lock_required(&self, inner: &ThreadGroupInner) {
        let packed = match inner.priority_queue.peek_sort_key() {
            Some(key) if inner.num_running_tasks >= inner.max_tasks => {
                pack_yield_key(key.priority(), key.worker_count())
            }
            _ => YIELD_KEY_NONE,
        };
        self.min_allowed_sort_key.store(packed, Ordering::Relaxed);
    }

    fn should_periodically_adjust_max_tasks_lock_required(&self, inner: &ThreadGroupInner) -> bool {
        // Polling is useful iff the current limits are saturated *and* there are unresolved
        // MayBlock scopes whose resolution would raise them.
        let num_running_or_queued_best_effort = inner.num_running_best_effort_tasks
            + self.get_num_additional_workers_for_best_effort_lock_required(inner);
        if num_running_or_queued_best_effort > inner.max_best_effort_tasks
            && inner.num_unresolved_best_effort_may_block > 0
        {
            return true;
        }
        let num_running_or_queued = inner.num_running_tasks
            + self.get_num_additional_workers_for_best_effort_lock_required(inner)
            + self.get_num_additional_workers_for_foreground_lock_required(inner);
        num_running_or_queued + 1 > inner.max_tasks && inner.num_unresolved_may_block > 0
    }

    fn maybe_schedule_adjust_max_tasks_lock_required(
        &self,
        inner: &mut ThreadGroupInner,
        executor: &mut ScopedCommandsExecutor,
    ) {
        if !inner.adjust_max_tasks_posted
            && self.should_periodically_adjust_max_tasks_lock_required(inner)
        {
            inner.adjust_max_tasks_posted = true;
            executor.must_schedule_adjust_max_tasks = true;
        }
    }

    /// Pops the top source if it may run, reserving its run slot.  Returns `None` (after popping
    /// an unrunnable source, or registering nothing) when the caller should retry or give up.
    fn take_registered_task_source_lock_required(
        &self,
        inner: &mut ThreadGroupInner,
        executor: &mut ScopedCommandsExecutor,
    ) -> Option<RegisteredTaskSource> {
        let intent = inner
            .priority_queue
            .peek_task_source()
            .unwrap()
            .source()
            .will_run_task();
        match intent {
            RunIntent::Disallowed => {
                // Canceled or saturated behind our back: drop it from the queue; the release
                // (which may recurse into the tracker) happens outside the lock.
                let task_source = inner.priority_queue.pop_task_source().unwrap();
                executor.schedule_release_task_source(task_source);
                None
            }
            RunIntent::AllowedSaturated => inner.priority_queue.pop_task_source(),
            RunIntent::AllowedNotSaturated => {
                // The source stays queued for other workers; its worker count changed, so re-key
                // it and hand this worker its own registration.
                let source = inner.priority_queue.peek_task_source().unwrap().source().clone();
                let sort_key = source.sort_key();
                inner.priority_queue.update_sort_key(source.as_ref(), sort_key);
                match self.task_tracker.register_task_source(source.clone()) {
                    Some(registered) => Some(registered),
                    None => {
                        // Shutdown raced the registration: release the reserved slot and retire
                        // the source.
                        source.did_process_task();
                        if let Some(task_source) = inner.priority_queue.pop_task_source() {
                            executor.schedule_release_task_source(task_source);
                        }
                        None
                    }
                }
            }
        }
    }

    fn can_get_work_lock_required(
        &self,
        inner: &mut ThreadGroupInner,
        delegate: &GroupWorkerDelegate,
        worker: &Arc<WorkerThread>,
    ) -> bool {
        if inner.idle_workers.contains(delegate.worker_id) {
            // Woke by timeout (or spuriously) while idle: consider self-reclaim.
            if delegate.is_excess && self.can_cleanup_lock_required(inner, worker) {
                self.cleanup_worker_lock_required(inner, delegate.worker_id, worker);
            }
            return false;
        }
        if inner.num_awake_workers() > inner.max_tasks {
            // Excess awake workers (max_tasks just shrank): stand down until the limit recovers.
            self.worker_becomes_idle_lock_required(inner, delegate.worker_id, worker);
            return false;
        }
        true
    }

    fn can_cleanup_lock_required(
        &self,
        inner: &ThreadGroupInner,
        worker: &Arc<WorkerThread>,
    ) -> bool {
        if inner.worker_cleanup_disallowed_for_testing {
            return false;
        }
        worker
            .last_used_time()
            .is_some_and(|t| t.elapsed() >= self.after_start().suggested_reclaim_time)
    }

    fn cleanup_worker_lock_required(
        &self,
        inner: &mut ThreadGroupInner,
        worker_id: usize,
        worker: &Arc<WorkerThread>,
    ) {
        debug_assert!(!inner.join_called_for_testing);
        log::debug!("reclaiming idle worker {} in group {}", worker_id, self.label);
        worker.cleanup();
        inner.idle_workers.remove(worker_id);
        if let Some(index) = inner.worker_index_by_id(worker_id) {
            inner.workers.swap_remove(index);
        }
    }

    fn worker_becomes_idle_lock_required(
        &self,
        inner: &mut ThreadGroupInner,
        worker_id: usize,
        worker: &Arc<WorkerThread>,
    ) {
        debug_assert!(!inner.idle_workers.contains(worker_id));
        inner.idle_workers.insert_front(worker_id);
        worker.begin_unused_period(Instant::now());
        self.idle_workers_cv_for_testing.notify_all();
        if inner.priority_queue.is_empty() && inner.num_running_tasks == 0 {
            // The whole group is quiet; publish the idleness (release) so a sync-work authorizer
            // sees the memory written by the tasks that ran.
            self.work_tracker.on_idle();
        }
    }

    fn get_work_lock_required(
        &self,
        inner: &mut ThreadGroupInner,
        executor: &mut ScopedCommandsExecutor,
        delegate: &GroupWorkerDelegate,
        worker: &Arc<WorkerThread>,
    ) -> Option<RegisteredTaskSource> {
        if inner.join_called_for_testing {
            return None;
        }
        // Use the opportunity to create or wake additional workers if the queue calls for it;
        // doing it here keeps the expensive part off the post path.
        self.ensure_enough_workers_lock_required(inner, executor);
        if !self.can_get_work_lock_required(inner, delegate, worker) {
            // A spurious wake cleared the idle bit on entry; republish it if the group is in
            // fact quiet, or sync-work authorizations would stay ungrantable.
            if inner.priority_queue.is_empty() && inner.num_running_tasks == 0 {
                self.work_tracker.on_idle();
            }
            return None;
        }

        let mut selected: Option<(RegisteredTaskSource, TaskPriority)> = None;
        while selected.is_none() && !inner.priority_queue.is_empty() {
            let key = inner.priority_queue.peek_sort_key().unwrap();
            let priority = key.priority();
            if !self.task_tracker.can_run_priority(priority) {
                break;
            }
            if priority == TaskPriority::BestEffort
                && inner.num_running_best_effort_tasks >= inner.max_best_effort_tasks
            {
                break;
            }
            selected = self
                .take_registered_task_source_lock_required(inner, executor)
                .map(|source| (source, priority));
        }

        match selected {
            None => {
                self.worker_becomes_idle_lock_required(inner, delegate.worker_id, worker);
                None
            }
            Some((task_source, priority)) => {
                inner.increment_tasks_running(priority);
                let index = inner.worker_index_by_id(delegate.worker_id).unwrap();
                inner.workers[index].current_task_priority = Some(priority);
                inner.workers[index].current_shutdown_behavior =
                    Some(task_source.source().shutdown_behavior());
                self.update_min_allowed_priority_lock_required(inner);
                Some(task_source)
            }
        }
    }

    fn lock_inner(&self) -> CheckedLockGuard<'_, ThreadGroupInner> {
        self.inner.lock()
    }
}

/// Per-worker delegate binding a [`WorkerThread`] to its group.  Also the worker's
/// [`BlockingObserver`].
pub(crate) struct GroupWorkerDelegate {
    outer: Weak<ThreadGroup>,
    worker_id: usize,
    /// Whether this worker may reclaim itself after an idle period.  Decided at creation time.
    is_excess: bool,
    wake_event: WaitableEvent,
    self_weak: Weak<GroupWorkerDelegate>,
}

impl GroupWorkerDelegate {
    fn new(outer: Weak<ThreadGroup>, worker_id: usize, is_excess: bool) -> Arc<GroupWorkerDelegate> {
        Arc::new_cyclic(|self_weak| GroupWorkerDelegate {
            outer,
            worker_id,
            is_excess,
            wake_event: WaitableEvent::new(ResetPolicy::Automatic),
            self_weak: self_weak.clone(),
        })
    }

    fn worker_index<'a>(&self, inner: &'a mut ThreadGroupInner) -> Option<usize> {
        inner.worker_index_by_id(self.worker_id)
    }
}

impl WorkerDelegate for GroupWorkerDelegate {
    fn on_main_entry(&self, _worker: &Arc<WorkerThread>) {
        if let Some(this) = self.self_weak.upgrade() {
            set_blocking_observer_for_current_thread(this);
        }
    }

    fn get_work(&self, worker: &Arc<WorkerThread>) -> Option<RegisteredTaskSource> {
        let Some(outer) = self.outer.upgrade() else {
            worker.cleanup();
            return None;
        };
        outer.work_tracker.will_reload_immediate_work_queues();
        let mut executor = ScopedCommandsExecutor::new();
        let task_source = {
            let mut inner = outer.lock_inner();
            outer.get_work_lock_required(&mut inner, &mut executor, self, worker)
        };
        executor.flush(&outer);
        if task_source.is_some() {
            // Barrier against inline sync work: runs outside the group lock because it may park.
            outer.work_tracker.on_begin_work();
        }
        task_source
    }

    fn swap_processed_task(
        &self,
        processed: Option<RegisteredTaskSource>,
        worker: &Arc<WorkerThread>,
    ) -> Option<RegisteredTaskSource> {
        let Some(outer) = self.outer.upgrade() else {
            worker.cleanup();
            return None;
        };

        // Stamp readiness and decide the destination group before taking any group lock: the
        // source lock is the universal predecessor and must come first.
        let reenqueue = processed.map(|task_source| {
            task_source.source().will_reenqueue(Instant::now());
            let sort_key = task_source.source().sort_key();
            let destination = outer.resolve_destination(task_source.source().traits());
            (task_source, sort_key, destination)
        });

        let mut executor = ScopedCommandsExecutor::new();
        let mut deferred_push: Option<(RegisteredTaskSource, Arc<ThreadGroup>)> = None;
        let next = {
            let mut inner = outer.lock_inner();
            let index = self
                .worker_index(&mut inner)
                .expect("worker unregistered while processing a task");

            if inner.workers[index].incremented_max_tasks_for_shutdown {
                debug_assert!(inner.shutdown_started);
                inner.workers[index].incremented_max_tasks_for_shutdown = false;
                inner.max_tasks -= 1;
                if inner.workers[index].current_task_priority == Some(TaskPriority::BestEffort) {
                    inner.max_best_effort_tasks -= 1;
                }
                inner.workers[index].incremented_max_tasks_since_blocked = false;
                inner.workers[index].incremented_max_best_effort_tasks_since_blocked = false;
            }
            debug_assert!(inner.workers[index].blocking_start_time.is_none());

            let priority = inner.workers[index]
                .current_task_priority
                .take()
                .expect("swap_processed_task without a current task");
            inner.workers[index].current_shutdown_behavior = None;
            inner.decrement_tasks_running(priority);

            if let Some((task_source, sort_key, destination)) = reenqueue {
                match destination {
                    Some(destination) if destination.id != outer.id => {
                        // Traits now route elsewhere; push after all of our locks are released.
                        deferred_push = Some((task_source, destination));
                    }
                    _ => {
                        outer.work_tracker.will_request_reload_immediate_work_queue();
                        inner.priority_queue.push(task_source, sort_key);
                        outer.ensure_enough_workers_lock_required(&mut inner, &mut executor);
                    }
                }
            }

            outer.get_work_lock_required(&mut inner, &mut executor, self, worker)
        };
        executor.flush(&outer);
        if let Some((task_source, destination)) = deferred_push {
            destination.push_task_source_and_wake_up_workers(task_source);
        }
        if next.is_some() {
            outer.work_tracker.on_begin_work();
        }
        next
    }

    fn sleep_timeout(&self) -> Option<Duration> {
        if !self.is_excess {
            return None;
        }
        let outer = self.outer.upgrade()?;
        // Sleep 10% over the reclaim time so that a periodic workload whose period matches the
        // reclaim time doesn't see its standby worker destroyed and recreated on every beat.
        Some(outer.after_start().suggested_reclaim_time.mul_f32(1.1))
    }

    fn wake_event(&self) -> &WaitableEvent {
        &self.wake_event
    }

    fn on_main_exit(&self, _worker: &Arc<WorkerThread>) {
        clear_blocking_observer_for_current_thread();
        if let Some(outer) = self.outer.upgrade() {
            let mut inner = outer.lock_inner();
            inner.num_workers_cleaned_up_for_testing += 1;
            outer.cleaned_up_cv_for_testing.notify_all();
        }
    }

    fn record_unnecessary_wakeup(&self) {
        if let Some(outer) = self.outer.upgrade() {
            log::trace!("unnecessary wakeup of worker {} in group {}", self.worker_id, outer.label);
            outer
                .num_unnecessary_wakeups_for_testing
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl BlockingObserver for GroupWorkerDelegate {
    fn blocking_started(&self, blocking_type: BlockingType) {
        let Some(outer) = self.outer.upgrade() else {
            return;
        };
        let mut executor = ScopedCommandsExecutor::new();
        {
            let mut inner = outer.lock_inner();
            let Some(index) = inner.worker_index_by_id(self.worker_id) else {
                return;
            };
            // A blocking scope outside of a task (e.g. in delegate code) is not compensated.
            let Some(priority) = inner.workers[index].current_task_priority else {
                return;
            };
            debug_assert!(!inner.workers[index].incremented_max_tasks_since_blocked);
            debug_assert!(inner.workers[index].blocking_start_time.is_none());
            inner.workers[index].blocking_start_time = Some(Instant::now());

            if inner.workers[index].incremented_max_tasks_for_shutdown {
                // Already compensated for the whole remaining run of this task.
                return;
            }

            match blocking_type {
                BlockingType::WillBlock => {
                    inner.increment_max_tasks_for_worker(index);
                    outer.ensure_enough_workers_lock_required(&mut inner, &mut executor);
                }
                BlockingType::MayBlock => {
                    inner.workers[index].may_block_pending = true;
                    inner.num_unresolved_may_block += 1;
                    if priority == TaskPriority::BestEffort {
                        inner.workers[index].best_effort_may_block_pending = true;
                        inner.num_unresolved_best_effort_may_block += 1;
                    }
                }
            }
            outer.maybe_schedule_adjust_max_tasks_lock_required(&mut inner, &mut executor);
        }
        executor.flush(&outer);
    }

    fn blocking_type_upgraded(&self) {
        let Some(outer) = self.outer.upgrade() else {
            return;
        };
        let mut executor = ScopedCommandsExecutor::new();
        {
            let mut inner = outer.lock_inner();
            let Some(index) = inner.worker_index_by_id(self.worker_id) else {
                return;
            };
            if inner.workers[index].current_task_priority.is_none()
                || inner.workers[index].incremented_max_tasks_since_blocked
                || inner.workers[index].incremented_max_tasks_for_shutdown
            {
                return;
            }
            inner.increment_max_tasks_for_worker(index);
            outer.ensure_enough_workers_lock_required(&mut inner, &mut executor);
        }
        executor.flush(&outer);
    }

    fn blocking_ended(&self) {
        let Some(outer) = self.outer.upgrade() else {
            return;
        };
        let mut inner = outer.lock_inner();
        let Some(index) = inner.worker_index_by_id(self.worker_id) else {
            return;
        };
        if inner.workers[index].current_task_priority.is_none() {
            return;
        }
        debug_assert!(inner.workers[index].blocking_start_time.is_some());
        inner.workers[index].blocking_start_time = None;
        if !inner.workers[index].incremented_max_tasks_for_shutdown {
            if inner.workers[index].incremented_max_tasks_since_blocked {
                inner.max_tasks -= 1;
            } else if inner.workers[index].may_block_pending {
                inner.workers[index].may_block_pending = false;
                debug_assert!(inner.num_unresolved_may_block > 0);
                inner.num_unresolved_may_block -= 1;
            }
            if inner.workers[index].incremented_max_best_effort_tasks_since_blocked {
                inner.max_best_effort_tasks -= 1;
            } else if inner.workers[index].best_effort_may_block_pending {
                inner.workers[index].best_effort_may_block_pending = false;
                debug_assert!(inner.num_unresolved_best_effort_may_block > 0);
                inner.num_unresolved_best_effort_may_block -= 1;
            }
        }
        inner.workers[index].incremented_max_tasks_since_blocked = false;
        inner.workers[index].incremented_max_best_effort_tasks_since_blocked = false;
        // min_allowed_sort_key depends on max_tasks.
        outer.update_min_allowed_priority_lock_required(&inner);
    }
}

#[cfg(test)]
mod tests;
