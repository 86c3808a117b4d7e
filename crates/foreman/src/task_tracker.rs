//! The process-wide admission gate.
//!
//! The tracker decides whether a task may be *posted* (given its shutdown behavior and the
//! current shutdown phase), whether a task source may be *queued*, whether a given priority may
//! currently *start running* (fences), and it owns the multi-phase shutdown protocol plus the
//! flush primitive used by tests to wait for quiescence.
//!
//! Shutdown state is a single atomic word: bit 0 is "shutdown started" and the remaining bits
//! count the items currently blocking shutdown (queued-or-running BlockShutdown work, plus
//! already-running SkipOnShutdown tasks).  Packing both into one word is what makes "post a
//! BlockShutdown task at the same instant shutdown starts" well-defined: the increment and the
//! started-bit check are one atomic operation.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use pool_synchronization::{CheckedCondvar, CheckedLock, ResetPolicy, WaitableEvent};

use crate::execution_environment::ScopedTaskEnvironment;
use crate::task::Task;
use crate::task_source::{RegisteredTaskSource, TaskSource};
use crate::task_traits::{TaskPriority, TaskShutdownBehavior, TaskTraits};

/// Which priorities may currently begin execution.  Derived from fences and shutdown by the pool
/// owner.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum CanRunPolicy {
    All,
    ForegroundOnly,
    None,
}

/// Bit 0: shutdown has started.  Bits 1..: number of items blocking shutdown.
struct State(AtomicUsize);

const SHUTDOWN_STARTED_MASK: usize = 1;
const ITEMS_ONE: usize = 2;

impl State {
    fn new() -> State {
        State(AtomicUsize::new(0))
    }

    fn has_shutdown_started(&self) -> bool {
        self.0.load(Ordering::Relaxed) & SHUTDOWN_STARTED_MASK != 0
    }

    fn are_items_blocking_shutdown(&self) -> bool {
        self.0.load(Ordering::Relaxed) >= ITEMS_ONE
    }

    /// Flips the started bit.  Returns true iff items are currently blocking shutdown.
    fn start_shutdown(&self) -> bool {
        let prev = self.0.fetch_or(SHUTDOWN_STARTED_MASK, Ordering::AcqRel);
        assert_eq!(
            prev & SHUTDOWN_STARTED_MASK,
            0,
            "shutdown can only be started once"
        );
        prev >= ITEMS_ONE
    }

    /// Returns whether shutdown had already started at the time of the increment.
    fn increment_num_items_blocking_shutdown(&self) -> bool {
        let prev = self.0.fetch_add(ITEMS_ONE, Ordering::AcqRel);
        prev & SHUTDOWN_STARTED_MASK != 0
    }

    /// Returns (shutdown started, count reached zero).
    fn decrement_num_items_blocking_shutdown(&self) -> (bool, bool) {
        let prev = self.0.fetch_sub(ITEMS_ONE, Ordering::AcqRel);
        assert!(prev >= ITEMS_ONE, "item count underflow");
        let started = prev & SHUTDOWN_STARTED_MASK != 0;
        (started, prev - ITEMS_ONE < ITEMS_ONE)
    }
}

struct FlushState {
    /// At most one async flush may be outstanding.
    flush_callback_for_testing: Option<Box<dyn FnOnce() + Send>>,
}

struct ShutdownState {
    /// Instantiated when shutdown starts, signaled when the last blocking item completes.
    shutdown_event: Option<Arc<WaitableEvent>>,
    complete_called: bool,
}

pub(crate) struct TaskTracker {
    self_weak: std::sync::Weak<TaskTracker>,
    state: State,
    /// Task sources that haven't completed their execution.  Decremented with release semantics
    /// after the last task of a source runs and read with acquire semantics by flushers, so
    /// memory written by flushed tasks is visible when a flush returns.
    num_incomplete_task_sources: AtomicUsize,
    can_run_policy: AtomicU8,
    /// Set when the blocking-item count reaches zero after shutdown started.  Lock-free because
    /// admission checks run under foreign locks.
    shutdown_complete: AtomicBool,
    flush_lock: CheckedLock<FlushState>,
    flush_cv: CheckedCondvar,
    shutdown_lock: CheckedLock<ShutdownState>,
    sequence_nums: AtomicU64,
}

impl TaskTracker {
    pub(crate) fn new() -> Arc<TaskTracker> {
        Arc::new_cyclic(|self_weak| TaskTracker {
            self_weak: self_weak.clone(),
            state: State::new(),
            num_incomplete_task_sources: AtomicUsize::new(0),
            can_run_policy: AtomicU8::new(CanRunPolicy::All as u8),
            shutdown_complete: AtomicBool::new(false),
            flush_lock: CheckedLock::new(FlushState {
                flush_callback_for_testing: None,
            }),
            flush_cv: CheckedCondvar::new(),
            shutdown_lock: CheckedLock::new(ShutdownState {
                shutdown_event: None,
                complete_called: false,
            }),
            sequence_nums: AtomicU64::new(0),
        })
    }

    /// Initiates shutdown.  From here on, only BlockShutdown work is admitted (and
    /// ContinueOnShutdown posts, which never run once shutdown has started).  Single-shot.
    pub(crate) fn start_shutdown(&self) {
        let event = Arc::new(WaitableEvent::new(ResetPolicy::Manual));
        let mut shutdown = self.shutdown_lock.lock();
        assert!(
            shutdown.shutdown_event.is_none(),
            "shutdown can only be started once"
        );
        shutdown.shutdown_event = Some(event.clone());
        // The event must be installed before the started bit flips, so that any decrementer that
        // observes the bit finds the event.
        let items_blocking = self.state.start_shutdown();
        if !items_blocking {
            event.signal();
            self.shutdown_complete.store(true, Ordering::Release);
        }
        log::info!("thread pool shutdown started");
    }

    /// Blocks until no item blocks shutdown anymore.  Single-shot; `start_shutdown` must have
    /// been called.
    pub(crate) fn complete_shutdown(&self) {
        let event = {
            let mut shutdown = self.shutdown_lock.lock();
            assert!(
                !shutdown.complete_called,
                "shutdown can only be completed once"
            );
            shutdown.complete_called = true;
            shutdown
                .shutdown_event
                .clone()
                .expect("start_shutdown must be called before complete_shutdown")
        };
        log::debug!(
            "completing shutdown; items currently blocking: {}",
            self.state.are_items_blocking_shutdown()
        );
        event.wait();
        debug_assert!(self.shutdown_complete.load(Ordering::Relaxed));
        // Unblock flushes: they return immediately once shutdown completes.
        let callback = {
            let mut flush = self.flush_lock.lock();
            let callback = flush.flush_callback_for_testing.take();
            self.flush_cv.notify_all();
            callback
        };
        if let Some(callback) = callback {
            callback();
        }
        log::info!("thread pool shutdown complete");
    }

    pub(crate) fn has_shutdown_started(&self) -> bool {
        self.state.has_shutdown_started()
    }

    pub(crate) fn is_shutdown_complete(&self) -> bool {
        self.shutdown_complete.load(Ordering::Acquire)
    }

    /// Waits until there are no incomplete task sources.  Returns immediately once shutdown is
    /// complete.
    pub(crate) fn flush_for_testing(&self) {
        let mut guard = self.flush_lock.lock();
        while self.num_incomplete_task_sources.load(Ordering::Acquire) != 0
            && !self.is_shutdown_complete()
        {
            guard = self.flush_cv.wait(guard);
        }
    }

    /// Invokes `callback` (from any thread) once there are no incomplete task sources.  Only one
    /// async flush may be outstanding.
    pub(crate) fn flush_async_for_testing(&self, callback: Box<dyn FnOnce() + Send>) {
        let mut callback = Some(callback);
        {
            let mut flush = self.flush_lock.lock();
            if self.num_incomplete_task_sources.load(Ordering::Acquire) != 0
                && !self.is_shutdown_complete()
            {
                assert!(
                    flush.flush_callback_for_testing.is_none(),
                    "only one FlushAsyncForTesting may be pending at any given time"
                );
                flush.flush_callback_for_testing = callback.take();
            }
        }
        if let Some(callback) = callback {
            callback();
        }
    }

    pub(crate) fn set_can_run_policy(&self, policy: CanRunPolicy) {
        log::debug!("can-run policy set to {policy:?}");
        self.can_run_policy.store(policy as u8, Ordering::Relaxed);
    }

    pub(crate) fn can_run_priority(&self, priority: TaskPriority) -> bool {
        match self.can_run_policy.load(Ordering::Relaxed) {
            p if p == CanRunPolicy::All as u8 => true,
            p if p == CanRunPolicy::ForegroundOnly as u8 => {
                priority > TaskPriority::BestEffort
            }
            _ => false,
        }
    }

    /// Admits the posting of `task`.  If this returns false the caller must leak the task, since
    /// destroying it on the posting sequence may run sequence-affine code.
    pub(crate) fn will_post_task(
        &self,
        task: &mut Task,
        shutdown_behavior: TaskShutdownBehavior,
    ) -> bool {
        if !self.before_queue_item(shutdown_behavior) {
            return false;
        }
        task.sequence_num = self.sequence_nums.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Orthogonal check applied just before queueing an immediate task: best-effort work is
    /// rejected while a best-effort fence (or the kill switch) holds the policy at
    /// foreground-only.
    pub(crate) fn will_post_task_now(&self, _task: &Task, priority: TaskPriority) -> bool {
        priority != TaskPriority::BestEffort
            || self.can_run_policy.load(Ordering::Relaxed) != CanRunPolicy::ForegroundOnly as u8
    }

    /// Releases the claims taken by a successful `will_post_task` when a later admission stage
    /// rejected the task and it will never be queued.  Without this, a rejected BlockShutdown
    /// post would hold its shutdown-blocking item forever and `complete_shutdown` would never
    /// return.
    pub(crate) fn did_not_post_task(&self, shutdown_behavior: TaskShutdownBehavior) {
        if shutdown_behavior == TaskShutdownBehavior::BlockShutdown {
            self.decrement_num_items_blocking_shutdown();
        }
    }

    /// Admits the queueing of `task_source`, returning the registration token that tracks its
    /// completion.
    pub(crate) fn register_task_source(
        &self,
        task_source: Arc<dyn TaskSource>,
    ) -> Option<RegisteredTaskSource> {
        if !self.before_queue_item(task_source.shutdown_behavior()) {
            return None;
        }
        self.num_incomplete_task_sources
            .fetch_add(1, Ordering::Relaxed);
        let this = self
            .self_weak
            .upgrade()
            .expect("task source registered while the tracker is being destroyed");
        Some(RegisteredTaskSource::new(task_source, this))
    }

    /// Runs the next task of `task_source` unless the shutdown phase prevents it, pops the task
    /// either way, and returns the source iff it should be re-enqueued.
    pub(crate) fn run_and_pop_next_task(
        &self,
        task_source: RegisteredTaskSource,
    ) -> Option<RegisteredTaskSource> {
        let source = task_source.source().clone();
        let shutdown_behavior = source.shutdown_behavior();
        let can_run = self.before_run_task(shutdown_behavior);

        if can_run {
            let traits = source.traits();
            if let Some(task) = source.take_task() {
                self.run_task(task, source.as_ref(), traits);
            }
            self.after_run_task(shutdown_behavior);
        } else {
            // The task will never run: drop the source's remaining work in this environment.
            source.clear();
        }

        if source.did_process_task() {
            Some(task_source)
        } else {
            None
        }
    }

    /// Called by `RegisteredTaskSource` when a source won't be re-enqueued.
    pub(crate) fn unregister_task_source(&self, task_source: &dyn TaskSource) {
        if task_source.shutdown_behavior() == TaskShutdownBehavior::BlockShutdown {
            self.decrement_num_items_blocking_shutdown();
        }
        self.decrement_num_incomplete_task_sources();
    }

    pub(crate) fn has_incomplete_task_sources_for_testing(&self) -> bool {
        self.num_incomplete_task_sources.load(Ordering::Acquire) != 0
    }

    /// Shared admission logic for posting tasks and queueing sources.
    fn before_queue_item(&self, shutdown_behavior: TaskShutdownBehavior) -> bool {
        match shutdown_behavior {
            TaskShutdownBehavior::BlockShutdown => {
                // Increment before checking the phase: an item posted at the same instant
                // shutdown starts is admitted and blocks shutdown.
                let shutdown_started = self.state.increment_num_items_blocking_shutdown();
                if shutdown_started && self.is_shutdown_complete() {
                    self.decrement_num_items_blocking_shutdown();
                    return false;
                }
                true
            }
            TaskShutdownBehavior::SkipOnShutdown => !self.state.has_shutdown_started(),
            TaskShutdownBehavior::ContinueOnShutdown => true,
        }
    }

    /// Returns whether a task with `shutdown_behavior` may start running now.
    fn before_run_task(&self, shutdown_behavior: TaskShutdownBehavior) -> bool {
        match shutdown_behavior {
            TaskShutdownBehavior::BlockShutdown => {
                debug_assert!(self.state.are_items_blocking_shutdown());
                true
            }
            TaskShutdownBehavior::SkipOnShutdown => {
                // A running SkipOnShutdown task blocks shutdown for the duration of its run.
                let shutdown_started = self.state.increment_num_items_blocking_shutdown();
                if shutdown_started {
                    self.decrement_num_items_blocking_shutdown();
                    return false;
                }
                true
            }
            TaskShutdownBehavior::ContinueOnShutdown => !self.state.has_shutdown_started(),
        }
    }

    fn after_run_task(&self, shutdown_behavior: TaskShutdownBehavior) {
        match shutdown_behavior {
            TaskShutdownBehavior::BlockShutdown | TaskShutdownBehavior::SkipOnShutdown => {
                self.decrement_num_items_blocking_shutdown();
            }
            TaskShutdownBehavior::ContinueOnShutdown => {}
        }
    }

    fn decrement_num_items_blocking_shutdown(&self) {
        let (shutdown_started, reached_zero) =
            self.state.decrement_num_items_blocking_shutdown();
        if !shutdown_started || !reached_zero {
            return;
        }
        let event = self.shutdown_lock.lock().shutdown_event.clone();
        if let Some(event) = event {
            self.shutdown_complete.store(true, Ordering::Release);
            event.signal();
        }
    }

    fn decrement_num_incomplete_task_sources(&self) {
        let prev = self
            .num_incomplete_task_sources
            .fetch_sub(1, Ordering::AcqRel);
        assert!(prev >= 1, "incomplete task source count underflow");
        if prev == 1 {
            let callback = {
                let mut flush = self.flush_lock.lock();
                let callback = flush.flush_callback_for_testing.take();
                self.flush_cv.notify_all();
                callback
            };
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    /// Runs `task` with its execution environment installed.  One distinguishable stack frame per
    /// shutdown behavior, so the behavior of the running task is readable in any stack trace.
    fn run_task(&self, task: Task, source: &dyn TaskSource, traits: TaskTraits) {
        let _environment =
            ScopedTaskEnvironment::new(source.execution_environment(), traits.priority);
        match source.shutdown_behavior() {
            TaskShutdownBehavior::ContinueOnShutdown => self.run_continue_on_shutdown(task),
            TaskShutdownBehavior::SkipOnShutdown => self.run_skip_on_shutdown(task),
            TaskShutdownBehavior::BlockShutdown => self.run_block_shutdown(task),
        }
    }

    #[inline(never)]
    fn run_continue_on_shutdown(&self, task: Task) {
        self.run_task_impl(task);
        // Keep this frame on the stack while the task runs.
        std::hint::black_box(());
    }

    #[inline(never)]
    fn run_skip_on_shutdown(&self, task: Task) {
        self.run_task_impl(task);
        std::hint::black_box(());
    }

    #[inline(never)]
    fn run_block_shutdown(&self, task: Task) {
        self.run_task_impl(task);
        std::hint::black_box(());
    }

    #[inline(never)]
    fn run_task_impl(&self, task: Task) {
        let posted_from = task.posted_from;
        // A task body is a black-box call: a panic inside it is the application's bug, but it
        // must not take the worker (and every lock it would poison) down with it.
        if catch_unwind(AssertUnwindSafe(task.closure)).is_err() {
            log::error!("task posted from {posted_from} panicked");
        }
    }
}
