//! A worker: one OS thread driven by a delegate.
//!
//! A worker starts out sleeping.  `wake_up` hands it a token; it then runs tasks from the task
//! sources its delegate returns until the delegate has nothing left, and goes back to sleep.  It
//! periodically checks with the task tracker whether shutdown has completed and exits when it
//! has.
//!
//! Lifetime: the spawned thread's closure holds a strong reference to the `WorkerThread`, which
//! is released when the thread returns.  The object is destroyed on whichever thread drops the
//! last external reference.
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use pool_synchronization::{CheckedLock, WaitableEvent};

use crate::task_source::RegisteredTaskSource;
use crate::task_tracker::TaskTracker;

/// Hint for the OS scheduling priority of a worker thread.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub(crate) enum ThreadType {
    Background,
    Utility,
    Default,
}

fn thread_type_from_u8(value: u8) -> ThreadType {
    match value {
        0 => ThreadType::Background,
        1 => ThreadType::Utility,
        _ => ThreadType::Default,
    }
}

/// Applies `thread_type` to the current thread.
///
/// std has no portable thread-priority API; this records the decision and leaves the OS call to a
/// platform shim.  The call sites are the ones that matter: loop top and blocking entry.
fn apply_thread_type_to_current_thread(thread_type: ThreadType) {
    log::trace!("worker thread type set to {thread_type:?}");
}

/// Notified when any worker enters/exits its main function.
pub trait WorkerThreadObserver: Send + Sync {
    fn on_worker_thread_main_entry(&self);
    fn on_worker_thread_main_exit(&self);
}

/// The per-worker policy object: where work comes from and how the worker sleeps.
pub(crate) trait WorkerDelegate: Send + Sync {
    fn on_main_entry(&self, worker: &Arc<WorkerThread>);

    /// Returns a task source to run from, or `None` to go (back) to sleep.
    fn get_work(&self, worker: &Arc<WorkerThread>) -> Option<RegisteredTaskSource>;

    /// Exchanges a processed task source (possibly `None`) for new work.
    fn swap_processed_task(
        &self,
        processed: Option<RegisteredTaskSource>,
        worker: &Arc<WorkerThread>,
    ) -> Option<RegisteredTaskSource>;

    /// How long to sleep before waking to consider self-reclaim; `None` sleeps until signaled.
    fn sleep_timeout(&self) -> Option<Duration>;

    /// The auto-reset event signaled by `WorkerThread::wake_up`.
    fn wake_event(&self) -> &WaitableEvent;

    fn on_main_exit(&self, worker: &Arc<WorkerThread>);

    /// The worker was woken but found no work.  Observable, not an error.
    fn record_unnecessary_wakeup(&self) {}
}

struct WorkerThreadState {
    join_handle: Option<JoinHandle<()>>,
    /// When this worker last stopped being used; `None` while in use.
    last_used_time: Option<Instant>,
    started: bool,
}

pub(crate) struct WorkerThread {
    self_weak: Weak<WorkerThread>,
    thread_type_hint: ThreadType,
    current_thread_type: AtomicU8,
    sequence_num: usize,
    delegate: Arc<dyn WorkerDelegate>,
    task_tracker: Arc<TaskTracker>,
    should_exit: AtomicBool,
    join_called_for_testing: AtomicBool,
    // Leaf lock: may be acquired while any other scheduler lock is held.
    thread: CheckedLock<WorkerThreadState>,
}

impl WorkerThread {
    pub(crate) fn new(
        thread_type_hint: ThreadType,
        delegate: Arc<dyn WorkerDelegate>,
        task_tracker: Arc<TaskTracker>,
        sequence_num: usize,
    ) -> Arc<WorkerThread> {
        Arc::new_cyclic(|self_weak| WorkerThread {
            self_weak: self_weak.clone(),
            thread_type_hint,
            current_thread_type: AtomicU8::new(thread_type_hint as u8),
            sequence_num,
            delegate,
            task_tracker,
            should_exit: AtomicBool::new(false),
            join_called_for_testing: AtomicBool::new(false),
            thread: CheckedLock::universal_successor(WorkerThreadState {
                join_handle: None,
                last_used_time: None,
                started: false,
            }),
        })
    }

    pub(crate) fn sequence_num(&self) -> usize {
        self.sequence_num
    }

    /// Spawns the backing thread.  The thread starts waiting for a wake-up.  No-op after
    /// `cleanup`.
    pub(crate) fn start(
        &self,
        thread_name: String,
        observer: Option<Arc<dyn WorkerThreadObserver>>,
    ) -> bool {
        let mut thread = self.thread.lock();
        assert!(!thread.started, "a worker thread can only be started once");
        if self.should_exit() {
            return false;
        }
        let this = self
            .self_weak
            .upgrade()
            .expect("started a worker with no owning reference");
        let spawned = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || this.run_worker(observer));
        match spawned {
            Ok(handle) => {
                thread.join_handle = Some(handle);
                thread.started = true;
                true
            }
            Err(error) => {
                log::error!("failed to spawn worker thread {thread_name}: {error}");
                false
            }
        }
    }

    /// Wakes this worker if it is asleep.  After this, the worker runs task sources returned by
    /// its delegate's `get_work` until it returns `None`.
    pub(crate) fn wake_up(&self) {
        self.delegate.wake_event().signal();
    }

    /// Asks the worker to exit.  The caller is expected to drop its reference afterwards.
    pub(crate) fn cleanup(&self) {
        self.should_exit.store(true, Ordering::Release);
        self.wake_up();
    }

    pub(crate) fn should_exit(&self) -> bool {
        self.should_exit.load(Ordering::Acquire)
            || self.join_called_for_testing.load(Ordering::Acquire)
            || self.task_tracker.is_shutdown_complete()
    }

    /// Joins the backing thread.  A task that is running is allowed to complete.
    pub(crate) fn join_for_testing(&self) {
        self.join_called_for_testing.store(true, Ordering::Release);
        self.wake_up();
        let handle = self.thread.lock().join_handle.take();
        if let Some(handle) = handle {
            handle.join().expect("worker threads do not panic");
        }
    }

    /// Marks the start/end of a period during which the worker is unused.  Thread-safe.
    pub(crate) fn begin_unused_period(&self, now: Instant) {
        self.thread.lock().last_used_time = Some(now);
    }

    pub(crate) fn end_unused_period(&self) {
        self.thread.lock().last_used_time = None;
    }

    /// The last time this worker became unused; `None` while in use.
    pub(crate) fn last_used_time(&self) -> Option<Instant> {
        self.thread.lock().last_used_time
    }

    /// Re-evaluates the thread type: the hint, unless shutdown has started (a background worker
    /// running BlockShutdown work must not be starved by its own priority).
    pub(crate) fn maybe_update_thread_type(&self) {
        let desired = if self.task_tracker.has_shutdown_started() {
            ThreadType::Default
        } else {
            self.thread_type_hint
        };
        let current = thread_type_from_u8(self.current_thread_type.load(Ordering::Relaxed));
        if current != desired {
            self.current_thread_type.store(desired as u8, Ordering::Relaxed);
            apply_thread_type_to_current_thread(desired);
        }
    }

    /// Waits until woken or until the delegate's sleep timeout expires.  Returns true iff the
    /// wait ended because of a signal.  The unused period is tracked by idle-set membership, not
    /// by this wait: a timed-out wake must still observe how long the worker has been unused.
    fn wait_for_work(&self) -> bool {
        match self.delegate.sleep_timeout() {
            Some(timeout) => self.delegate.wake_event().timed_wait(timeout),
            None => {
                self.delegate.wake_event().wait();
                true
            }
        }
    }

    fn run_worker(self: Arc<Self>, observer: Option<Arc<dyn WorkerThreadObserver>>) {
        log::debug!(
            "worker {} starting on thread {:?}",
            self.sequence_num,
            std::thread::current().name()
        );
        self.delegate.on_main_entry(&self);
        if let Some(ref observer) = observer {
            observer.on_worker_thread_main_entry();
        }

        let mut woke_by_signal = false;
        loop {
            if self.should_exit() {
                break;
            }
            self.maybe_update_thread_type();

            let mut task_source = self.delegate.get_work(&self);
            if task_source.is_none() {
                if woke_by_signal {
                    self.delegate.record_unnecessary_wakeup();
                }
                if self.should_exit() {
                    break;
                }
                woke_by_signal = self.wait_for_work();
                continue;
            }
            woke_by_signal = false;

            while let Some(source) = task_source {
                let processed = self.task_tracker.run_and_pop_next_task(source);
                task_source = self.delegate.swap_processed_task(processed, &self);
                self.maybe_update_thread_type();
            }
        }

        self.delegate.on_main_exit(&self);
        if let Some(ref observer) = observer {
            observer.on_worker_thread_main_exit();
        }
        log::debug!("worker {} exiting", self.sequence_num);
        // The thread's strong self-reference (captured by the spawn closure) dies here.
    }
}
