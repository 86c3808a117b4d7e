//! Dedicated and shared single-thread workers.
//!
//! A single-thread worker has no siblings to share a queue with, so it owns a private priority
//! queue, but it goes through the same task-tracker gate as everything else.  Two flavors exist:
//!
//! - *Dedicated*: one worker per runner handed out; the worker is torn down when the last
//!   reference to its runner drops.
//! - *Shared*: a fixed matrix of workers indexed by (environment, continue-on-shutdown); all
//!   runners with matching traits share the same thread.  `with_sync_primitives` is refused on
//!   shared runners because unrelated runners deadlocking each other through a shared thread is
//!   nearly impossible to debug.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use pool_synchronization::{CheckedLock, ResetPolicy, WaitableEvent};

use crate::delayed_task_manager::DelayedTaskManager;
use crate::error::{Error, Result};
use crate::priority_queue::PriorityQueue;
use crate::sequence::Sequence;
use crate::task::Task;
use crate::task_runner::{SequencedTaskRunner, SingleThreadTaskRunner, TaskRunner};
use crate::task_source::{RegisteredTaskSource, RunIntent, TaskSource, TaskSourceExecutionMode};
use crate::task_tracker::TaskTracker;
use crate::task_traits::{TaskPriority, TaskShutdownBehavior, TaskTraits, ThreadPolicy};
use crate::worker::{ThreadType, WorkerDelegate, WorkerThread, WorkerThreadObserver};

/// Whether a manager instance is alive in this process.  Written only on the construction and
/// destruction path of the pool owner, never during normal operation; reads after teardown are
/// tombstone checks that make late posts return false instead of crashing.  Relaxed by design.
static MANAGER_IS_ALIVE: AtomicBool = AtomicBool::new(false);

fn manager_is_alive() -> bool {
    MANAGER_IS_ALIVE.load(Ordering::Relaxed)
}

/// Whether a [`SingleThreadTaskRunner`] gets its own thread or shares one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SingleThreadTaskRunnerThreadMode {
    Dedicated,
    Shared,
}

const FOREGROUND: usize = 0;
const FOREGROUND_BLOCKING: usize = 1;
const UTILITY: usize = 2;
const UTILITY_BLOCKING: usize = 3;
const BACKGROUND: usize = 4;
const BACKGROUND_BLOCKING: usize = 5;
const ENVIRONMENT_COUNT: usize = 6;

const ENVIRONMENT_NAMES: [&str; ENVIRONMENT_COUNT] = [
    "foreground",
    "foreground-blocking",
    "utility",
    "utility-blocking",
    "background",
    "background-blocking",
];

fn environment_index_for_traits(traits: &TaskTraits, use_utility_group: bool) -> usize {
    let is_background = traits.priority == TaskPriority::BestEffort
        && traits.thread_policy == ThreadPolicy::PreferBackground;
    let is_utility = !is_background
        && traits.priority <= TaskPriority::UserVisible
        && traits.thread_policy == ThreadPolicy::PreferBackground
        && use_utility_group;
    let blocking = traits.may_block || traits.with_sync_primitives;
    match (is_background, is_utility, blocking) {
        (true, _, true) => BACKGROUND_BLOCKING,
        (true, _, false) => BACKGROUND,
        (false, true, true) => UTILITY_BLOCKING,
        (false, true, false) => UTILITY,
        (false, false, true) => FOREGROUND_BLOCKING,
        (false, false, false) => FOREGROUND,
    }
}

fn thread_type_for_environment(environment: usize) -> ThreadType {
    match environment {
        BACKGROUND | BACKGROUND_BLOCKING => ThreadType::Background,
        UTILITY | UTILITY_BLOCKING => ThreadType::Utility,
        _ => ThreadType::Default,
    }
}

fn continue_on_shutdown_index(traits: &TaskTraits) -> usize {
    usize::from(traits.shutdown_behavior != TaskShutdownBehavior::ContinueOnShutdown)
}

struct SingleThreadWorkerState {
    priority_queue: PriorityQueue,
    worker_awake: bool,
}

/// Delegate of one single-thread worker: a private queue plus the wake event.
pub(crate) struct SingleThreadWorkerDelegate {
    thread_name: String,
    task_tracker: Arc<TaskTracker>,
    state: CheckedLock<SingleThreadWorkerState>,
    wake_event: WaitableEvent,
    /// Set before the worker starts or receives posts.
    worker: OnceLock<Arc<WorkerThread>>,
    /// Identity of the backing thread, set on main entry.
    thread_id: OnceLock<ThreadId>,
}

impl SingleThreadWorkerDelegate {
    fn new(thread_name: String, task_tracker: Arc<TaskTracker>) -> Arc<SingleThreadWorkerDelegate> {
        Arc::new(SingleThreadWorkerDelegate {
            thread_name,
            task_tracker,
            state: CheckedLock::new(SingleThreadWorkerState {
                priority_queue: PriorityQueue::new(),
                worker_awake: false,
            }),
            wake_event: WaitableEvent::new(ResetPolicy::Automatic),
            worker: OnceLock::new(),
            thread_id: OnceLock::new(),
        })
    }

    fn set_worker(&self, worker: Arc<WorkerThread>) {
        self.worker.set(worker).ok().expect("worker set twice");
    }

    fn can_run_next_task_source(&self, state: &SingleThreadWorkerState) -> bool {
        state
            .priority_queue
            .peek_sort_key()
            .is_some_and(|key| self.task_tracker.can_run_priority(key.priority()))
    }

    /// Returns true iff the worker must be woken: the source can run and the worker was asleep.
    fn enqueue_task_source_lock_required(
        &self,
        state: &mut SingleThreadWorkerState,
        task_source: RegisteredTaskSource,
        sort_key: crate::sort_key::TaskSourceSortKey,
    ) -> bool {
        state.priority_queue.push(task_source, sort_key);
        if !state.worker_awake && self.can_run_next_task_source(state) {
            state.worker_awake = true;
            return true;
        }
        false
    }

    fn take_runnable_task_source(
        &self,
        state: &mut SingleThreadWorkerState,
    ) -> Option<RegisteredTaskSource> {
        if !self.can_run_next_task_source(state) {
            return None;
        }
        let task_source = state.priority_queue.pop_task_source()?;
        let intent = task_source.source().will_run_task();
        debug_assert_ne!(intent, RunIntent::Disallowed);
        Some(task_source)
    }

    /// The immediate-post path.  The sequence transaction is released before the source is moved
    /// into the queue, and the queue lock is never held while the sequence lock is taken.
    pub(crate) fn post_task_now(
        &self,
        sequence: &Arc<Sequence>,
        task_runner: Option<Arc<dyn TaskRunner>>,
        task: Task,
    ) -> bool {
        let mut transaction = sequence.begin_transaction();
        let sequence_should_be_queued = transaction.will_push_immediate_task();
        let mut registered = None;
        if sequence_should_be_queued {
            registered = self
                .task_tracker
                .register_task_source(sequence.clone() as Arc<dyn TaskSource>);
            if registered.is_none() {
                // `will_post_task` already admitted the task; release its claims.
                self.task_tracker
                    .did_not_post_task(sequence.shutdown_behavior());
                return false;
            }
        }
        if !self
            .task_tracker
            .will_post_task_now(&task, transaction.traits().priority)
        {
            self.task_tracker
                .did_not_post_task(sequence.shutdown_behavior());
            return false;
        }
        transaction.push_immediate_task(task, task_runner);
        drop(transaction);

        if let Some(task_source) = registered {
            let sort_key = task_source.source().sort_key();
            let should_wakeup = {
                let mut state = self.state.lock();
                self.enqueue_task_source_lock_required(&mut state, task_source, sort_key)
            };
            if should_wakeup {
                self.worker
                    .get()
                    .expect("posted to a single-thread runner before its worker was set")
                    .wake_up();
            }
        }
        true
    }

    fn did_update_can_run_policy(&self) {
        let should_wakeup = {
            let mut state = self.state.lock();
            if !state.worker_awake && self.can_run_next_task_source(&state) {
                state.worker_awake = true;
                true
            } else {
                false
            }
        };
        if should_wakeup {
            if let Some(worker) = self.worker.get() {
                worker.wake_up();
            }
        }
    }

    fn runs_tasks_in_current_sequence(&self) -> bool {
        self.thread_id.get().copied() == Some(std::thread::current().id())
    }

    fn enable_flush_priority_queue_on_destroy_for_testing(&self) {
        self.state
            .lock()
            .priority_queue
            .enable_flush_task_sources_on_destroy_for_testing();
    }
}

impl WorkerDelegate for SingleThreadWorkerDelegate {
    fn on_main_entry(&self, _worker: &Arc<WorkerThread>) {
        let _ = self.thread_id.set(std::thread::current().id());
    }

    fn get_work(&self, _worker: &Arc<WorkerThread>) -> Option<RegisteredTaskSource> {
        let mut state = self.state.lock();
        // The awake flag may be stale when the thread starts before any post; claim it.
        state.worker_awake = true;
        let task_source = self.take_runnable_task_source(&mut state);
        if task_source.is_none() {
            state.worker_awake = false;
        }
        task_source
    }

    fn swap_processed_task(
        &self,
        processed: Option<RegisteredTaskSource>,
        _worker: &Arc<WorkerThread>,
    ) -> Option<RegisteredTaskSource> {
        let reenqueue = processed.map(|task_source| {
            task_source
                .source()
                .will_reenqueue(std::time::Instant::now());
            let sort_key = task_source.source().sort_key();
            (task_source, sort_key)
        });

        let mut state = self.state.lock();
        if let Some((task_source, sort_key)) = reenqueue {
            state.priority_queue.push(task_source, sort_key);
        }
        // The wake-up contract only requires one loop iteration per wake-up; consuming a pending
        // token here avoids a useless pass before going back to sleep.
        self.wake_event.reset();

        let task_source = self.take_runnable_task_source(&mut state);
        if task_source.is_none() {
            state.worker_awake = false;
        }
        task_source
    }

    fn sleep_timeout(&self) -> Option<Duration> {
        // Single-thread workers are never reclaimed while their runner lives.
        None
    }

    fn wake_event(&self) -> &WaitableEvent {
        &self.wake_event
    }

    fn on_main_exit(&self, _worker: &Arc<WorkerThread>) {}
}

type ManagedWorker = (Arc<WorkerThread>, Arc<SingleThreadWorkerDelegate>);

struct ManagerState {
    started: bool,
    use_utility_group: bool,
    next_worker_id: usize,
    observer: Option<Arc<dyn WorkerThreadObserver>>,
    workers: Vec<ManagedWorker>,
    shared_workers: [[Option<ManagedWorker>; 2]; ENVIRONMENT_COUNT],
}

pub(crate) struct ManagerInner {
    task_tracker: Arc<TaskTracker>,
    delayed_task_manager: Arc<DelayedTaskManager>,
    state: CheckedLock<ManagerState>,
}

impl ManagerInner {
    fn create_and_register_worker_locked(
        &self,
        state: &mut ManagerState,
        environment: usize,
        thread_mode: SingleThreadTaskRunnerThreadMode,
    ) -> ManagedWorker {
        let id = state.next_worker_id;
        state.next_worker_id += 1;
        let shared_part = match thread_mode {
            SingleThreadTaskRunnerThreadMode::Shared => "shared-",
            SingleThreadTaskRunnerThreadMode::Dedicated => "",
        };
        let thread_name = format!(
            "foreman-single-thread-{}{}-{}",
            shared_part, ENVIRONMENT_NAMES[environment], id
        );
        let delegate = SingleThreadWorkerDelegate::new(thread_name, self.task_tracker.clone());
        let worker = WorkerThread::new(
            thread_type_for_environment(environment),
            delegate.clone(),
            self.task_tracker.clone(),
            id,
        );
        delegate.set_worker(worker.clone());
        state.workers.push((worker.clone(), delegate.clone()));
        (worker, delegate)
    }

    fn unregister_worker(&self, worker: &Arc<WorkerThread>) {
        let removed = {
            let mut state = self.state.lock();
            // Empty while joining: the join logic takes care of the rest.
            if state.workers.is_empty() {
                return;
            }
            match state
                .workers
                .iter()
                .position(|(candidate, _)| Arc::ptr_eq(candidate, worker))
            {
                Some(index) => Some(state.workers.remove(index)),
                None => None,
            }
        };
        if let Some((worker, _delegate)) = removed {
            worker.cleanup();
        }
    }

    fn release_shared_workers(&self) {
        let mut to_release: Vec<ManagedWorker> = Vec::new();
        {
            let mut state = self.state.lock();
            for environment in state.shared_workers.iter_mut() {
                for slot in environment.iter_mut() {
                    if let Some(managed) = slot.take() {
                        to_release.push(managed);
                    }
                }
            }
        }
        for (worker, _delegate) in to_release {
            self.unregister_worker(&worker);
        }
    }
}

/// Owns every single-thread worker.  Dedicated workers die with their runner; shared workers die
/// with the manager.
pub(crate) struct SingleThreadTaskRunnerManager {
    inner: Arc<ManagerInner>,
}

impl SingleThreadTaskRunnerManager {
    pub(crate) fn new(
        task_tracker: Arc<TaskTracker>,
        delayed_task_manager: Arc<DelayedTaskManager>,
    ) -> SingleThreadTaskRunnerManager {
        assert!(
            !MANAGER_IS_ALIVE.load(Ordering::Relaxed),
            "only one single-thread runner manager may exist per process"
        );
        MANAGER_IS_ALIVE.store(true, Ordering::Relaxed);
        SingleThreadTaskRunnerManager {
            inner: Arc::new(ManagerInner {
                task_tracker,
                delayed_task_manager,
                state: CheckedLock::new(ManagerState {
                    started: false,
                    use_utility_group: false,
                    next_worker_id: 0,
                    observer: None,
                    workers: Vec::new(),
                    shared_workers: Default::default(),
                }),
            }),
        }
    }

    pub(crate) fn start(
        &self,
        observer: Option<Arc<dyn WorkerThreadObserver>>,
        use_utility_group: bool,
    ) {
        let workers_to_start = {
            let mut state = self.inner.state.lock();
            debug_assert!(!state.started);
            state.started = true;
            state.use_utility_group = use_utility_group;
            state.observer = observer.clone();
            state.workers.clone()
        };
        // Workers that already have pending posts were signaled by post_task_now; starting the
        // thread is all that is left.
        for (worker, delegate) in workers_to_start {
            worker.start(delegate.thread_name.clone(), observer.clone());
        }
    }

    pub(crate) fn create_single_thread_task_runner(
        &self,
        traits: TaskTraits,
        thread_mode: SingleThreadTaskRunnerThreadMode,
    ) -> Result<Arc<PooledSingleThreadTaskRunner>> {
        if thread_mode == SingleThreadTaskRunnerThreadMode::Shared && traits.with_sync_primitives {
            return Err(Error::SharedRunnerWithSyncPrimitives);
        }

        let (worker, delegate, is_new_worker, started, observer) = {
            let mut state = self.inner.state.lock();
            let environment = environment_index_for_traits(&traits, state.use_utility_group);
            match thread_mode {
                SingleThreadTaskRunnerThreadMode::Dedicated => {
                    let (worker, delegate) = self.inner.create_and_register_worker_locked(
                        &mut state,
                        environment,
                        thread_mode,
                    );
                    (worker, delegate, true, state.started, state.observer.clone())
                }
                SingleThreadTaskRunnerThreadMode::Shared => {
                    let shutdown_index = continue_on_shutdown_index(&traits);
                    match state.shared_workers[environment][shutdown_index].clone() {
                        Some((worker, delegate)) => {
                            (worker, delegate, false, state.started, state.observer.clone())
                        }
                        None => {
                            let (worker, delegate) = self.inner.create_and_register_worker_locked(
                                &mut state,
                                environment,
                                thread_mode,
                            );
                            state.shared_workers[environment][shutdown_index] =
                                Some((worker.clone(), delegate.clone()));
                            (worker, delegate, true, state.started, state.observer.clone())
                        }
                    }
                }
            }
        };

        if is_new_worker && started {
            worker.start(delegate.thread_name.clone(), observer);
        }

        Ok(PooledSingleThreadTaskRunner::new(
            Arc::downgrade(&self.inner),
            traits,
            worker,
            delegate,
            thread_mode,
        ))
    }

    pub(crate) fn did_update_can_run_policy(&self) {
        let workers = {
            let state = self.inner.state.lock();
            if !state.started {
                return;
            }
            state.workers.clone()
        };
        // A worker created after the snapshot sees the new policy on its first post.
        for (_worker, delegate) in workers {
            delegate.did_update_can_run_policy();
        }
    }

    pub(crate) fn join_for_testing(&self) {
        let local_workers = {
            let mut state = self.inner.state.lock();
            std::mem::take(&mut state.workers)
        };
        for (worker, delegate) in &local_workers {
            delegate.enable_flush_priority_queue_on_destroy_for_testing();
            worker.join_for_testing();
        }
        {
            let mut state = self.inner.state.lock();
            debug_assert!(
                state.workers.is_empty(),
                "new workers unexpectedly registered during join"
            );
            state.workers = local_workers;
        }
        // Release shared workers last so that they were joined above; released earlier they would
        // effectively detach.
        self.inner.release_shared_workers();
    }
}

impl Drop for SingleThreadTaskRunnerManager {
    fn drop(&mut self) {
        debug_assert!(MANAGER_IS_ALIVE.load(Ordering::Relaxed));
        MANAGER_IS_ALIVE.store(false, Ordering::Relaxed);
    }
}

/// The runner handed to callers.  Indirectly controls the lifetime of a dedicated worker.
pub struct PooledSingleThreadTaskRunner {
    manager: Weak<ManagerInner>,
    worker: Arc<WorkerThread>,
    delegate: Arc<SingleThreadWorkerDelegate>,
    thread_mode: SingleThreadTaskRunnerThreadMode,
    sequence: Arc<Sequence>,
    self_weak: Weak<PooledSingleThreadTaskRunner>,
}

impl PooledSingleThreadTaskRunner {
    fn new(
        manager: Weak<ManagerInner>,
        traits: TaskTraits,
        worker: Arc<WorkerThread>,
        delegate: Arc<SingleThreadWorkerDelegate>,
        thread_mode: SingleThreadTaskRunnerThreadMode,
    ) -> Arc<PooledSingleThreadTaskRunner> {
        Arc::new_cyclic(|self_weak| PooledSingleThreadTaskRunner {
            manager,
            worker,
            delegate,
            thread_mode,
            sequence: Sequence::new(traits, TaskSourceExecutionMode::SingleThread),
            self_weak: self_weak.clone(),
        })
    }
}

impl TaskRunner for PooledSingleThreadTaskRunner {
    fn post_task(&self, mut task: Task) -> bool {
        if !manager_is_alive() {
            return false;
        }
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        if !manager
            .task_tracker
            .will_post_task(&mut task, self.sequence.shutdown_behavior())
        {
            // The closure may be sequence-affine; it must not be destroyed here.
            Task::leak(task);
            return false;
        }

        let task_runner = self
            .self_weak
            .upgrade()
            .map(|runner| runner as Arc<dyn TaskRunner>);
        match task.delayed_run_time {
            None => self.delegate.post_task_now(&self.sequence, task_runner, task),
            Some(run_time) => {
                let delay_policy = task.delay_policy;
                let delegate = self.delegate.clone();
                let sequence = self.sequence.clone();
                manager.delayed_task_manager.schedule_at(
                    run_time,
                    delay_policy,
                    Box::new(move || {
                        delegate.post_task_now(&sequence, task_runner, task);
                    }),
                );
                true
            }
        }
    }

    fn runs_tasks_in_current_sequence(&self) -> bool {
        if !manager_is_alive() {
            return false;
        }
        // The thread, not the sequence token, is compared: callbacks on the bound thread may run
        // outside any task and still count as "on this sequence".
        self.delegate.runs_tasks_in_current_sequence()
    }
}

impl SequencedTaskRunner for PooledSingleThreadTaskRunner {}
impl SingleThreadTaskRunner for PooledSingleThreadTaskRunner {}

impl Drop for PooledSingleThreadTaskRunner {
    fn drop(&mut self) {
        // Only a dedicated worker dies with its runner; shared workers are reused and managed
        // separately.  The alive flag makes this a no-op after the pool was torn down.
        if manager_is_alive() && self.thread_mode == SingleThreadTaskRunnerThreadMode::Dedicated {
            if let Some(manager) = self.manager.upgrade() {
                manager.unregister_worker(&self.worker);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::lock_manager_for_testing;
    use super::*;
    use crate::delayed_task_manager::DefaultTickClock;
    use crate::task_runner::TaskRunnerExt;
    use std::sync::Mutex;

    struct ManagerHarness {
        tracker: Arc<TaskTracker>,
        delayed: Arc<DelayedTaskManager>,
        manager: SingleThreadTaskRunnerManager,
    }

    impl ManagerHarness {
        fn new() -> ManagerHarness {
            let tracker = TaskTracker::new();
            let delayed = Arc::new(DelayedTaskManager::new(Arc::new(DefaultTickClock)));
            delayed.start();
            let manager = SingleThreadTaskRunnerManager::new(tracker.clone(), delayed.clone());
            ManagerHarness {
                tracker,
                delayed,
                manager,
            }
        }

        fn teardown(self) {
            self.tracker.flush_for_testing();
            self.manager.join_for_testing();
            self.delayed.shutdown();
        }
    }

    #[test]
    fn dedicated_runner_runs_tasks_in_order_on_one_thread() {
        let _serial = lock_manager_for_testing();
        let harness = ManagerHarness::new();
        harness.manager.start(None, false);

        let runner = harness
            .manager
            .create_single_thread_task_runner(
                TaskTraits::new(),
                SingleThreadTaskRunnerThreadMode::Dedicated,
            )
            .unwrap();

        let log: Arc<Mutex<Vec<(usize, ThreadId)>>> = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = log.clone();
            assert!(runner.post(move || {
                log.lock().unwrap().push((i, std::thread::current().id()));
            }));
        }
        harness.tracker.flush_for_testing();

        let log = log.lock().unwrap().clone();
        assert_eq!(log.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        let first_thread = log[0].1;
        assert!(log.iter().all(|(_, thread)| *thread == first_thread));

        drop(runner);
        harness.teardown();
    }

    #[test]
    fn shared_runners_with_matching_traits_share_a_thread() {
        let _serial = lock_manager_for_testing();
        let harness = ManagerHarness::new();
        harness.manager.start(None, false);

        let runner_a = harness
            .manager
            .create_single_thread_task_runner(
                TaskTraits::new(),
                SingleThreadTaskRunnerThreadMode::Shared,
            )
            .unwrap();
        let runner_b = harness
            .manager
            .create_single_thread_task_runner(
                TaskTraits::new(),
                SingleThreadTaskRunnerThreadMode::Shared,
            )
            .unwrap();

        let ids: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));
        for runner in [&runner_a, &runner_b] {
            let ids = ids.clone();
            assert!(runner.post(move || {
                ids.lock().unwrap().push(std::thread::current().id());
            }));
        }
        harness.tracker.flush_for_testing();

        let ids = ids.lock().unwrap().clone();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1]);

        // A different (environment, shutdown-behavior) cell gets a different worker.
        let runner_c = harness
            .manager
            .create_single_thread_task_runner(
                TaskTraits::new()
                    .with_shutdown_behavior(TaskShutdownBehavior::ContinueOnShutdown),
                SingleThreadTaskRunnerThreadMode::Shared,
            )
            .unwrap();
        let ids2 = ids.clone();
        let other_ids: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));
        let other_ids2 = other_ids.clone();
        assert!(runner_c.post(move || {
            other_ids2.lock().unwrap().push(std::thread::current().id());
        }));
        harness.tracker.flush_for_testing();
        assert_ne!(other_ids.lock().unwrap()[0], ids2[0]);

        drop((runner_a, runner_b, runner_c));
        harness.teardown();
    }

    #[test]
    fn sync_primitives_are_refused_on_shared_runners() {
        let _serial = lock_manager_for_testing();
        let harness = ManagerHarness::new();
        let result = harness.manager.create_single_thread_task_runner(
            TaskTraits::new().with_sync_primitives(),
            SingleThreadTaskRunnerThreadMode::Shared,
        );
        assert!(matches!(result, Err(Error::SharedRunnerWithSyncPrimitives)));

        // Fine on a dedicated runner.
        let runner = harness.manager.create_single_thread_task_runner(
            TaskTraits::new().with_sync_primitives(),
            SingleThreadTaskRunnerThreadMode::Dedicated,
        );
        drop(runner.unwrap());
        harness.teardown();
    }

    #[test]
    fn rejected_best_effort_block_shutdown_post_releases_its_claim() {
        use crate::task_tracker::CanRunPolicy;

        let _serial = lock_manager_for_testing();
        let harness = ManagerHarness::new();
        harness.manager.start(None, false);
        harness.tracker.set_can_run_policy(CanRunPolicy::ForegroundOnly);

        let runner = harness
            .manager
            .create_single_thread_task_runner(
                TaskTraits::new()
                    .with_priority(TaskPriority::BestEffort)
                    .with_shutdown_behavior(TaskShutdownBehavior::BlockShutdown),
                SingleThreadTaskRunnerThreadMode::Dedicated,
            )
            .unwrap();
        assert!(!runner.post(|| unreachable!("rejected by the best-effort gate")));

        // The rejected post holds no shutdown-blocking claim: shutdown completes.
        harness.tracker.start_shutdown();
        harness.tracker.complete_shutdown();

        drop(runner);
        harness.teardown();
    }

    #[test]
    fn delayed_posts_dispatch_through_the_service_thread() {
        let _serial = lock_manager_for_testing();
        let harness = ManagerHarness::new();
        harness.manager.start(None, false);

        let runner = harness
            .manager
            .create_single_thread_task_runner(
                TaskTraits::new(),
                SingleThreadTaskRunnerThreadMode::Dedicated,
            )
            .unwrap();

        let ran = Arc::new(WaitableEvent::new(ResetPolicy::Manual));
        let ran2 = ran.clone();
        assert!(runner.post_delayed(
            move || {
                ran2.signal();
            },
            Duration::from_millis(20),
        ));
        assert!(ran.timed_wait(Duration::from_secs(5)));

        drop(runner);
        harness.teardown();
    }
}
