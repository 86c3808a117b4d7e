//! The top-level owner: thread groups, the single-thread manager, the service thread, fences and
//! the shutdown protocol.
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use pool_synchronization::CheckedLock;

use crate::delayed_task_manager::{DefaultTickClock, DelayedTaskManager};
use crate::error::Result;
use crate::job_task_source::{JobDelegate, JobHandle, JobTaskSource};
use crate::sequence::Sequence;
use crate::single_thread_runner_manager::{
    SingleThreadTaskRunnerManager, SingleThreadTaskRunnerThreadMode,
};
use crate::task::{DelayPolicy, Task};
use crate::task_runner::{
    PooledParallelTaskRunner, PooledSequencedTaskRunner, SequencedTaskRunner,
    SingleThreadTaskRunner, TaskRunner, UpdateableSequencedTaskRunner,
};
use crate::task_source::{TaskSource, TaskSourceExecutionMode};
use crate::task_tracker::{CanRunPolicy, TaskTracker};
use crate::task_traits::{TaskPriority, TaskTraits, ThreadPolicy};
use crate::thread_group::{
    ThreadGroup, ThreadGroupDelegate, ThreadGroupStartParams, WorkerEnvironment,
};
use crate::worker::{ThreadType, WorkerThreadObserver};

/// Maximum number of BestEffort tasks that can run concurrently, pool-wide, unless the number of
/// foreground threads is lower.
const MAX_BEST_EFFORT_TASKS: usize = 2;

/// Environment set up on every pool worker.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CommonThreadPoolEnvironment {
    #[default]
    Default,
    /// Initialize a COM multi-threaded apartment on each worker (Windows; inert elsewhere).
    ComMta,
}

/// Configuration for [`ThreadPool::start`].
#[derive(Clone, Debug)]
pub struct InitParams {
    pub max_num_foreground_threads: usize,
    pub max_num_utility_threads: usize,
    pub suggested_reclaim_time: Duration,
    pub common_thread_pool_environment: CommonThreadPoolEnvironment,
}

impl InitParams {
    pub fn new(max_num_foreground_threads: usize) -> InitParams {
        InitParams {
            max_num_foreground_threads,
            max_num_utility_threads: 0,
            suggested_reclaim_time: Duration::from_secs(30),
            common_thread_pool_environment: CommonThreadPoolEnvironment::Default,
        }
    }
}

lazy_static::lazy_static! {
    /// Whether `--disable-best-effort-tasks` was on the process command line.  Sticky source of
    /// the ForegroundOnly policy until shutdown begins.
    static ref HAS_DISABLE_BEST_EFFORT_SWITCH: bool =
        std::env::args().any(|argument| argument == "--disable-best-effort-tasks");
}

struct PoolState {
    started: bool,
    /// While > 0, no task may start (policy None).
    num_fences: usize,
    /// While > 0 (and no full fence), BestEffort tasks may not start (policy ForegroundOnly).
    num_best_effort_fences: usize,
}

pub(crate) struct ThreadPoolCore {
    label: String,
    task_tracker: Arc<TaskTracker>,
    delayed_task_manager: Arc<DelayedTaskManager>,
    single_thread_runner_manager: SingleThreadTaskRunnerManager,
    foreground_group: Arc<ThreadGroup>,
    background_group: Arc<ThreadGroup>,
    /// Created during `start()` when utility threads are configured.
    utility_group: OnceLock<Arc<ThreadGroup>>,
    state: CheckedLock<PoolState>,
    has_disable_best_effort_switch: bool,
    self_weak: Weak<ThreadPoolCore>,
}

impl ThreadGroupDelegate for ThreadPoolCore {
    fn thread_group_for_traits(&self, traits: TaskTraits) -> Arc<ThreadGroup> {
        if traits.priority == TaskPriority::BestEffort
            && traits.thread_policy == ThreadPolicy::PreferBackground
        {
            return self.background_group.clone();
        }
        if traits.priority <= TaskPriority::UserVisible
            && traits.thread_policy == ThreadPolicy::PreferBackground
        {
            if let Some(utility) = self.utility_group.get() {
                return utility.clone();
            }
        }
        self.foreground_group.clone()
    }
}

impl ThreadPoolCore {
    /// Posts `task` as part of `sequence`.  `task_runner`, if any, is retained by the sequence
    /// while the task is queued.
    pub(crate) fn post_task_with_sequence(
        &self,
        mut task: Task,
        sequence: Arc<Sequence>,
        task_runner: Option<Arc<dyn TaskRunner>>,
    ) -> bool {
        if !self
            .task_tracker
            .will_post_task(&mut task, sequence.shutdown_behavior())
        {
            // The closure may run sequence-affine teardown; it must be leaked, not dropped, when
            // the post is rejected.
            Task::leak(task);
            return false;
        }

        match task.delayed_run_time {
            None => self.post_task_with_sequence_now(task, sequence, task_runner),
            Some(run_time) => {
                let delay_policy = task.delay_policy;
                let weak = self.self_weak.clone();
                self.delayed_task_manager.schedule_at(
                    run_time,
                    delay_policy,
                    Box::new(move || {
                        if let Some(core) = weak.upgrade() {
                            core.post_task_with_sequence_now(task, sequence, task_runner);
                        }
                    }),
                );
                true
            }
        }
    }

    fn post_task_with_sequence_now(
        &self,
        task: Task,
        sequence: Arc<Sequence>,
        task_runner: Option<Arc<dyn TaskRunner>>,
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
        let traits = transaction.traits();
        transaction.push_immediate_task(task, task_runner);
        drop(transaction);

        if let Some(task_source) = registered {
            self.thread_group_for_traits(traits)
                .push_task_source_and_wake_up_workers(task_source);
        }
        true
    }

    /// Moves `source` to the right queue position (possibly in another group) after a priority
    /// change.
    pub(crate) fn update_priority(
        &self,
        source: Arc<dyn TaskSource>,
        priority: TaskPriority,
    ) {
        let current_priority = source.priority_racy();
        if current_priority == priority {
            return;
        }
        if current_priority == TaskPriority::BestEffort {
            assert!(
                source.traits().thread_policy_set_explicitly(),
                "a thread policy must be specified when an updateable runner's priority is \
                 raised from BestEffort"
            );
        }

        let current_group = self.thread_group_for_traits(source.traits());
        source.update_priority(priority);
        let new_group = self.thread_group_for_traits(source.traits());

        if Arc::ptr_eq(&current_group, &new_group) {
            current_group.update_sort_key(source.as_ref());
        } else if let Some(task_source) = current_group.remove_task_source(source.as_ref()) {
            // Queued in the wrong group: migrate.  A source currently held by a worker migrates
            // on its next re-enqueue instead, which routes by the updated traits.
            new_group.push_task_source_and_wake_up_workers(task_source);
        }
    }

    pub(crate) fn should_yield(&self, source: &dyn TaskSource) -> bool {
        self.thread_group_for_traits(source.traits())
            .should_yield(source.sort_key())
    }

    pub(crate) fn enqueue_job_task_source(&self, source: Arc<JobTaskSource>) {
        let Some(task_source) = self
            .task_tracker
            .register_task_source(source.clone() as Arc<dyn TaskSource>)
        else {
            return;
        };
        self.thread_group_for_traits(source.traits())
            .push_task_source_and_wake_up_workers(task_source);
    }

    pub(crate) fn remove_job_task_source(&self, source: &Arc<JobTaskSource>) {
        let group = self.thread_group_for_traits(source.traits());
        drop(group.remove_task_source(source.as_ref() as &dyn TaskSource));
    }

    fn for_each_group(&self, mut f: impl FnMut(&Arc<ThreadGroup>)) {
        f(&self.foreground_group);
        if let Some(utility) = self.utility_group.get() {
            f(utility);
        }
        f(&self.background_group);
    }

    /// Recomputes the CanRunPolicy from fences, the kill switch and the shutdown phase, then
    /// wakes workers that the new policy unblocks.
    fn update_can_run_policy(&self) {
        let policy = {
            let state = self.state.lock();
            if (state.num_fences == 0
                && state.num_best_effort_fences == 0
                && !self.has_disable_best_effort_switch)
                || self.task_tracker.has_shutdown_started()
            {
                CanRunPolicy::All
            } else if state.num_fences > 0 {
                CanRunPolicy::None
            } else {
                CanRunPolicy::ForegroundOnly
            }
        };
        self.task_tracker.set_can_run_policy(policy);
        self.for_each_group(|group| group.did_update_can_run_policy());
        self.single_thread_runner_manager.did_update_can_run_policy();
    }
}

/// A general-purpose thread pool.
///
/// Construction does not create any threads; `start` does.  Posts are admitted before `start` and
/// run once the pool starts.  Methods that change pool-wide state (`start`, fences, `shutdown`)
/// must be externally sequenced, typically by calling them all from the owning thread.
pub struct ThreadPool {
    core: Arc<ThreadPoolCore>,
}

impl ThreadPool {
    pub fn new(label: &str) -> ThreadPool {
        let task_tracker = TaskTracker::new();
        let delayed_task_manager =
            Arc::new(DelayedTaskManager::new(Arc::new(DefaultTickClock)));
        let label = label.to_owned();
        let core = Arc::new_cyclic(|self_weak: &Weak<ThreadPoolCore>| {
            let foreground_group = ThreadGroup::new(
                &format!("{label}-foreground"),
                ThreadType::Default,
                task_tracker.clone(),
            );
            foreground_group.set_delegate(self_weak.clone() as Weak<dyn ThreadGroupDelegate>);
            let background_group = ThreadGroup::new(
                &format!("{label}-background"),
                ThreadType::Background,
                task_tracker.clone(),
            );
            background_group.set_delegate(self_weak.clone() as Weak<dyn ThreadGroupDelegate>);
            ThreadPoolCore {
                label: label.clone(),
                task_tracker: task_tracker.clone(),
                delayed_task_manager: delayed_task_manager.clone(),
                single_thread_runner_manager: SingleThreadTaskRunnerManager::new(
                    task_tracker.clone(),
                    delayed_task_manager.clone(),
                ),
                foreground_group,
                background_group,
                utility_group: OnceLock::new(),
                state: CheckedLock::new(PoolState {
                    started: false,
                    num_fences: 0,
                    num_best_effort_fences: 0,
                }),
                has_disable_best_effort_switch: *HAS_DISABLE_BEST_EFFORT_SWITCH,
                self_weak: self_weak.clone(),
            }
        });
        ThreadPool { core }
    }

    /// Creates workers and starts running queued and future posts.  Single-shot.
    pub fn start(
        &self,
        init_params: InitParams,
        worker_thread_observer: Option<Arc<dyn WorkerThreadObserver>>,
    ) {
        assert!(init_params.max_num_foreground_threads > 0);
        {
            let mut state = self.core.state.lock();
            assert!(!state.started, "a thread pool can only be started once");
            state.started = true;
        }

        let max_best_effort_tasks =
            MAX_BEST_EFFORT_TASKS.min(init_params.max_num_foreground_threads);

        self.core.delayed_task_manager.start();

        // The utility group is created late; non-user-blocking work that accumulated on the
        // foreground group before start belongs to it.
        let use_utility_group = init_params.max_num_utility_threads > 0;
        if use_utility_group {
            let utility_group = ThreadGroup::new(
                &format!("{}-utility", self.core.label),
                ThreadType::Utility,
                self.core.task_tracker.clone(),
            );
            utility_group.set_delegate(self.core.self_weak.clone() as Weak<dyn ThreadGroupDelegate>);
            self.core
                .utility_group
                .set(utility_group.clone())
                .ok()
                .expect("utility group created twice");
            self.core
                .foreground_group
                .handoff_non_user_blocking_task_sources_to_other_thread_group(&utility_group);
        }

        // Accounts for the kill switch before anything runs.
        self.core.update_can_run_policy();

        self.core
            .single_thread_runner_manager
            .start(worker_thread_observer.clone(), use_utility_group);

        let worker_environment = match init_params.common_thread_pool_environment {
            CommonThreadPoolEnvironment::Default => WorkerEnvironment::None,
            CommonThreadPoolEnvironment::ComMta => WorkerEnvironment::ComMta,
        };
        let group_params = |max_tasks: usize, max_best_effort: usize| ThreadGroupStartParams {
            max_tasks,
            max_best_effort_tasks: max_best_effort,
            suggested_reclaim_time: init_params.suggested_reclaim_time,
            no_worker_reclaim: false,
            worker_environment,
            may_block_threshold: None,
            blocked_workers_poll_period: None,
            service: self.core.delayed_task_manager.clone(),
            worker_thread_observer: worker_thread_observer.clone(),
        };

        self.core.foreground_group.start(group_params(
            init_params.max_num_foreground_threads,
            max_best_effort_tasks,
        ));
        if let Some(utility_group) = self.core.utility_group.get() {
            utility_group.start(group_params(
                init_params.max_num_utility_threads,
                max_best_effort_tasks,
            ));
        }
        // Best-effort work gets its own small group of background-priority threads.
        self.core
            .background_group
            .start(group_params(max_best_effort_tasks, max_best_effort_tasks));
    }

    /// Posts `traits`-tagged `closure` to run after `delay` (zero for immediately), wrapped in a
    /// one-off single-task sequence.  Returns false iff admission rejected the post.
    #[track_caller]
    pub fn post_delayed_task(
        &self,
        traits: TaskTraits,
        closure: impl FnOnce() + Send + 'static,
        delay: Duration,
    ) -> bool {
        self.post_delayed_task_with_policy(traits, closure, delay, DelayPolicy::default())
    }

    /// Like [`ThreadPool::post_delayed_task`], with an explicit delay policy for the dispatcher.
    #[track_caller]
    pub fn post_delayed_task_with_policy(
        &self,
        traits: TaskTraits,
        closure: impl FnOnce() + Send + 'static,
        delay: Duration,
        delay_policy: DelayPolicy,
    ) -> bool {
        let task = Task::with_delay_and_policy(closure, delay, delay_policy);
        let sequence = Sequence::new(traits, TaskSourceExecutionMode::Parallel);
        self.core.post_task_with_sequence(task, sequence, None)
    }

    pub fn create_task_runner(&self, traits: TaskTraits) -> Arc<dyn TaskRunner> {
        PooledParallelTaskRunner::new(traits, self.core.self_weak.clone())
    }

    pub fn create_sequenced_task_runner(&self, traits: TaskTraits) -> Arc<dyn SequencedTaskRunner> {
        PooledSequencedTaskRunner::new(traits, self.core.self_weak.clone())
    }

    pub fn create_single_thread_task_runner(
        &self,
        traits: TaskTraits,
        thread_mode: SingleThreadTaskRunnerThreadMode,
    ) -> Result<Arc<dyn SingleThreadTaskRunner>> {
        let runner = self
            .core
            .single_thread_runner_manager
            .create_single_thread_task_runner(traits, thread_mode)?;
        Ok(runner as Arc<dyn SingleThreadTaskRunner>)
    }

    /// Creates a sequenced runner whose priority may be updated later.  `traits` must declare a
    /// thread policy if the priority will ever be raised from BestEffort.
    pub fn create_updateable_sequenced_task_runner(
        &self,
        traits: TaskTraits,
    ) -> Arc<UpdateableSequencedTaskRunner> {
        UpdateableSequencedTaskRunner::new(traits, self.core.self_weak.clone())
    }

    /// Starts a cooperative job: workers repeatedly invoke `worker_task` while
    /// `max_concurrency(current_worker_count)` says more of them could contribute.
    pub fn create_job(
        &self,
        traits: TaskTraits,
        worker_task: impl Fn(&JobDelegate) + Send + Sync + 'static,
        max_concurrency: impl Fn(usize) -> usize + Send + Sync + 'static,
    ) -> JobHandle {
        let source = JobTaskSource::new(
            traits,
            worker_task,
            max_concurrency,
            self.core.self_weak.clone(),
        );
        self.core.enqueue_job_task_source(source.clone());
        JobHandle::new(source, Arc::downgrade(&self.core))
    }

    /// Runs the shutdown protocol: stops the service thread, flips the shutdown phase, releases
    /// fences so BlockShutdown work drains at normal priority, and blocks until it has drained.
    pub fn shutdown(&self) {
        // No more delayed dispatches nor blocked-worker polls; delayed tasks that haven't been
        // posted yet will never run, which is indistinguishable from shutting down slightly
        // earlier.
        self.core.delayed_task_manager.shutdown();

        self.core.task_tracker.start_shutdown();

        // After the phase flip, the policy computes to All: non-BlockShutdown tasks no longer
        // start (the tracker's run gate rejects them) and BlockShutdown tasks run at full speed
        // even under fences.
        self.core.update_can_run_policy();

        self.core.for_each_group(|group| group.on_shutdown_started());

        self.core.task_tracker.complete_shutdown();
    }

    /// Waits until all posted task sources have completed.  Does not wait for delayed tasks.
    pub fn flush_for_testing(&self) {
        self.core.task_tracker.flush_for_testing();
    }

    /// Calls `callback` (from any thread) when all posted task sources have completed.
    pub fn flush_async_for_testing(&self, callback: impl FnOnce() + Send + 'static) {
        self.core
            .task_tracker
            .flush_async_for_testing(Box::new(callback));
    }

    /// Joins every worker thread.  No tasks run after this returns.
    pub fn join_for_testing(&self) {
        self.core.delayed_task_manager.shutdown();
        self.core.single_thread_runner_manager.join_for_testing();
        self.core.foreground_group.join_for_testing();
        if let Some(utility_group) = self.core.utility_group.get() {
            utility_group.join_for_testing();
        }
        self.core.background_group.join_for_testing();
    }

    /// Prevents any task from starting until the matching [`ThreadPool::end_fence`].
    pub fn begin_fence(&self) {
        self.core.state.lock().num_fences += 1;
        self.core.update_can_run_policy();
    }

    pub fn end_fence(&self) {
        {
            let mut state = self.core.state.lock();
            assert!(state.num_fences > 0, "unbalanced end_fence");
            state.num_fences -= 1;
        }
        self.core.update_can_run_policy();
    }

    /// Prevents BestEffort tasks from starting until the matching
    /// [`ThreadPool::end_best_effort_fence`].
    pub fn begin_best_effort_fence(&self) {
        self.core.state.lock().num_best_effort_fences += 1;
        self.core.update_can_run_policy();
    }

    pub fn end_best_effort_fence(&self) {
        {
            let mut state = self.core.state.lock();
            assert!(
                state.num_best_effort_fences > 0,
                "unbalanced end_best_effort_fence"
            );
            state.num_best_effort_fences -= 1;
        }
        self.core.update_can_run_policy();
    }

    /// Clamps every group to a minimal concurrency, for memory- or CPU-critical phases.
    pub fn begin_restricted_tasks(&self) {
        self.core.foreground_group.set_max_tasks(2);
        if let Some(utility_group) = self.core.utility_group.get() {
            utility_group.set_max_tasks(1);
        }
        self.core.background_group.set_max_tasks(1);
    }

    pub fn end_restricted_tasks(&self) {
        self.core.foreground_group.reset_max_tasks();
        if let Some(utility_group) = self.core.utility_group.get() {
            utility_group.reset_max_tasks();
        }
        self.core.background_group.reset_max_tasks();
    }
}
