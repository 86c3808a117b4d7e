//! Task runner handles: how callers hand work to the pool.
//!
//! Runners hold a weak reference to the pool core: posting to a pool that has been destroyed
//! returns false instead of crashing.  In the other direction, a sequence holds a *strong*
//! reference to its runner while it has queued work (see `sequence.rs`), which is what keeps a
//! runner alive until everything posted through it has run, without a permanent cycle.
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::sequence::Sequence;
use crate::task::{DelayPolicy, Task};
use crate::task_source::TaskSourceExecutionMode;
use crate::task_traits::{TaskPriority, TaskTraits};
use crate::thread_pool::ThreadPoolCore;

/// Posts tasks that may run in any order and in parallel.
pub trait TaskRunner: Send + Sync {
    /// Posts a fully-formed task.  Prefer [`TaskRunnerExt::post`] and
    /// [`TaskRunnerExt::post_delayed`], which capture the caller location.
    fn post_task(&self, task: Task) -> bool;

    /// Whether the calling context runs tasks in the same sequence as this runner.
    fn runs_tasks_in_current_sequence(&self) -> bool;
}

/// Posts tasks that run one at a time, in posting order.
pub trait SequencedTaskRunner: TaskRunner {}

/// Posts tasks that run one at a time, in posting order, all on one thread.
pub trait SingleThreadTaskRunner: SequencedTaskRunner {}

/// Closure-taking sugar over [`TaskRunner::post_task`].
pub trait TaskRunnerExt {
    fn post(&self, closure: impl FnOnce() + Send + 'static) -> bool;
    fn post_delayed(&self, closure: impl FnOnce() + Send + 'static, delay: Duration) -> bool;
    fn post_delayed_with_policy(
        &self,
        closure: impl FnOnce() + Send + 'static,
        delay: Duration,
        delay_policy: DelayPolicy,
    ) -> bool;
}

impl<T: TaskRunner + ?Sized> TaskRunnerExt for T {
    #[track_caller]
    fn post(&self, closure: impl FnOnce() + Send + 'static) -> bool {
        self.post_task(Task::new(closure))
    }

    #[track_caller]
    fn post_delayed(&self, closure: impl FnOnce() + Send + 'static, delay: Duration) -> bool {
        self.post_task(Task::with_delay(closure, delay))
    }

    #[track_caller]
    fn post_delayed_with_policy(
        &self,
        closure: impl FnOnce() + Send + 'static,
        delay: Duration,
        delay_policy: DelayPolicy,
    ) -> bool {
        self.post_task(Task::with_delay_and_policy(closure, delay, delay_policy))
    }
}

/// Runner whose tasks each become an independent single-task parallel sequence.
pub(crate) struct PooledParallelTaskRunner {
    traits: TaskTraits,
    core: Weak<ThreadPoolCore>,
    self_weak: Weak<PooledParallelTaskRunner>,
}

impl PooledParallelTaskRunner {
    pub(crate) fn new(
        traits: TaskTraits,
        core: Weak<ThreadPoolCore>,
    ) -> Arc<PooledParallelTaskRunner> {
        Arc::new_cyclic(|self_weak| PooledParallelTaskRunner {
            traits,
            core,
            self_weak: self_weak.clone(),
        })
    }
}

impl TaskRunner for PooledParallelTaskRunner {
    fn post_task(&self, task: Task) -> bool {
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        let sequence = Sequence::new(self.traits, TaskSourceExecutionMode::Parallel);
        let runner = self.self_weak.upgrade().map(|r| r as Arc<dyn TaskRunner>);
        core.post_task_with_sequence(task, sequence, runner)
    }

    fn runs_tasks_in_current_sequence(&self) -> bool {
        // Parallel tasks have no sequence identity that outlives them.
        false
    }
}

/// Runner backed by one sequence; also the backing of the updateable variant.
pub(crate) struct PooledSequencedTaskRunner {
    sequence: Arc<Sequence>,
    core: Weak<ThreadPoolCore>,
    self_weak: Weak<PooledSequencedTaskRunner>,
}

impl PooledSequencedTaskRunner {
    pub(crate) fn new(
        traits: TaskTraits,
        core: Weak<ThreadPoolCore>,
    ) -> Arc<PooledSequencedTaskRunner> {
        Arc::new_cyclic(|self_weak| PooledSequencedTaskRunner {
            sequence: Sequence::new(traits, TaskSourceExecutionMode::Sequenced),
            core,
            self_weak: self_weak.clone(),
        })
    }

    fn update_priority(&self, priority: TaskPriority) {
        if let Some(core) = self.core.upgrade() {
            core.update_priority(self.sequence.clone(), priority);
        }
    }
}

impl TaskRunner for PooledSequencedTaskRunner {
    fn post_task(&self, task: Task) -> bool {
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        let runner = self.self_weak.upgrade().map(|r| r as Arc<dyn TaskRunner>);
        core.post_task_with_sequence(task, self.sequence.clone(), runner)
    }

    fn runs_tasks_in_current_sequence(&self) -> bool {
        crate::execution_environment::current_sequence_token() == Some(self.sequence.token())
    }
}

impl SequencedTaskRunner for PooledSequencedTaskRunner {}

/// A sequenced runner whose priority may be raised or lowered after creation.  An update affects
/// every task posted to the runner that hasn't started running yet.
pub struct UpdateableSequencedTaskRunner {
    inner: Arc<PooledSequencedTaskRunner>,
}

impl UpdateableSequencedTaskRunner {
    pub(crate) fn new(traits: TaskTraits, core: Weak<ThreadPoolCore>) -> Arc<Self> {
        Arc::new(UpdateableSequencedTaskRunner {
            inner: PooledSequencedTaskRunner::new(traits, core),
        })
    }

    pub fn update_priority(&self, priority: TaskPriority) {
        self.inner.update_priority(priority);
    }
}

impl TaskRunner for UpdateableSequencedTaskRunner {
    fn post_task(&self, task: Task) -> bool {
        self.inner.post_task(task)
    }

    fn runs_tasks_in_current_sequence(&self) -> bool {
        self.inner.runs_tasks_in_current_sequence()
    }
}

impl SequencedTaskRunner for UpdateableSequencedTaskRunner {}
