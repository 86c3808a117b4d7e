//! The unit of work given to the pool: a closure plus timing metadata.
use std::panic::Location;
use std::time::{Duration, Instant};

/// How strictly a delayed task's run time should be honored.  The dispatcher may coalesce
/// flexible deadlines to reduce wake-ups; precise deadlines are honored as given.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum DelayPolicy {
    #[default]
    FlexibleNoSooner,
    Precise,
}

/// A posted unit of work.
///
/// Ownership moves caller → task source → worker, and the closure is consumed when it runs.  A
/// task that fails admission must not simply be dropped on the posting thread: its closure may
/// own state whose destructor is affine to another sequence.  [`Task::leak`] exists for that
/// case.
pub struct Task {
    pub(crate) closure: Box<dyn FnOnce() + Send>,
    /// Where the task was posted from.
    pub(crate) posted_from: &'static Location<'static>,
    /// When the task entered the system.
    pub(crate) queue_time: Instant,
    pub(crate) delayed_run_time: Option<Instant>,
    pub(crate) delay_policy: DelayPolicy,
    /// Assigned by the tracker when the post is admitted.
    pub(crate) sequence_num: u64,
}

impl Task {
    /// An immediate task.
    #[track_caller]
    pub fn new(closure: impl FnOnce() + Send + 'static) -> Task {
        Self::from_parts(Box::new(closure), None, DelayPolicy::default())
    }

    /// A task that becomes ripe `delay` from now.  A zero delay is an immediate task.
    #[track_caller]
    pub fn with_delay(closure: impl FnOnce() + Send + 'static, delay: Duration) -> Task {
        Self::with_delay_and_policy(closure, delay, DelayPolicy::default())
    }

    /// Like [`Task::with_delay`], with an explicit delay policy.  A `Precise` deadline is honored
    /// as given; a `FlexibleNoSooner` deadline may be deferred slightly so the dispatcher can
    /// coalesce wake-ups.
    #[track_caller]
    pub fn with_delay_and_policy(
        closure: impl FnOnce() + Send + 'static,
        delay: Duration,
        delay_policy: DelayPolicy,
    ) -> Task {
        let delayed_run_time = if delay.is_zero() {
            None
        } else {
            Some(Instant::now() + delay)
        };
        Self::from_parts(Box::new(closure), delayed_run_time, delay_policy)
    }

    #[track_caller]
    pub(crate) fn from_parts(
        closure: Box<dyn FnOnce() + Send>,
        delayed_run_time: Option<Instant>,
        delay_policy: DelayPolicy,
    ) -> Task {
        Task {
            closure,
            posted_from: Location::caller(),
            queue_time: Instant::now(),
            delayed_run_time,
            delay_policy,
            sequence_num: 0,
        }
    }

    pub(crate) fn is_delayed(&self) -> bool {
        self.delayed_run_time.is_some()
    }

    /// Intentionally leaks a task that failed admission.  Running the closure's destructor here
    /// could execute sequence-affine code on the wrong thread; leaking is the lesser evil and
    /// only ever happens on the shutdown reject path.
    pub(crate) fn leak(task: Task) {
        std::mem::forget(task.closure);
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("posted_from", &format_args!("{}", self.posted_from))
            .field("delayed_run_time", &self.delayed_run_time)
            .field("delay_policy", &self.delay_policy)
            .field("sequence_num", &self.sequence_num)
            .finish_non_exhaustive()
    }
}
