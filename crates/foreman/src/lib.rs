#![allow(dead_code)]

//! Foreman: a general-purpose, in-process thread-pool scheduler.
//!
//! Heterogeneous units of work (one-off tasks, ordered sequences, cooperative parallel jobs)
//! are executed on groups of worker threads (foreground, utility, background) multiplexed over
//! priority queues.  A process-wide tracker gates admission and drives multi-phase shutdown;
//! blocking-aware concurrency adjustment keeps a group's throughput up while its tasks sit in
//! I/O; a companion manager serves out dedicated and shared single-thread workers.
//!
//! The entry point is [`ThreadPool`]: construct, `start`, then post through it or through the
//! task runners it hands out.
mod blocking;
mod delayed_task_manager;
mod error;
mod execution_environment;
mod job_task_source;
mod priority_queue;
mod sequence;
mod single_thread_runner_manager;
mod sort_key;
mod task;
mod task_runner;
mod task_source;
mod task_tracker;
mod task_traits;
mod thread_group;
mod thread_pool;
mod work_tracker;
mod worker;

pub use blocking::{BlockingType, ScopedBlockingCall};
pub use delayed_task_manager::{DefaultTickClock, TickClock};
pub use error::{Error, Result};
pub use execution_environment::{
    current_sequence_token, current_task_priority, with_sequence_local_storage,
    SequenceLocalStorageMap, SequenceToken,
};
pub use job_task_source::{JobDelegate, JobHandle};
pub use single_thread_runner_manager::{
    PooledSingleThreadTaskRunner, SingleThreadTaskRunnerThreadMode,
};
pub use task::{DelayPolicy, Task};
pub use task_runner::{
    SequencedTaskRunner, SingleThreadTaskRunner, TaskRunner, TaskRunnerExt,
    UpdateableSequencedTaskRunner,
};
pub use task_source::TaskSourceExecutionMode;
pub use task_traits::{TaskPriority, TaskShutdownBehavior, TaskTraits, ThreadPolicy};
pub use thread_pool::{CommonThreadPoolEnvironment, InitParams, ThreadPool};
pub use worker::WorkerThreadObserver;
