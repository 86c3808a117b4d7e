//! Primitives for synchronization inside a thread-pool scheduler.
//!
//! This crate provides the small set of blocking primitives the scheduler is built on, kept apart
//! from the scheduler itself so that they can be tested (and model-checked with loom) in
//! isolation:
//!
//! - [`CheckedLock`], a mutex which verifies a declared lock acquisition order in debug builds and
//!   compiles down to a plain mutex in release builds.  Deadlocks between scheduler locks are bugs
//!   of the "wrong acquisition order" kind almost exclusively, and the checked lock turns them
//!   into instant panics with a message instead of rare hangs.
//! - [`CheckedCondvar`], the condition variable companion of [`CheckedLock`].
//! - [`WaitableEvent`], a manually-or-automatically resetting event with timed waits, which is the
//!   wake-up primitive for worker threads.
//!
//! Nothing in here knows about tasks or queues; the dependency only goes the other way.
pub mod checked_lock;
pub mod sync;
pub mod waitable_event;

pub use checked_lock::{CheckedCondvar, CheckedLock, CheckedLockGuard, LockId};
pub use waitable_event::{ResetPolicy, WaitableEvent};
