//! Tracks queued and running work to support running a callback synchronously, inline on the
//! caller's thread, when and only when the scheduler has nothing to do.
//!
//! A synchronous run must be sequenced with all prior and future work: it may only start when the
//! queues are empty and nothing is running, and no new work may begin until the authorization is
//! released.  All of that is carried by a single atomic word; the lock and condvar below exist
//! only for the two places that must *wait* for an authorization to be released.
//!
//! Memory ordering on the state word, per operation:
//!
//! - Operations that may *allow* sync work are release: setting "queues empty and no work
//!   running", setting "sync work supported".
//! - Operations that may *allow* non-sync work are release: clearing "active sync work" when an
//!   authorization drops.
//! - Operations that *precede* sync work are acquire: setting "active sync work".
//! - Operations that *precede* non-sync work are acquire: observing that "active sync work" is
//!   clear in `on_begin_work`.
use std::sync::atomic::{AtomicU32, Ordering};

use pool_synchronization::{CheckedCondvar, CheckedLock};

/// An unfulfilled request to reload an empty immediate work queue exists.
const IMMEDIATE_WORK_QUEUE_NEEDS_RELOAD: u32 = 1 << 0;
/// All work queues are empty and no work is running.
const WORK_QUEUES_EMPTY_AND_NO_WORK_RUNNING: u32 = 1 << 1;
/// A valid `SyncWorkAuthorization` exists.
const ACTIVE_SYNC_WORK: u32 = 1 << 2;
/// Sync work may be granted when nothing else is tracked.
const SYNC_WORK_SUPPORTED: u32 = 1 << 3;

pub(crate) struct WorkTracker {
    state: AtomicU32,
    /// Allows `on_begin_work` and `set_run_task_synchronously_allowed(false)` to wait until
    /// there is no more valid authorization.
    active_sync_work_lock: CheckedLock<()>,
    active_sync_work_cv: CheckedCondvar,
}

impl WorkTracker {
    pub(crate) fn new() -> WorkTracker {
        WorkTracker {
            state: AtomicU32::new(WORK_QUEUES_EMPTY_AND_NO_WORK_RUNNING),
            active_sync_work_lock: CheckedLock::new(()),
            active_sync_work_cv: CheckedCondvar::new(),
        }
    }

    /// Controls whether synchronous runs may be authorized at all.  Turning this off waits for an
    /// outstanding authorization to be released, and acquires the memory it published.
    pub(crate) fn set_run_task_synchronously_allowed(&self, allowed: bool) {
        if allowed {
            self.state.fetch_or(SYNC_WORK_SUPPORTED, Ordering::Release);
        } else {
            let prev = self.state.fetch_and(!SYNC_WORK_SUPPORTED, Ordering::Acquire);
            if prev & ACTIVE_SYNC_WORK != 0 {
                self.wait_no_sync_work();
            }
        }
    }

    /// Invoked before requesting a reload of an empty immediate work queue; disallows sync work
    /// until the reload happens and the thread goes idle again.
    pub(crate) fn will_request_reload_immediate_work_queue(&self) {
        self.state
            .fetch_or(IMMEDIATE_WORK_QUEUE_NEEDS_RELOAD, Ordering::Relaxed);
    }

    /// Invoked before reloading empty immediate work queues.
    pub(crate) fn will_reload_immediate_work_queues(&self) {
        self.state.fetch_and(
            !(IMMEDIATE_WORK_QUEUE_NEEDS_RELOAD | WORK_QUEUES_EMPTY_AND_NO_WORK_RUNNING),
            Ordering::Relaxed,
        );
    }

    /// Invoked before doing work.  Waits for an active authorization to drop, and acquires the
    /// memory written by that sync work.
    pub(crate) fn on_begin_work(&self) {
        let prev = self
            .state
            .fetch_and(!WORK_QUEUES_EMPTY_AND_NO_WORK_RUNNING, Ordering::Acquire);
        if prev & ACTIVE_SYNC_WORK != 0 {
            debug_assert!(prev & SYNC_WORK_SUPPORTED != 0);
            self.wait_no_sync_work();
        }
    }

    /// Invoked when the thread is out of work.  Release, so sync work that runs after this sees
    /// all writes issued by previously sequenced work.
    pub(crate) fn on_idle(&self) {
        self.state
            .fetch_or(WORK_QUEUES_EMPTY_AND_NO_WORK_RUNNING, Ordering::Release);
    }

    /// Grants an authorization iff sync work is supported, the queues are empty, nothing is
    /// running, and no reload is pending.
    pub(crate) fn try_acquire_sync_work_authorization(&self) -> SyncWorkAuthorization<'_> {
        let state = self.state.load(Ordering::Relaxed);
        // Acquire so that sync work sees writes issued by the sequenced work that preceded it.
        if state == (SYNC_WORK_SUPPORTED | WORK_QUEUES_EMPTY_AND_NO_WORK_RUNNING)
            && self
                .state
                .compare_exchange(
                    state,
                    state | ACTIVE_SYNC_WORK,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
        {
            return SyncWorkAuthorization {
                tracker: Some(self),
            };
        }
        SyncWorkAuthorization { tracker: None }
    }

    fn wait_no_sync_work(&self) {
        // Relaxed is enough here: the lock acquisition orders this read after the release in
        // `SyncWorkAuthorization::drop`, which holds the same lock.
        let mut guard = self.active_sync_work_lock.lock();
        let mut state = self.state.load(Ordering::Relaxed);
        while state & ACTIVE_SYNC_WORK != 0 {
            guard = self.active_sync_work_cv.wait(guard);
            state = self.state.load(Ordering::Relaxed);
        }
    }
}

/// Permission to run a callback inline with sequencing guarantees equivalent to posting it.
/// Releasing the token (dropping it) re-opens the scheduler for regular work.
pub(crate) struct SyncWorkAuthorization<'a> {
    tracker: Option<&'a WorkTracker>,
}

impl SyncWorkAuthorization<'_> {
    pub(crate) fn is_valid(&self) -> bool {
        self.tracker.is_some()
    }
}

impl Drop for SyncWorkAuthorization<'_> {
    fn drop(&mut self) {
        let Some(tracker) = self.tracker.take() else {
            return;
        };
        {
            let _guard = tracker.active_sync_work_lock.lock();
            let prev = tracker
                .state
                .fetch_and(!ACTIVE_SYNC_WORK, Ordering::Release);
            debug_assert!(prev & ACTIVE_SYNC_WORK != 0);
        }
        tracker.active_sync_work_cv.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn authorization_requires_support_and_idleness() {
        let tracker = WorkTracker::new();
        // Idle but not supported.
        assert!(!tracker.try_acquire_sync_work_authorization().is_valid());

        tracker.set_run_task_synchronously_allowed(true);
        assert!(tracker.try_acquire_sync_work_authorization().is_valid());

        // Work in flight: no authorization.
        tracker.on_begin_work();
        assert!(!tracker.try_acquire_sync_work_authorization().is_valid());
        tracker.on_idle();
        assert!(tracker.try_acquire_sync_work_authorization().is_valid());

        // Pending reload: no authorization until the reload and the next idle.
        tracker.will_request_reload_immediate_work_queue();
        assert!(!tracker.try_acquire_sync_work_authorization().is_valid());
        tracker.will_reload_immediate_work_queues();
        assert!(!tracker.try_acquire_sync_work_authorization().is_valid());
        tracker.on_idle();
        assert!(tracker.try_acquire_sync_work_authorization().is_valid());
    }

    #[test]
    fn only_one_authorization_at_a_time() {
        let tracker = WorkTracker::new();
        tracker.set_run_task_synchronously_allowed(true);
        let first = tracker.try_acquire_sync_work_authorization();
        assert!(first.is_valid());
        assert!(!tracker.try_acquire_sync_work_authorization().is_valid());
        drop(first);
        assert!(tracker.try_acquire_sync_work_authorization().is_valid());
    }

    #[test]
    fn on_begin_work_waits_for_authorization_release() {
        let tracker = Arc::new(WorkTracker::new());
        tracker.set_run_task_synchronously_allowed(true);
        let authorization = tracker.try_acquire_sync_work_authorization();
        assert!(authorization.is_valid());

        let began = Arc::new(AtomicBool::new(false));
        let tracker2 = tracker.clone();
        let began2 = began.clone();
        let worker = std::thread::spawn(move || {
            tracker2.on_begin_work();
            began2.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!began.load(Ordering::SeqCst));
        drop(authorization);
        worker.join().unwrap();
        assert!(began.load(Ordering::SeqCst));
    }

    #[test]
    fn disallowing_sync_work_waits_for_release() {
        let tracker = Arc::new(WorkTracker::new());
        tracker.set_run_task_synchronously_allowed(true);

        // Round-trip on an idle tracker leaves both flags clear.
        tracker.set_run_task_synchronously_allowed(false);
        assert_eq!(
            tracker.state.load(Ordering::Relaxed),
            WORK_QUEUES_EMPTY_AND_NO_WORK_RUNNING
        );
    }
}
