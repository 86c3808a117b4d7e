//! A mutex which verifies lock acquisition order in debug builds.
//!
//! The scheduler has a small set of locks with a documented partial acquisition order: the task
//! source lock may be held before anything else, thread group locks are leaves, and so on.
//! Violating that order is how scheduler deadlocks happen, and they tend to reproduce once a
//! month on someone else's machine.  `CheckedLock` makes the order explicit: every lock declares
//! its allowed predecessor at construction, and in debug builds each acquisition checks the
//! calling thread's held-lock stack against the declaration and panics on a violation.  In
//! release builds all of the bookkeeping compiles away and this is a plain `Mutex`.
//!
//! Three kinds of locks exist:
//!
//! - A regular lock, optionally constructed with a predecessor.  It may be acquired when no lock
//!   is held, when the most recently acquired lock is its declared predecessor, or when the most
//!   recently acquired lock is a universal predecessor.
//! - A *universal predecessor*, which may only be acquired when no lock is held but allows any
//!   lock to be acquired after it without naming it as a predecessor.  The task source lock is
//!   the universal predecessor in the scheduler.
//! - A *universal successor*, which may be acquired after any other lock (but not after another
//!   universal successor).  Useful for trivial leaf locks.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Identity of a [`CheckedLock`], used to declare predecessors.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LockId(u64);

fn next_lock_id() -> LockId {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    LockId(COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum LockKind {
    /// A regular lock, acquirable when nothing is held or when the top of the held stack is the
    /// declared predecessor (if any) or a universal predecessor.
    Regular { predecessor: Option<LockId> },
    UniversalPredecessor,
    UniversalSuccessor,
}

#[cfg(debug_assertions)]
mod registry {
    //! Per-thread stack of acquired checked locks.
    use super::{LockId, LockKind};
    use std::cell::RefCell;

    thread_local! {
        static HELD_LOCKS: RefCell<Vec<(LockId, LockKind)>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) fn check_acquire(id: LockId, kind: LockKind) {
        HELD_LOCKS.with(|held| {
            let held = held.borrow();
            let top = held.last().copied();
            let allowed = match kind {
                LockKind::Regular { predecessor } => match top {
                    None => true,
                    Some((_, LockKind::UniversalPredecessor)) => true,
                    Some((top_id, _)) => predecessor == Some(top_id),
                },
                LockKind::UniversalPredecessor => top.is_none(),
                LockKind::UniversalSuccessor => {
                    !matches!(top, Some((_, LockKind::UniversalSuccessor)))
                }
            };
            assert!(
                allowed,
                "checked lock {:?} ({:?}) acquired while holding {:?}",
                id, kind, *held
            );
        });
    }

    pub(super) fn push(id: LockId, kind: LockKind) {
        HELD_LOCKS.with(|held| held.borrow_mut().push((id, kind)));
    }

    pub(super) fn pop(id: LockId) {
        HELD_LOCKS.with(|held| {
            let popped = held.borrow_mut().pop();
            assert_eq!(
                popped.map(|(popped_id, _)| popped_id),
                Some(id),
                "checked locks released out of acquisition order"
            );
        });
    }

    pub(super) fn assert_none_held() {
        HELD_LOCKS.with(|held| {
            let held = held.borrow();
            assert!(held.is_empty(), "checked lock(s) unexpectedly held: {:?}", *held);
        });
    }
}

/// A mutex protecting `T`, with debug-only acquisition order checking.
pub struct CheckedLock<T> {
    id: LockId,
    kind: LockKind,
    mutex: Mutex<T>,
}

impl<T> CheckedLock<T> {
    /// A lock with no declared predecessor: it must be the first (non-universal-predecessor) lock
    /// acquired by a thread.
    pub fn new(value: T) -> Self {
        Self::with_kind(value, LockKind::Regular { predecessor: None })
    }

    /// A lock which may be acquired while `predecessor` is held.
    pub fn with_predecessor(value: T, predecessor: LockId) -> Self {
        Self::with_kind(
            value,
            LockKind::Regular {
                predecessor: Some(predecessor),
            },
        )
    }

    /// A lock which may precede any other lock, but must itself be acquired first.
    pub fn universal_predecessor(value: T) -> Self {
        Self::with_kind(value, LockKind::UniversalPredecessor)
    }

    /// A trivial leaf lock which may follow any other lock.
    pub fn universal_successor(value: T) -> Self {
        Self::with_kind(value, LockKind::UniversalSuccessor)
    }

    fn with_kind(value: T, kind: LockKind) -> Self {
        Self {
            id: next_lock_id(),
            kind,
            mutex: Mutex::new(value),
        }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    pub fn lock(&self) -> CheckedLockGuard<'_, T> {
        #[cfg(debug_assertions)]
        registry::check_acquire(self.id, self.kind);
        let guard = self.mutex.lock().unwrap();
        #[cfg(debug_assertions)]
        registry::push(self.id, self.kind);
        CheckedLockGuard {
            guard: Some(guard),
            lock: self,
        }
    }

    /// Panics in debug builds if the calling thread holds any checked lock.  Called before
    /// operations that block or call out of the scheduler (thread start, event signal).
    pub fn assert_no_lock_held_on_current_thread() {
        #[cfg(debug_assertions)]
        registry::assert_none_held();
    }
}

/// RAII guard for [`CheckedLock`].  Releasing guards out of acquisition order is a bug and panics
/// in debug builds.
pub struct CheckedLockGuard<'a, T> {
    // `Option` so that a condvar wait can temporarily take the inner guard.
    guard: Option<MutexGuard<'a, T>>,
    lock: &'a CheckedLock<T>,
}

impl<T> std::ops::Deref for CheckedLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T> std::ops::DerefMut for CheckedLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<T> Drop for CheckedLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release the mutex before updating the registry so the registry never claims a lock is
        // held after another thread could have acquired it.
        self.guard = None;
        #[cfg(debug_assertions)]
        registry::pop(self.lock.id);
        #[cfg(not(debug_assertions))]
        let _ = self.lock;
    }
}

/// Condition variable usable with [`CheckedLockGuard`].
///
/// While waiting, the mutex is released by the OS but the lock remains on the thread's held-lock
/// stack: from an ordering perspective the waiter still "owns" its position, and the locks it was
/// allowed to hold before the wait are exactly the ones it holds after.
#[derive(Default)]
pub struct CheckedCondvar {
    condvar: Condvar,
}

impl CheckedCondvar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait<'a, T>(&self, mut guard: CheckedLockGuard<'a, T>) -> CheckedLockGuard<'a, T> {
        let inner = guard.guard.take().unwrap();
        guard.guard = Some(self.condvar.wait(inner).unwrap());
        guard
    }

    /// Waits until notified or until `timeout` elapses.  Returns the guard and whether the wait
    /// timed out.
    pub fn wait_timeout<'a, T>(
        &self,
        mut guard: CheckedLockGuard<'a, T>,
        timeout: Duration,
    ) -> (CheckedLockGuard<'a, T>, bool) {
        let inner = guard.guard.take().unwrap();
        let (inner, result) = self.condvar.wait_timeout(inner, timeout).unwrap();
        guard.guard = Some(inner);
        (guard, result.timed_out())
    }

    pub fn notify_one(&self) {
        self.condvar.notify_one();
    }

    pub fn notify_all(&self) {
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_relock() {
        let lock = CheckedLock::new(5);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn predecessor_order_is_allowed() {
        let first = CheckedLock::universal_predecessor(());
        let second = CheckedLock::new(());
        let third = CheckedLock::with_predecessor((), second.id());

        let _a = first.lock();
        let _b = second.lock();
        let _c = third.lock();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "acquired while holding")]
    fn undeclared_second_lock_panics() {
        let first = CheckedLock::new(());
        let second = CheckedLock::new(());
        let _a = first.lock();
        let _b = second.lock();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "acquired while holding")]
    fn universal_predecessor_must_come_first() {
        let regular = CheckedLock::new(());
        let universal = CheckedLock::universal_predecessor(());
        let _a = regular.lock();
        let _b = universal.lock();
    }

    #[test]
    fn universal_successor_follows_anything() {
        let regular = CheckedLock::new(());
        let leaf = CheckedLock::universal_successor(());
        let _a = regular.lock();
        let _b = leaf.lock();
    }

    #[test]
    fn condvar_roundtrip() {
        use std::sync::Arc;

        struct Shared {
            lock: CheckedLock<bool>,
            condvar: CheckedCondvar,
        }

        let shared = Arc::new(Shared {
            lock: CheckedLock::new(false),
            condvar: CheckedCondvar::new(),
        });

        let shared2 = shared.clone();
        let handle = std::thread::spawn(move || {
            let mut guard = shared2.lock.lock();
            while !*guard {
                guard = shared2.condvar.wait(guard);
            }
        });

        {
            let mut guard = shared.lock.lock();
            *guard = true;
        }
        shared.condvar.notify_one();
        handle.join().unwrap();
    }

    #[test]
    fn condvar_wait_timeout_times_out() {
        let lock = CheckedLock::new(());
        let condvar = CheckedCondvar::new();
        let guard = lock.lock();
        let (_guard, timed_out) = condvar.wait_timeout(guard, Duration::from_millis(10));
        assert!(timed_out);
    }
}
