//! An event a thread can wait on until another thread signals it.
//!
//! This is the wake-up primitive for worker threads.  Each pooled worker owns an
//! automatically-resetting event: the scheduler signals it to hand the worker a wake-up token,
//! and the worker's wait consumes the token.  Signaling an already-signaled auto-reset event is a
//! no-op, which is what makes redundant wake-ups harmless (the worker observes at most one token
//! and records at most one unnecessary wake-up).
//!
//! A manually-resetting event stays signaled until [`WaitableEvent::reset`] is called and wakes
//! every waiter; the scheduler uses that flavor for one-shot latches such as "shutdown has
//! completed".
//!
//! Timed waits are not available under loom (loom's condvar cannot model them), matching the rest
//! of this crate: the timed paths are only exercised by the real-clock tests.
use crate::sync::{Condvar, Mutex};

#[cfg(not(loom))]
use std::time::{Duration, Instant};

/// Whether a wait consumes the signaled state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResetPolicy {
    /// The event stays signaled until `reset()`; `signal()` wakes all waiters.
    Manual,
    /// A single wait consumes the signal; `signal()` wakes at most one waiter.
    Automatic,
}

pub struct WaitableEvent {
    policy: ResetPolicy,
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl WaitableEvent {
    pub fn new(policy: ResetPolicy) -> Self {
        Self {
            policy,
            signaled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Puts the event in the signaled state, waking waiters.
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        if *signaled {
            return;
        }
        *signaled = true;
        drop(signaled);
        match self.policy {
            ResetPolicy::Manual => self.condvar.notify_all(),
            ResetPolicy::Automatic => self.condvar.notify_one(),
        }
    }

    /// Puts the event in the unsignaled state.
    pub fn reset(&self) {
        *self.signaled.lock().unwrap() = false;
    }

    /// Returns whether the event is signaled.  For an auto-reset event a `true` return consumes
    /// the signal, exactly as a wait would.
    pub fn is_signaled(&self) -> bool {
        let mut signaled = self.signaled.lock().unwrap();
        let was = *signaled;
        if was && self.policy == ResetPolicy::Automatic {
            *signaled = false;
        }
        was
    }

    /// Blocks until the event is signaled.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.condvar.wait(signaled).unwrap();
        }
        if self.policy == ResetPolicy::Automatic {
            *signaled = false;
        }
    }

    /// Blocks until the event is signaled or `timeout` elapses.  Returns true if the event was
    /// signaled (and, for auto-reset, consumed).
    #[cfg(not(loom))]
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now()
            .checked_add(timeout)
            .expect("unable to compute a deadline from the timeout");
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _timed_out) = self
                .condvar
                .wait_timeout(signaled, deadline - now)
                .unwrap();
            signaled = guard;
        }
        if self.policy == ResetPolicy::Automatic {
            *signaled = false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::sync::*;

    #[test]
    fn signal_wakes_waiter() {
        wrap_test(|| {
            let event = std::sync::Arc::new(WaitableEvent::new(ResetPolicy::Automatic));
            let event2 = event.clone();
            let waiter = spawn(move || event2.wait());
            event.signal();
            waiter.join().unwrap();
        });
    }

    #[test]
    fn manual_reset_wakes_all_waiters() {
        wrap_test(|| {
            let event = std::sync::Arc::new(WaitableEvent::new(ResetPolicy::Manual));
            let waiters: Vec<JoinHandle<()>> = (0..2)
                .map(|_| {
                    let event = event.clone();
                    spawn(move || event.wait())
                })
                .collect();
            event.signal();
            for waiter in waiters {
                waiter.join().unwrap();
            }
            // Still signaled until reset.
            assert!(event.is_signaled());
        });
    }
}

#[cfg(all(test, not(loom)))]
mod not_loom_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn auto_reset_consumes_signal() {
        let event = WaitableEvent::new(ResetPolicy::Automatic);
        event.signal();
        event.signal();
        assert_eq!(event.is_signaled(), true);
        // The first check consumed the one token.
        assert_eq!(event.is_signaled(), false);
    }

    #[test]
    fn timed_wait_times_out() {
        let event = WaitableEvent::new(ResetPolicy::Automatic);
        assert!(!event.timed_wait(Duration::from_millis(20)));
    }

    #[test]
    fn timed_wait_observes_signal() {
        let event = WaitableEvent::new(ResetPolicy::Automatic);
        event.signal();
        assert!(event.timed_wait(Duration::from_secs(5)));
        assert!(!event.is_signaled());
    }

    #[test]
    fn manual_reset_reset_unsignals() {
        let event = WaitableEvent::new(ResetPolicy::Manual);
        event.signal();
        assert!(event.is_signaled());
        event.reset();
        assert!(!event.is_signaled());
    }
}
