//! The service thread: runs callbacks when they become ripe.
//!
//! Two kinds of callers use it: delayed task posts (the callback re-enters the pool through the
//! immediate-post path once the delay elapses) and thread groups (periodic polls for workers
//! stuck in may-block scopes).  Time comes from a [`TickClock`] so tests can substitute a mock.
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use pool_synchronization::CheckedLock;
use std::sync::Arc;

use crate::task::DelayPolicy;

/// How far a `FlexibleNoSooner` deadline may be deferred to merge its wake-up with a nearby
/// `Precise` one.  No call ever runs before its own deadline.
const DELAY_LEEWAY: Duration = Duration::from_millis(8);

/// A monotonic clock.  The contract the dispatcher needs: `now_ticks` never goes backwards.
pub trait TickClock: Send + Sync {
    fn now_ticks(&self) -> Instant;
}

/// The production clock.
pub struct DefaultTickClock;

impl TickClock for DefaultTickClock {
    fn now_ticks(&self) -> Instant {
        Instant::now()
    }
}

struct ScheduledCall {
    run_time: Instant,
    /// Breaks run-time ties in scheduling order.
    sequence: u64,
    delay_policy: DelayPolicy,
    callback: Box<dyn FnOnce() + Send>,
}

impl PartialEq for ScheduledCall {
    fn eq(&self, other: &Self) -> bool {
        (self.run_time, self.sequence) == (other.run_time, other.sequence)
    }
}

impl Eq for ScheduledCall {}

impl PartialOrd for ScheduledCall {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledCall {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.run_time, self.sequence).cmp(&(other.run_time, other.sequence))
    }
}

struct ServiceState {
    heap: BinaryHeap<Reverse<ScheduledCall>>,
    next_sequence: u64,
    started: bool,
    shutdown: bool,
    join_handle: Option<JoinHandle<()>>,
}

struct ServiceInner {
    clock: Arc<dyn TickClock>,
    // Leaf lock: schedule() is called with other scheduler locks held (executor flushes).
    state: CheckedLock<ServiceState>,
    wakeup_sender: Sender<()>,
}

/// The time to sleep until, given the earliest flexible and precise deadlines.  A flexible
/// deadline within `DELAY_LEEWAY` of a later precise one is absorbed by it (one wake-up instead
/// of two); otherwise the earlier of the two wins.
fn coalesce_deadlines(flexible: Option<Instant>, precise: Option<Instant>) -> Option<Instant> {
    match (flexible, precise) {
        (None, precise) => precise,
        (Some(flexible), None) => Some(flexible),
        (Some(flexible), Some(precise)) => {
            if precise > flexible && precise <= flexible + DELAY_LEEWAY {
                Some(precise)
            } else {
                Some(flexible.min(precise))
            }
        }
    }
}

impl ServiceInner {
    /// Pops every call that is ripe at `now`.  Returns the ripe calls and the next deadline.
    fn take_ripe_calls(&self, now: Instant) -> (Vec<Box<dyn FnOnce() + Send>>, Option<Instant>) {
        let mut state = self.state.lock();
        let mut ripe: Vec<Box<dyn FnOnce() + Send>> = Vec::new();
        while let Some(Reverse(head)) = state.heap.peek() {
            if head.run_time > now {
                break;
            }
            let Reverse(call) = state.heap.pop().unwrap();
            ripe.push(call.callback);
        }

        let mut earliest_flexible = None;
        let mut earliest_precise = None;
        for Reverse(call) in state.heap.iter() {
            let slot = match call.delay_policy {
                DelayPolicy::FlexibleNoSooner => &mut earliest_flexible,
                DelayPolicy::Precise => &mut earliest_precise,
            };
            if slot.map_or(true, |earliest| call.run_time < earliest) {
                *slot = Some(call.run_time);
            }
        }
        (ripe, coalesce_deadlines(earliest_flexible, earliest_precise))
    }
}

/// Dispatches callbacks at their ripe time from a dedicated service thread.
pub(crate) struct DelayedTaskManager {
    inner: Arc<ServiceInner>,
    wakeup_receiver: Receiver<()>,
}

impl DelayedTaskManager {
    pub(crate) fn new(clock: Arc<dyn TickClock>) -> DelayedTaskManager {
        let (wakeup_sender, wakeup_receiver) = channel::unbounded();
        DelayedTaskManager {
            inner: Arc::new(ServiceInner {
                clock,
                state: CheckedLock::universal_successor(ServiceState {
                    heap: BinaryHeap::new(),
                    next_sequence: 0,
                    started: false,
                    shutdown: false,
                    join_handle: None,
                }),
                wakeup_sender,
            }),
            wakeup_receiver,
        }
    }

    /// Starts the service thread.  Calls scheduled before this are dispatched once it runs.
    pub(crate) fn start(&self) {
        let mut state = self.inner.state.lock();
        if state.started {
            return;
        }
        state.started = true;
        let inner = self.inner.clone();
        let receiver = self.wakeup_receiver.clone();
        let handle = std::thread::Builder::new()
            .name("foreman-service".into())
            .spawn(move || service_thread_main(inner, receiver))
            .expect("failed to spawn the service thread");
        state.join_handle = Some(handle);
    }

    /// Runs `callback` on the service thread once `delay` has elapsed.  Internal periodic work
    /// has no exact deadline, so these calls are flexible.
    pub(crate) fn schedule(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) {
        let run_time = self.inner.clock.now_ticks() + delay;
        self.schedule_at(run_time, DelayPolicy::FlexibleNoSooner, callback);
    }

    pub(crate) fn schedule_at(
        &self,
        run_time: Instant,
        delay_policy: DelayPolicy,
        callback: Box<dyn FnOnce() + Send>,
    ) {
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                // Late arrivals during teardown are dropped, like every other ripe callback that
                // didn't make it.
                return;
            }
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.heap.push(Reverse(ScheduledCall {
                run_time,
                sequence,
                delay_policy,
                callback,
            }));
        }
        let _ = self.inner.wakeup_sender.send(());
    }

    pub(crate) fn next_scheduled_run_time_for_testing(&self) -> Option<Instant> {
        let state = self.inner.state.lock();
        state.heap.peek().map(|Reverse(call)| call.run_time)
    }

    /// Runs every currently-ripe callback on the calling thread.  For tests with a mock clock
    /// that advances faster than real time.
    pub(crate) fn process_ripe_tasks_for_testing(&self) {
        let now = self.inner.clock.now_ticks();
        let (ripe, _next) = self.inner.take_ripe_calls(now);
        for callback in ripe {
            callback();
        }
    }

    /// Stops the service thread and drops pending callbacks.  Idempotent.
    pub(crate) fn shutdown(&self) {
        let handle = {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            state.heap.clear();
            state.join_handle.take()
        };
        let _ = self.inner.wakeup_sender.send(());
        if let Some(handle) = handle {
            handle.join().expect("the service thread does not panic");
        }
    }
}

impl Drop for DelayedTaskManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn service_thread_main(inner: Arc<ServiceInner>, wakeup: Receiver<()>) {
    log::debug!("service thread started");
    loop {
        if inner.state.lock().shutdown {
            break;
        }
        let now = inner.clock.now_ticks();
        let (ripe, next_deadline) = inner.take_ripe_calls(now);
        for callback in ripe {
            callback();
        }

        let wait_result = match next_deadline {
            Some(deadline) => {
                let now = inner.clock.now_ticks();
                if deadline <= now {
                    continue;
                }
                wakeup.recv_timeout(deadline - now)
            }
            None => wakeup
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        match wait_result {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::debug!("service thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn dispatches_in_run_time_order() {
        let manager = DelayedTaskManager::new(Arc::new(DefaultTickClock));
        manager.start();

        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay_ms, tag) in [(60u64, 2), (20, 1), (100, 3)] {
            let order = order.clone();
            manager.schedule(
                Duration::from_millis(delay_ms),
                Box::new(move || order.lock().unwrap().push(tag)),
            );
        }

        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        manager.shutdown();
    }

    #[test]
    fn shutdown_drops_pending_callbacks() {
        let manager = DelayedTaskManager::new(Arc::new(DefaultTickClock));
        manager.start();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        manager.schedule(
            Duration::from_secs(60),
            Box::new(move || {
                fired2.fetch_add(1, Ordering::Relaxed);
            }),
        );
        manager.shutdown();
        assert_eq!(fired.load(Ordering::Relaxed), 0);
        // Scheduling after shutdown is a no-op rather than a crash.
        manager.schedule(Duration::ZERO, Box::new(|| {}));
    }

    #[test]
    fn flexible_deadlines_coalesce_into_a_nearby_precise_wake() {
        let base = Instant::now();
        assert_eq!(coalesce_deadlines(None, Some(base)), Some(base));
        assert_eq!(coalesce_deadlines(Some(base), None), Some(base));

        // A precise wake just past the flexible deadline absorbs it: one wake-up serves both.
        let near_precise = base + DELAY_LEEWAY / 2;
        assert_eq!(coalesce_deadlines(Some(base), Some(near_precise)), Some(near_precise));

        // A precise wake beyond the leeway does not; the flexible deadline wakes on its own.
        let far_precise = base + DELAY_LEEWAY * 4;
        assert_eq!(coalesce_deadlines(Some(base), Some(far_precise)), Some(base));

        // An earlier precise wake wins outright.
        assert_eq!(coalesce_deadlines(Some(far_precise), Some(base)), Some(base));
    }

    #[test]
    fn process_ripe_tasks_runs_inline() {
        struct FrozenClock(Instant);
        impl TickClock for FrozenClock {
            fn now_ticks(&self) -> Instant {
                self.0
            }
        }

        // Never started: everything runs through the testing entry point.
        let manager = DelayedTaskManager::new(Arc::new(FrozenClock(Instant::now())));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        manager.schedule(
            Duration::ZERO,
            Box::new(move || {
                fired2.fetch_add(1, Ordering::Relaxed);
            }),
        );
        let fired3 = fired.clone();
        manager.schedule(
            Duration::from_secs(5),
            Box::new(move || {
                fired3.fetch_add(1, Ordering::Relaxed);
            }),
        );

        manager.process_ripe_tasks_for_testing();
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert_eq!(
            manager.next_scheduled_run_time_for_testing().is_some(),
            true
        );
    }
}
