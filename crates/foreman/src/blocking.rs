//! Blocking-scope annotations.
//!
//! A task that is about to block (file I/O, waiting on a lock held outside the pool, an external
//! process) wraps the blocking region in a [`ScopedBlockingCall`].  The worker running the task
//! observes the scope through a thread-local observer and compensates: the thread group may raise
//! its concurrency limit so that the blocked thread doesn't consume a run slot.
use std::cell::Cell;
use std::sync::Arc;

/// How certain the caller is that the scope will block.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub enum BlockingType {
    /// The call *may* block; the scheduler waits for a threshold before compensating.
    MayBlock,
    /// The call *will* block promptly; the scheduler compensates immediately.
    WillBlock,
}

/// Observer installed by a worker for the duration of its main loop.
pub(crate) trait BlockingObserver: Send + Sync {
    /// A blocking scope was entered on the observed thread (outermost only).
    fn blocking_started(&self, blocking_type: BlockingType);
    /// A `WillBlock` scope was nested inside a `MayBlock` scope.  May be delivered more than
    /// once per outer scope; implementations must be idempotent.
    fn blocking_type_upgraded(&self);
    /// The outermost blocking scope ended.
    fn blocking_ended(&self);
}

thread_local! {
    static BLOCKING_OBSERVER: Cell<Option<Arc<dyn BlockingObserver>>> = const { Cell::new(None) };
    /// Effective blocking type of the current (outermost) scope, if any.
    static CURRENT_BLOCKING_TYPE: Cell<Option<BlockingType>> = const { Cell::new(None) };
}

fn with_observer(f: impl FnOnce(&Arc<dyn BlockingObserver>)) {
    BLOCKING_OBSERVER.with(|slot| {
        let observer = slot.take();
        if let Some(ref observer) = observer {
            f(observer);
        }
        slot.set(observer);
    });
}

/// Registers `observer` on the current thread.  Invalid while a blocking scope is active.
pub(crate) fn set_blocking_observer_for_current_thread(observer: Arc<dyn BlockingObserver>) {
    debug_assert!(CURRENT_BLOCKING_TYPE.with(Cell::get).is_none());
    BLOCKING_OBSERVER.with(|slot| slot.set(Some(observer)));
}

pub(crate) fn clear_blocking_observer_for_current_thread() {
    BLOCKING_OBSERVER.with(|slot| slot.set(None));
}

/// Marks a region of a task during which the thread is known (or expected) to block.
///
/// Nesting is supported: only the outermost scope notifies the observer, except that a
/// `WillBlock` nested in a `MayBlock` upgrades the outer scope once.
pub struct ScopedBlockingCall {
    previous: Option<BlockingType>,
}

impl ScopedBlockingCall {
    pub fn new(blocking_type: BlockingType) -> ScopedBlockingCall {
        let previous = CURRENT_BLOCKING_TYPE.with(Cell::get);
        match previous {
            None => with_observer(|observer| observer.blocking_started(blocking_type)),
            Some(BlockingType::MayBlock) if blocking_type == BlockingType::WillBlock => {
                with_observer(|observer| observer.blocking_type_upgraded());
            }
            Some(_) => {}
        }
        let effective = previous.map_or(blocking_type, |p| p.max(blocking_type));
        CURRENT_BLOCKING_TYPE.with(|current| current.set(Some(effective)));
        ScopedBlockingCall { previous }
    }
}

impl Drop for ScopedBlockingCall {
    fn drop(&mut self) {
        CURRENT_BLOCKING_TYPE.with(|current| current.set(self.previous));
        if self.previous.is_none() {
            with_observer(|observer| observer.blocking_ended());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<String>>,
    }

    impl BlockingObserver for RecordingObserver {
        fn blocking_started(&self, blocking_type: BlockingType) {
            self.events
                .lock()
                .unwrap()
                .push(format!("started:{blocking_type:?}"));
        }

        fn blocking_type_upgraded(&self) {
            self.events.lock().unwrap().push("upgraded".into());
        }

        fn blocking_ended(&self) {
            self.events.lock().unwrap().push("ended".into());
        }
    }

    fn with_recording_observer(f: impl FnOnce()) -> Vec<String> {
        let observer = Arc::new(RecordingObserver::default());
        set_blocking_observer_for_current_thread(observer.clone());
        f();
        clear_blocking_observer_for_current_thread();
        let events = observer.events.lock().unwrap().clone();
        events
    }

    #[test]
    fn outermost_scope_notifies() {
        let events = with_recording_observer(|| {
            let _scope = ScopedBlockingCall::new(BlockingType::MayBlock);
        });
        assert_eq!(events, vec!["started:MayBlock", "ended"]);
    }

    #[test]
    fn nested_same_type_is_silent() {
        let events = with_recording_observer(|| {
            let _outer = ScopedBlockingCall::new(BlockingType::WillBlock);
            let _inner = ScopedBlockingCall::new(BlockingType::WillBlock);
        });
        assert_eq!(events, vec!["started:WillBlock", "ended"]);
    }

    #[test]
    fn will_block_nested_in_may_block_upgrades() {
        let events = with_recording_observer(|| {
            let _outer = ScopedBlockingCall::new(BlockingType::MayBlock);
            let _inner = ScopedBlockingCall::new(BlockingType::WillBlock);
            // Deeper WillBlock scopes are silent: the effective type is already WillBlock.
            let _deeper = ScopedBlockingCall::new(BlockingType::WillBlock);
        });
        assert_eq!(events, vec!["started:MayBlock", "upgraded", "ended"]);
    }

    #[test]
    fn no_observer_is_fine() {
        clear_blocking_observer_for_current_thread();
        let _scope = ScopedBlockingCall::new(BlockingType::WillBlock);
    }
}
