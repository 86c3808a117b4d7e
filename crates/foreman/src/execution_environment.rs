//! Per-task scoped state: the current sequence token, sequence-local storage, and the priority of
//! the task being run.
//!
//! Workers install a [`ScopedTaskEnvironment`] around every task they run.  The guard writes the
//! task's sequence identity into thread-local slots and restores the previous values on drop, so
//! the slots are correct even when a task panics and unwinds through the guard.
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::task_traits::TaskPriority;

/// A process-wide unique ID for a sequence.
///
/// Two tasks observe the same token iff they are part of the same sequence; parallel one-off
/// tasks each get a fresh token.  Contains a niche so `Option<SequenceToken>` costs nothing.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct SequenceToken(NonZeroU64);

impl SequenceToken {
    pub(crate) fn new() -> SequenceToken {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let got = COUNTER.fetch_add(1, Ordering::Relaxed);
        SequenceToken(NonZeroU64::new(got + 1).unwrap())
    }
}

/// Values scoped to a sequence rather than to a thread.  Keys are caller-chosen; a slot holds any
/// sendable value.
#[derive(Default)]
pub struct SequenceLocalStorageMap {
    slots: HashMap<u64, Box<dyn Any + Send>>,
}

impl SequenceLocalStorageMap {
    pub fn set<T: Any + Send>(&mut self, key: u64, value: T) {
        self.slots.insert(key, Box::new(value));
    }

    pub fn get<T: Any + Send>(&self, key: u64) -> Option<&T> {
        self.slots.get(&key).and_then(|v| v.downcast_ref())
    }

    pub fn get_mut<T: Any + Send>(&mut self, key: u64) -> Option<&mut T> {
        self.slots.get_mut(&key).and_then(|v| v.downcast_mut())
    }

    pub fn remove(&mut self, key: u64) -> bool {
        self.slots.remove(&key).is_some()
    }
}

/// The environment a task source hands to the tracker for the duration of a task.
#[derive(Clone)]
pub(crate) struct ExecutionEnvironment {
    pub(crate) token: SequenceToken,
    /// Absent for sources with no sequence-local state (cooperative jobs).
    pub(crate) storage: Option<Arc<Mutex<SequenceLocalStorageMap>>>,
}

struct TlsEnvironment {
    token: Option<SequenceToken>,
    storage: Option<Arc<Mutex<SequenceLocalStorageMap>>>,
    priority: Option<TaskPriority>,
}

thread_local! {
    static CURRENT_ENVIRONMENT: RefCell<TlsEnvironment> = const {
        RefCell::new(TlsEnvironment { token: None, storage: None, priority: None })
    };
}

/// The token of the sequence whose task is running on this thread, if any.
pub fn current_sequence_token() -> Option<SequenceToken> {
    CURRENT_ENVIRONMENT.with(|e| e.borrow().token)
}

/// The priority of the task running on this thread, if any.
pub fn current_task_priority() -> Option<TaskPriority> {
    CURRENT_ENVIRONMENT.with(|e| e.borrow().priority)
}

/// Runs `f` with the current sequence's local storage.  Returns `None` when the calling thread is
/// not running a sequenced task.
pub fn with_sequence_local_storage<R>(
    f: impl FnOnce(&mut SequenceLocalStorageMap) -> R,
) -> Option<R> {
    let storage = CURRENT_ENVIRONMENT.with(|e| e.borrow().storage.clone())?;
    let mut storage = storage.lock().unwrap();
    Some(f(&mut storage))
}

/// Installs a task's environment into TLS; restores the previous environment on drop, on every
/// exit path.
pub(crate) struct ScopedTaskEnvironment {
    previous: Option<TlsEnvironment>,
}

impl ScopedTaskEnvironment {
    pub(crate) fn new(
        environment: Option<ExecutionEnvironment>,
        priority: TaskPriority,
    ) -> ScopedTaskEnvironment {
        let new_state = TlsEnvironment {
            token: environment.as_ref().map(|e| e.token),
            storage: environment.and_then(|e| e.storage),
            priority: Some(priority),
        };
        let previous = CURRENT_ENVIRONMENT.with(|e| e.replace(new_state));
        ScopedTaskEnvironment {
            previous: Some(previous),
        }
    }
}

impl Drop for ScopedTaskEnvironment {
    fn drop(&mut self) {
        let previous = self.previous.take().unwrap();
        CURRENT_ENVIRONMENT.with(|e| *e.borrow_mut() = previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique() {
        assert_ne!(SequenceToken::new(), SequenceToken::new());
    }

    #[test]
    fn environment_scopes_and_restores() {
        assert_eq!(current_sequence_token(), None);
        assert_eq!(current_task_priority(), None);

        let token = SequenceToken::new();
        let storage = Arc::new(Mutex::new(SequenceLocalStorageMap::default()));
        {
            let _env = ScopedTaskEnvironment::new(
                Some(ExecutionEnvironment {
                    token,
                    storage: Some(storage),
                }),
                TaskPriority::UserBlocking,
            );
            assert_eq!(current_sequence_token(), Some(token));
            assert_eq!(current_task_priority(), Some(TaskPriority::UserBlocking));

            with_sequence_local_storage(|s| s.set(7, String::from("seven"))).unwrap();
            let read =
                with_sequence_local_storage(|s| s.get::<String>(7).cloned()).unwrap();
            assert_eq!(read.as_deref(), Some("seven"));
        }
        assert_eq!(current_sequence_token(), None);
        assert_eq!(current_task_priority(), None);
        assert!(with_sequence_local_storage(|_| ()).is_none());
    }

    #[test]
    fn environment_restores_on_panic() {
        let token = SequenceToken::new();
        let result = std::panic::catch_unwind(|| {
            let _env = ScopedTaskEnvironment::new(
                Some(ExecutionEnvironment {
                    token,
                    storage: None,
                }),
                TaskPriority::BestEffort,
            );
            panic!("task panicked");
        });
        assert!(result.is_err());
        assert_eq!(current_sequence_token(), None);
    }
}
