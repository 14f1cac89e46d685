//! A pollable, externally-completed value, bridged into the scheduler by
//! `Scheduler::resolve`.

use crate::error::TaskFailure;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

enum State<T> {
    Pending,
    Ready(Result<T, TaskFailure>),
    Taken,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    completed: Condvar,
}

/// A one-shot completion cell. Clones share the same state; the outcome can
/// be taken exactly once.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    /// A pending promise.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending),
                completed: Condvar::new(),
            }),
        }
    }

    /// Fulfil with a value. Returns `false` if the promise was already
    /// settled (the new value is dropped).
    pub fn complete(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Fulfil with a failure. Returns `false` if already settled.
    pub fn fail(&self, failure: TaskFailure) -> bool {
        self.settle(Err(failure))
    }

    fn settle(&self, outcome: Result<T, TaskFailure>) -> bool {
        let mut state = self.shared.state.lock();
        if !matches!(*state, State::Pending) {
            return false;
        }
        *state = State::Ready(outcome);
        self.shared.completed.notify_all();
        true
    }

    /// Whether the promise has been settled (even if already taken).
    pub fn is_done(&self) -> bool {
        !matches!(*self.shared.state.lock(), State::Pending)
    }

    /// Take the outcome if settled and not yet taken.
    pub fn try_take(&self) -> Option<Result<T, TaskFailure>> {
        let mut state = self.shared.state.lock();
        if matches!(*state, State::Ready(_)) {
            match std::mem::replace(&mut *state, State::Taken) {
                State::Ready(outcome) => Some(outcome),
                _ => None,
            }
        } else {
            None
        }
    }

    /// Block until settled, then take the outcome. Returns `None` if another
    /// caller took it first.
    pub fn wait(&self) -> Option<Result<T, TaskFailure>> {
        let mut state = self.shared.state.lock();
        while matches!(*state, State::Pending) {
            self.shared.completed.wait(&mut state);
        }
        match std::mem::replace(&mut *state, State::Taken) {
            State::Ready(outcome) => Some(outcome),
            other => {
                *state = other;
                None
            }
        }
    }

    /// Block up to `timeout` for settlement, then take the outcome if there
    /// is one.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, TaskFailure>> {
        let mut state = self.shared.state.lock();
        if matches!(*state, State::Pending) {
            self.shared.completed.wait_for(&mut state, timeout);
        }
        match std::mem::replace(&mut *state, State::Taken) {
            State::Ready(outcome) => Some(outcome),
            other => {
                *state = other;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_complete_once() {
        let promise = Promise::new();
        assert!(!promise.is_done());
        assert!(promise.complete(1));
        assert!(!promise.complete(2));
        assert!(promise.is_done());

        assert_eq!(promise.try_take(), Some(Ok(1)));
        assert_eq!(promise.try_take(), None);
        assert!(promise.is_done());
    }

    #[test]
    fn test_failure_delivery() {
        let promise: Promise<i32> = Promise::new();
        assert!(promise.fail(TaskFailure::new("backend down")));

        let outcome = promise.try_take().unwrap();
        assert_eq!(outcome.unwrap_err().message(), "backend down");
    }

    #[test]
    fn test_wait_blocks_until_settled() {
        let promise = Promise::new();
        let waiter = promise.clone();

        let handle = thread::spawn(move || waiter.wait());
        thread::sleep(Duration::from_millis(30));
        promise.complete("done");

        assert_eq!(handle.join().unwrap(), Some(Ok("done")));
    }

    #[test]
    fn test_wait_timeout_expires() {
        let promise: Promise<i32> = Promise::new();
        assert_eq!(promise.wait_timeout(Duration::from_millis(20)), None);
        assert!(!promise.is_done());
    }
}
