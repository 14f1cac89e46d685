//! Error taxonomy for the scheduling core.
//!
//! Deadline expiry is deliberately NOT represented here: `flush`, `destroy`
//! and `kill` report it through their boolean results and leave all queued
//! work intact, so a later call can pick it up.

use std::any::Any;
use thiserror::Error;

/// Errors surfaced by scheduling operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedError {
    /// Work was scheduled against a context that has been killed. The task
    /// is rejected loudly instead of vanishing into a dead queue.
    #[error("context `{name}` is terminated")]
    Terminated {
        /// Name of the killed context or environment.
        name: String,
    },

    /// `start` was called on a context that already ran.
    #[error("context `{name}` was already started")]
    AlreadyStarted {
        /// Name of the context.
        name: String,
    },

    /// A resumable process suspended more times than its cursor allows.
    #[error("process exhausted its {max_tries} tries")]
    RetriesExhausted {
        /// The cursor's retry bound.
        max_tries: u32,
    },
}

/// A captured failure from user-supplied work: a panicking callback, a
/// failed promise, or an exhausted process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TaskFailure {
    message: String,
}

impl TaskFailure {
    /// Wrap a failure message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Extract a message from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked".to_string()
        };
        Self { message }
    }
}

impl From<SchedError> for TaskFailure {
    fn from(err: SchedError) -> Self {
        Self::new(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SchedError::Terminated {
            name: "worker_1".into(),
        };
        assert_eq!(err.to_string(), "context `worker_1` is terminated");

        let err = SchedError::RetriesExhausted { max_tries: 3 };
        assert_eq!(err.to_string(), "process exhausted its 3 tries");
    }

    #[test]
    fn test_failure_from_panic_payload() {
        let failure = TaskFailure::from_panic(Box::new("boom"));
        assert_eq!(failure.message(), "boom");

        let failure = TaskFailure::from_panic(Box::new(String::from("kapow")));
        assert_eq!(failure.message(), "kapow");

        let failure = TaskFailure::from_panic(Box::new(42_u32));
        assert_eq!(failure.message(), "task panicked");
    }
}
