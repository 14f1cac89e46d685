//! Execution context handles: the opaque "unit of work" the facade hands out.

use crate::env::{Task, TaskEnvironment};
use crate::error::{SchedError, TaskFailure};
use parking_lot::{Condvar, Mutex};
use pulse_time::{default_clock, Moment};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a context.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The numeric ID value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Lifecycle of a context. `Killed` is terminal: no transition leaves it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContextState {
    /// Created but not yet started.
    Created,
    /// Executing its task body.
    Running,
    /// Task body done, draining its environment.
    Flushing,
    /// Finished naturally.
    Idle,
    /// Killed; scheduling against it fails fast.
    Killed,
}

struct ContextInner {
    id: ContextId,
    name: String,
    env: Arc<TaskEnvironment>,
    state: Mutex<ContextState>,
    body: Mutex<Option<Task>>,
    started_at: Mutex<Option<Moment>>,

    /// Interruption flag, observed by `try_sleep` and cleared on read.
    interrupted: AtomicBool,
    sleep_lock: Mutex<()>,
    sleep_cv: Condvar,

    /// Completion signal for bounded waits (kill, child joins).
    done_lock: Mutex<bool>,
    done_cv: Condvar,
}

/// Cheaply cloneable handle to a unit of work and its environment.
#[derive(Clone)]
pub struct ContextHandle {
    inner: Arc<ContextInner>,
}

impl ContextHandle {
    pub(crate) fn new(name: String, env: Arc<TaskEnvironment>, body: Task) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: ContextId::next(),
                name,
                env,
                state: Mutex::new(ContextState::Created),
                body: Mutex::new(Some(body)),
                started_at: Mutex::new(None),
                interrupted: AtomicBool::new(false),
                sleep_lock: Mutex::new(()),
                sleep_cv: Condvar::new(),
                done_lock: Mutex::new(false),
                done_cv: Condvar::new(),
            }),
        }
    }

    /// The context's unique ID.
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// The context's name (also its thread name in a threaded host).
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The environment this context owns (or shares, in a cooperative host).
    pub fn env(&self) -> Arc<TaskEnvironment> {
        self.inner.env.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ContextState {
        *self.inner.state.lock()
    }

    /// Whether this context has been killed.
    pub fn is_killed(&self) -> bool {
        self.state() == ContextState::Killed
    }

    /// The clock reading captured when the context began its task body.
    pub fn started_at(&self) -> Option<Moment> {
        *self.inner.started_at.lock()
    }

    pub(crate) fn set_state(&self, state: ContextState) {
        let mut current = self.inner.state.lock();
        if *current == ContextState::Killed {
            return;
        }
        *current = state;
    }

    /// Mark killed, returning the state the context was in.
    pub(crate) fn terminate(&self) -> ContextState {
        let mut current = self.inner.state.lock();
        std::mem::replace(&mut *current, ContextState::Killed)
    }

    /// Validate that the context can start and take its task body.
    pub(crate) fn begin_start(&self) -> Result<Task, SchedError> {
        let state = self.inner.state.lock();
        match *state {
            ContextState::Created => {}
            ContextState::Killed => {
                return Err(SchedError::Terminated {
                    name: self.inner.name.clone(),
                })
            }
            _ => {
                return Err(SchedError::AlreadyStarted {
                    name: self.inner.name.clone(),
                })
            }
        }
        drop(state);
        self.inner
            .body
            .lock()
            .take()
            .ok_or_else(|| SchedError::AlreadyStarted {
                name: self.inner.name.clone(),
            })
    }

    /// Flag the context as interrupted and wake it if it is sleeping.
    pub(crate) fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::Release);
        let _guard = self.inner.sleep_lock.lock();
        self.inner.sleep_cv.notify_all();
    }

    /// Interruptible pause. Fractional milliseconds are honored. Returns
    /// `false`, clearing the flag, if the context was interrupted before or
    /// during the pause.
    pub(crate) fn try_sleep(&self, millis: f64) -> bool {
        if self.inner.interrupted.swap(false, Ordering::AcqRel) {
            return false;
        }
        let deadline = Instant::now() + Duration::from_secs_f64(millis.max(0.0) / 1000.0);
        let mut guard = self.inner.sleep_lock.lock();
        loop {
            if self.inner.interrupted.swap(false, Ordering::AcqRel) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            self.inner.sleep_cv.wait_for(&mut guard, deadline - now);
        }
    }

    pub(crate) fn mark_done(&self) {
        let mut done = self.inner.done_lock.lock();
        *done = true;
        self.inner.done_cv.notify_all();
    }

    /// Whether the context's body (and post-task flush) has finished.
    pub(crate) fn is_done(&self) -> bool {
        *self.inner.done_lock.lock()
    }

    /// Wait up to `timeout_ms` for the context to finish.
    pub(crate) fn wait_done(&self, timeout_ms: u64) -> bool {
        let mut done = self.inner.done_lock.lock();
        if !*done {
            self.inner
                .done_cv
                .wait_for(&mut done, Duration::from_millis(timeout_ms));
        }
        *done
    }
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Run a context's task body with the standard lifecycle bookkeeping:
/// record the start Moment, transition through `Running`/`Flushing`, drain
/// the environment with `flush_budget_ms` (threaded hosts only; cooperative
/// hosts pass `None` since the surrounding drain owns the shared queues),
/// then settle into `Idle` and signal completion.
pub(crate) fn run_body(context: &ContextHandle, body: Task, flush_budget_ms: Option<u64>) {
    *context.inner.started_at.lock() = Some(default_clock().now());
    context.set_state(ContextState::Running);

    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || body())) {
        let failure = TaskFailure::from_panic(payload);
        tracing::error!(context = %context.name(), error = %failure, "context body panicked");
    }

    if let Some(budget_ms) = flush_budget_ms {
        context.set_state(ContextState::Flushing);
        let budget = budget_ms.max(context.env().take_requested_flush());
        if context.env().destroy(budget) {
            tracing::warn!(context = %context.name(), "work remained after post-task flush");
        }
    }

    context.set_state(ContextState::Idle);
    context.mark_done();
}
