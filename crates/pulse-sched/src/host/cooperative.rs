//! Execution host for a single cooperative thread of control.
//!
//! There are no preemptible threads here: every context shares one global
//! environment, "spawning" enqueues the body as deferred work, and anything
//! that would block the only thread (sleeping, waiting on a lock, joining)
//! is redefined to return immediately. Timers and promise monitors are
//! pumped from inside the caller's own drain.

use crate::context::{run_body, ContextHandle, ContextState};
use crate::env::{Monitor, Task, TaskEnvironment};
use crate::error::SchedError;
use crate::host::ExecutionHost;
use crate::lock::AsyncLock;
use crate::scheduler::SchedulerConfig;
use parking_lot::Mutex;
use pulse_time::{default_clock, Moment};
use std::sync::Arc;

pub(crate) struct CooperativeHost {
    /// The one environment every context shares.
    env: Arc<TaskEnvironment>,

    /// Delayed tasks, promoted to deferred work once their Moment passes.
    timers: Mutex<Vec<(Moment, Task)>>,

    /// The context whose body is currently being drained.
    current: Arc<Mutex<Option<ContextHandle>>>,
}

impl CooperativeHost {
    pub(crate) fn new(_config: SchedulerConfig) -> Self {
        Self {
            env: Arc::new(TaskEnvironment::new("cooperative")),
            timers: Mutex::new(Vec::new()),
            current: Arc::new(Mutex::new(None)),
        }
    }
}

impl ExecutionHost for CooperativeHost {
    fn is_multi_threaded(&self) -> bool {
        false
    }

    fn current_env(&self) -> Arc<TaskEnvironment> {
        self.env.clone()
    }

    fn current_context(&self) -> Option<ContextHandle> {
        self.current.lock().clone()
    }

    fn env_for_new_context(&self, _name: &str) -> Arc<TaskEnvironment> {
        self.env.clone()
    }

    fn spawn(&self, context: &ContextHandle) -> Result<(), SchedError> {
        let body = context.begin_start()?;
        let ctx = context.clone();
        let current = self.current.clone();
        // No post-task flush: the surrounding drain owns the shared queues.
        self.env.push_deferred(Box::new(move || {
            *current.lock() = Some(ctx.clone());
            run_body(&ctx, body, None);
            *current.lock() = None;
        }))
    }

    /// Pausing the only thread would deadlock the runtime, so sleeping is a
    /// no-op that reports success.
    fn try_sleep(&self, _millis: f64) -> bool {
        true
    }

    fn new_lock(&self) -> AsyncLock {
        AsyncLock::marker()
    }

    fn schedule_after(&self, delay_ms: f64, _env: Arc<TaskEnvironment>, task: Task) {
        let due = default_clock().now().plus_millis(delay_ms.max(0.0));
        self.timers.lock().push((due, task));
    }

    fn schedule_interruption(&self, _delay_ms: f64) {
        // Interrupting the only thread would interrupt the interrupter.
        tracing::debug!("schedule_interruption has no effect in a cooperative host");
    }

    fn register_monitor(&self, monitor: Monitor) {
        if let Err(err) = self.env.push_monitor(monitor) {
            tracing::warn!(error = %err, "dropped monitor registration");
        }
    }

    fn await_end(&self, context: &ContextHandle, _timeout_ms: u64) -> bool {
        // Blocking would starve the body we are waiting for. A context that
        // never started, already finished, or was killed counts as ended;
        // anything else reports its current completion state.
        matches!(
            context.state(),
            ContextState::Created | ContextState::Idle | ContextState::Killed
        ) || context.is_done()
    }

    fn pump(&self) {
        let now = default_clock().now();
        let mut timers = self.timers.lock();
        let mut due = Vec::new();
        let mut waiting = Vec::new();
        for (at, task) in timers.drain(..) {
            if at <= now {
                due.push(task);
            } else {
                waiting.push((at, task));
            }
        }
        *timers = waiting;
        drop(timers);

        for task in due {
            if let Err(err) = self.env.push_deferred(task) {
                tracing::warn!(error = %err, "dropped due timer task");
            }
        }

        self.env.pump_monitors();
    }

    fn shutdown(&self) {
        // No service threads to stop.
    }
}
