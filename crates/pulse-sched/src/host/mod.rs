//! Execution hosts: the two incompatible execution models behind one facade.
//!
//! The facade's contract is identical over both hosts; only `try_sleep` and
//! `new_lock` legitimately differ, and those differences are documented on
//! the facade rather than hidden.

mod cooperative;
mod threaded;

pub(crate) use cooperative::CooperativeHost;
pub(crate) use threaded::ThreadedHost;

use crate::context::ContextHandle;
use crate::env::{Monitor, Task, TaskEnvironment};
use crate::error::SchedError;
use crate::lock::AsyncLock;
use std::sync::Arc;

/// Capability interface the scheduling facade programs against.
pub(crate) trait ExecutionHost: Send + Sync {
    /// Whether this host has real preemptible threads.
    fn is_multi_threaded(&self) -> bool;

    /// The environment of the calling execution context, created on first
    /// use for threads the facade does not manage.
    fn current_env(&self) -> Arc<TaskEnvironment>;

    /// The managed context the caller is running inside, if any.
    fn current_context(&self) -> Option<ContextHandle>;

    /// The environment a freshly created context should own.
    fn env_for_new_context(&self, name: &str) -> Arc<TaskEnvironment>;

    /// Begin executing a created context's task body.
    fn spawn(&self, context: &ContextHandle) -> Result<(), SchedError>;

    /// Best-effort pause of the calling unit of work.
    fn try_sleep(&self, millis: f64) -> bool;

    /// A mutual-exclusion primitive appropriate to this host.
    fn new_lock(&self) -> AsyncLock;

    /// Make `task` eligible in `env` no earlier than `delay_ms` from now.
    fn schedule_after(&self, delay_ms: f64, env: Arc<TaskEnvironment>, task: Task);

    /// Arm a watchdog that interrupts the calling context after `delay_ms`.
    fn schedule_interruption(&self, delay_ms: f64);

    /// Watch a readiness probe and dispatch its action once it fires.
    fn register_monitor(&self, monitor: Monitor);

    /// Wait up to `timeout_ms` for a context's unit of work to end.
    fn await_end(&self, context: &ContextHandle, timeout_ms: u64) -> bool;

    /// Give the host a chance to promote due timers and fired monitors
    /// (cooperative hosts do this inside the caller's drain; threaded hosts
    /// have dedicated threads and ignore it).
    fn pump(&self);

    /// Stop any service threads the host started.
    fn shutdown(&self);
}
