//! The scheduling facade: one public API over both execution hosts.

use crate::context::{ContextHandle, ContextState};
use crate::env::{Monitor, Task};
use crate::error::{SchedError, TaskFailure};
use crate::host::{CooperativeHost, ExecutionHost, ThreadedHost};
use crate::lock::AsyncLock;
use crate::process::{drive, Process, ProcessController};
use crate::promise::Promise;
use once_cell::sync::Lazy;
use pulse_time::{default_clock, Moment};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Tunables shared by both hosts.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Budget a context spends draining its environment after its task body
    /// returns.
    pub post_task_flush_ms: u64,

    /// Pause between polling rounds of the promise resolver thread.
    pub resolver_poll_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            post_task_flush_ms: 2_000,
            resolver_poll_ms: 1,
        }
    }
}

/// Facade over task scheduling, context lifecycle and promise bridging.
///
/// The same contract holds whether the host has real threads or a single
/// cooperative one; only [`Scheduler::try_sleep`] and
/// [`Scheduler::new_lock`] legitimately differ, as documented there.
pub struct Scheduler {
    host: Box<dyn ExecutionHost>,
    context_counter: AtomicU64,
}

static GLOBAL: Lazy<Scheduler> = Lazy::new(Scheduler::threaded);

impl Scheduler {
    /// A scheduler backed by real OS threads.
    pub fn threaded() -> Self {
        Self::threaded_with(SchedulerConfig::default())
    }

    /// A threaded scheduler with custom tunables.
    pub fn threaded_with(config: SchedulerConfig) -> Self {
        Self {
            host: Box::new(ThreadedHost::new(config)),
            context_counter: AtomicU64::new(0),
        }
    }

    /// A scheduler for a single cooperative thread of control.
    pub fn cooperative() -> Self {
        Self::cooperative_with(SchedulerConfig::default())
    }

    /// A cooperative scheduler with custom tunables.
    pub fn cooperative_with(config: SchedulerConfig) -> Self {
        Self {
            host: Box::new(CooperativeHost::new(config)),
            context_counter: AtomicU64::new(0),
        }
    }

    /// The process-wide threaded scheduler.
    pub fn global() -> &'static Scheduler {
        &GLOBAL
    }

    /// Whether the host has real preemptible threads.
    pub fn is_multi_threaded(&self) -> bool {
        self.host.is_multi_threaded()
    }

    /// Current clock reading.
    pub fn now(&self) -> Moment {
        default_clock().now()
    }

    /// A Moment strictly greater than any other this process has seen.
    pub fn tick(&self) -> Moment {
        default_clock().tick()
    }

    /// Allocate a unit of work with its own environment (threaded hosts) or
    /// a view onto the shared one (cooperative hosts). The context does not
    /// run until [`Scheduler::start`]. Fails if the calling context was
    /// killed.
    pub fn new_context(
        &self,
        name: &str,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<ContextHandle, SchedError> {
        self.context_named(None, name, Box::new(task))
    }

    /// Like [`Scheduler::new_context`], with a group prefix on the name.
    pub fn new_context_in_group(
        &self,
        group: &str,
        name: &str,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<ContextHandle, SchedError> {
        self.context_named(Some(group), name, Box::new(task))
    }

    fn context_named(
        &self,
        group: Option<&str>,
        name: &str,
        task: Task,
    ) -> Result<ContextHandle, SchedError> {
        let count = self.context_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let full_name = match group {
            Some(group) => format!("{group}-{name}_{count}"),
            None => format!("{name}_{count}"),
        };
        let env = self.host.env_for_new_context(&full_name);
        let handle = ContextHandle::new(full_name, env, task);
        self.host.current_env().push_child(handle.clone())?;
        Ok(handle)
    }

    /// Begin executing a created context.
    pub fn start(&self, context: &ContextHandle) -> Result<(), SchedError> {
        self.host.spawn(context)
    }

    /// Enqueue into the calling context's deferred queue.
    pub fn run_deferred(&self, task: impl FnOnce() + Send + 'static) -> Result<(), SchedError> {
        self.host.current_env().push_deferred(Box::new(task))
    }

    /// Enqueue into the calling context's finally queue: it will run, FIFO,
    /// before the next deferred item, even when scheduled from work that is
    /// itself being drained.
    pub fn run_finally(&self, task: impl FnOnce() + Send + 'static) -> Result<(), SchedError> {
        self.host.current_env().push_finally(Box::new(task))
    }

    /// Enqueue best-effort idle-time work; no ordering promise.
    pub fn run_eventually(&self, task: impl FnOnce() + Send + 'static) -> Result<(), SchedError> {
        self.host.current_env().push_eventually(Box::new(task))
    }

    /// Enqueue into `context`'s deferred queue, failing fast if it was
    /// killed.
    pub fn run_deferred_in(
        &self,
        context: &ContextHandle,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), SchedError> {
        Self::check_alive(context)?;
        context.env().push_deferred(Box::new(task))
    }

    /// Enqueue into `context`'s finally queue, failing fast if it was
    /// killed.
    pub fn run_finally_in(
        &self,
        context: &ContextHandle,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), SchedError> {
        Self::check_alive(context)?;
        context.env().push_finally(Box::new(task))
    }

    fn check_alive(context: &ContextHandle) -> Result<(), SchedError> {
        if context.is_killed() {
            return Err(SchedError::Terminated {
                name: context.name().to_string(),
            });
        }
        Ok(())
    }

    /// Make `task` eligible in the calling context no earlier than
    /// `min_millis` from now. Only the lower bound is promised; exact firing
    /// time is not.
    pub fn run_timeout(&self, min_millis: f64, task: impl FnOnce() + Send + 'static) {
        self.host
            .schedule_after(min_millis, self.host.current_env(), Box::new(task));
    }

    /// Bridge an externally-completing promise into this model. An
    /// already-settled promise dispatches synchronously; otherwise the host
    /// watches it (a dedicated resolver thread, or the cooperative pump) and
    /// calls `receiver` with the unwrapped outcome — failures included, so
    /// they are never silently lost.
    pub fn resolve<T, F>(&self, promise: &Promise<T>, receiver: F)
    where
        T: Send + 'static,
        F: FnOnce(Result<T, TaskFailure>) + Send + 'static,
    {
        if promise.is_done() {
            if let Some(outcome) = promise.try_take() {
                receiver(outcome);
            }
            return;
        }
        let probe = promise.clone();
        let source = promise.clone();
        self.host.register_monitor(Monitor::new(
            move || probe.is_done(),
            move || {
                if let Some(outcome) = source.try_take() {
                    receiver(outcome);
                }
            },
        ));
    }

    /// Drain `context`'s queues, then join the contexts it spawned, within
    /// `timeout_ms`. Returns `true` only if everything (except eventual
    /// work) finished in time; on expiry all remaining work stays queued.
    /// Called on a foreign context, this arms a flush request its owner
    /// services after its current task and returns `false`.
    pub fn flush(&self, context: &ContextHandle, timeout_ms: u64) -> bool {
        let env = context.env();
        if !Arc::ptr_eq(&env, &self.host.current_env()) {
            env.request_flush(timeout_ms);
            return false;
        }
        self.drain_current(&env, timeout_ms)
    }

    /// [`Scheduler::flush`] for the calling context itself, whether or not
    /// it has a handle (threads the facade never spawned get an environment
    /// on first use).
    pub fn flush_current(&self, timeout_ms: u64) -> bool {
        self.drain_current(&self.host.current_env(), timeout_ms)
    }

    fn drain_current(&self, env: &Arc<crate::env::TaskEnvironment>, timeout_ms: u64) -> bool {
        let clock = default_clock();
        let deadline = clock.now().plus_millis(timeout_ms as f64);

        loop {
            self.host.pump();
            let remaining = deadline.since(clock.now());
            if remaining <= 0.0 {
                return false;
            }
            if !env.flush(remaining as u64) {
                return false;
            }
            match env.pop_child() {
                None => return true,
                Some(child) => {
                    let left = deadline.since(clock.now());
                    if left <= 0.0 || !self.host.await_end(&child, left as u64) {
                        // Put it back so a later flush can finish the join.
                        let _ = env.push_child(child);
                        return false;
                    }
                }
            }
        }
    }

    /// Flush `context`, mark it terminated, and interrupt it if it has not
    /// ended naturally within `timeout_ms`. After this returns, scheduling
    /// against the context fails with [`SchedError::Terminated`]. Returns
    /// `true` only if it ended gracefully before the interrupt.
    pub fn kill(&self, context: &ContextHandle, timeout_ms: u64) -> bool {
        self.host.pump();
        let clock = default_clock();
        let deadline = clock.now().plus_millis(timeout_ms as f64);

        let remained = context.env().destroy(timeout_ms);
        if self.host.is_multi_threaded() {
            // The environment dies with its only context. A cooperative
            // host's environment is shared and must outlive this handle.
            context.env().kill();
        }
        let prior = context.terminate();

        let graceful = match prior {
            ContextState::Running | ContextState::Flushing => {
                let left = deadline.since(clock.now()).max(0.0) as u64;
                self.host.await_end(context, left) && !remained
            }
            _ => !remained,
        };

        if !graceful {
            tracing::warn!(context = %context.name(), "interrupting context after kill deadline");
            context.interrupt();
        }
        graceful
    }

    /// Best-effort pause of the calling unit of work; fractional
    /// milliseconds are honored. Returns `false` if the pause was cut short
    /// by an interruption (clearing the flag). In a cooperative host there
    /// is no second thread to hand control to, so this returns `true`
    /// immediately without pausing — callers must not use it for timing.
    pub fn try_sleep(&self, millis: f64) -> bool {
        self.host.try_sleep(millis)
    }

    /// The clock reading captured when `context` began its current unit of
    /// work (not when it was created), or `None` if it never started.
    pub fn context_start_time(&self, context: &ContextHandle) -> Option<Moment> {
        context.started_at()
    }

    /// A mutual-exclusion primitive appropriate to the host: a real lock
    /// under threads, a non-blocking marker under cooperative scheduling
    /// (where nothing else could be contending).
    pub fn new_lock(&self) -> AsyncLock {
        self.host.new_lock()
    }

    /// Whether the caller is executing inside facade-managed work: a
    /// context's task body, or a callback being drained.
    pub fn is_in_process(&self) -> bool {
        self.host.current_context().is_some() || self.host.current_env().is_draining()
    }

    /// Arm a watchdog that interrupts the calling unit of work after
    /// `after_millis`, bounding runaway tasks. Has no effect in a
    /// cooperative host.
    pub fn schedule_interruption(&self, after_millis: f64) {
        self.host.schedule_interruption(after_millis);
    }

    /// Run `process` in repeated `slice_ms` slices through the calling
    /// context's deferred queue until it completes or exhausts its retries.
    /// The returned promise settles with the outcome.
    pub fn run_process<P: Process>(&self, process: P, slice_ms: u64) -> Promise<()> {
        let controller = ProcessController::new(process);
        let promise = Promise::new();
        drive(
            self.host.current_env(),
            controller,
            slice_ms,
            promise.clone(),
        );
        promise
    }

    /// Stop the host's service threads. Pending queue work is untouched.
    pub fn shutdown(&self) {
        self.host.shutdown();
    }
}
