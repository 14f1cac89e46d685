//! Per-context task environment: the ordered work queues and their drain loop.
//!
//! Each unit of work owns one environment (in a threaded host) or shares the
//! single global one (in a cooperative host). Three queues with distinct
//! contracts: `finally` work runs to completion, FIFO, before the next
//! `deferred` item of a drain cycle; `eventual` work is unordered
//! housekeeping that never blocks emptiness checks.

use crate::context::ContextHandle;
use crate::error::{SchedError, TaskFailure};
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use pulse_time::{default_clock, Moment};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A unit of queued work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Receives failures captured from user callbacks once a drain cycle ends.
pub type FailureSink = Arc<dyn Fn(&TaskFailure) + Send + Sync>;

/// A condition/action pair registered by `resolve`: once `ready` reports
/// true, `action` is moved into the deferred queue.
pub struct Monitor {
    ready: Box<dyn Fn() -> bool + Send>,
    action: Task,
}

impl Monitor {
    /// Pair a readiness probe with the action to run once it fires.
    pub fn new(
        ready: impl Fn() -> bool + Send + 'static,
        action: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            ready: Box::new(ready),
            action: Box::new(action),
        }
    }

    /// Check the probe: the action if it fired, the intact monitor if not.
    pub(crate) fn poll(self) -> Result<Task, Monitor> {
        if (self.ready)() {
            Ok(self.action)
        } else {
            Err(self)
        }
    }
}

/// Ordered work queues for one execution context.
///
/// Appends are safe from any thread, including reentrantly from a task that
/// is itself being drained. Only the owning context drains.
pub struct TaskEnvironment {
    /// Environment name, normally the owning thread's name.
    name: String,

    /// Work that runs once the current finally queue is drained.
    deferred: Mutex<VecDeque<Task>>,

    /// Work that must complete, FIFO, before the next deferred item.
    finallies: Mutex<VecDeque<Task>>,

    /// Best-effort, unordered idle-time work. Excluded from `is_empty`.
    eventual: SegQueue<Task>,

    /// Contexts spawned from this environment, joined on flush.
    children: Mutex<Vec<ContextHandle>>,

    /// Readiness probes pumped by the host (cooperative resolve path).
    monitors: Mutex<Vec<Monitor>>,

    /// Once set, every append fails with `SchedError::Terminated`.
    killed: AtomicBool,

    /// Nesting depth of active drain calls on this environment.
    draining: AtomicUsize,

    /// Millisecond budget armed by a cross-thread flush request, serviced
    /// by the owning thread after its task body completes.
    requested_flush: AtomicU64,

    failure_sink: FailureSink,
}

impl TaskEnvironment {
    /// Create an environment that reports callback failures via `tracing`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_failure_sink(
            name,
            Arc::new(|failure: &TaskFailure| {
                tracing::error!(error = %failure, "queued task failed");
            }),
        )
    }

    /// Create an environment with a custom failure sink.
    pub fn with_failure_sink(name: impl Into<String>, failure_sink: FailureSink) -> Self {
        Self {
            name: name.into(),
            deferred: Mutex::new(VecDeque::new()),
            finallies: Mutex::new(VecDeque::new()),
            eventual: SegQueue::new(),
            children: Mutex::new(Vec::new()),
            monitors: Mutex::new(Vec::new()),
            killed: AtomicBool::new(false),
            draining: AtomicUsize::new(0),
            requested_flush: AtomicU64::new(0),
            failure_sink,
        }
    }

    /// The environment's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append to the deferred queue.
    pub fn push_deferred(&self, task: Task) -> Result<(), SchedError> {
        self.check_alive()?;
        self.deferred.lock().push_back(task);
        Ok(())
    }

    /// Append to the finally queue.
    pub fn push_finally(&self, task: Task) -> Result<(), SchedError> {
        self.check_alive()?;
        self.finallies.lock().push_back(task);
        Ok(())
    }

    /// Append to the eventual queue.
    pub fn push_eventually(&self, task: Task) -> Result<(), SchedError> {
        self.check_alive()?;
        self.eventual.push(task);
        Ok(())
    }

    /// Register a context spawned from this environment.
    pub fn push_child(&self, child: ContextHandle) -> Result<(), SchedError> {
        self.check_alive()?;
        self.children.lock().push(child);
        Ok(())
    }

    /// Remove and return one registered child, if any.
    pub fn pop_child(&self) -> Option<ContextHandle> {
        self.children.lock().pop()
    }

    /// Register a readiness monitor.
    pub fn push_monitor(&self, monitor: Monitor) -> Result<(), SchedError> {
        self.check_alive()?;
        self.monitors.lock().push(monitor);
        Ok(())
    }

    /// Move every monitor whose probe fires into the deferred queue.
    pub fn pump_monitors(&self) {
        let pending = std::mem::take(&mut *self.monitors.lock());
        let mut waiting = Vec::new();
        let mut fired = Vec::new();
        for monitor in pending {
            match monitor.poll() {
                Ok(action) => fired.push(action),
                Err(monitor) => waiting.push(monitor),
            }
        }
        self.monitors.lock().extend(waiting);
        for action in fired {
            if let Err(err) = self.push_deferred(action) {
                tracing::warn!(error = %err, "dropped fired monitor action");
            }
        }
    }

    /// Whether any finally work is queued.
    pub fn has_finallies(&self) -> bool {
        !self.finallies.lock().is_empty()
    }

    /// Whether any deferred work is queued.
    pub fn has_defers(&self) -> bool {
        !self.deferred.lock().is_empty()
    }

    /// True iff both the finally and deferred queues are empty. Eventual
    /// work does not count.
    pub fn is_empty(&self) -> bool {
        !self.has_finallies() && !self.has_defers()
    }

    /// Whether a drain call is currently active on this environment.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire) > 0
    }

    /// Refuse all future appends.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    /// Whether this environment has been killed.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Arm a flush request from another thread; the owning thread services
    /// it after its current task body finishes. Budgets do not stack, the
    /// largest one wins.
    pub fn request_flush(&self, timeout_ms: u64) {
        self.requested_flush.fetch_max(timeout_ms, Ordering::AcqRel);
    }

    /// Take and clear the armed flush budget.
    pub fn take_requested_flush(&self) -> u64 {
        self.requested_flush.swap(0, Ordering::AcqRel)
    }

    /// Drain the queues until empty or until `timeout_ms` elapses.
    ///
    /// Each cycle fully drains the finally queue (copy-then-clear per pass,
    /// so finally work enqueued mid-pass lands in the next pass), then runs
    /// exactly one deferred item. The deadline is read once at entry.
    /// Returns `true` only if both queues emptied in time; on expiry it
    /// returns `false` and every unrun task stays queued for a later flush.
    /// Panics from tasks are captured, the drain continues, and the failure
    /// sink hears about them once the drain ends.
    pub fn flush(&self, timeout_ms: u64) -> bool {
        let deadline = default_clock().now().plus_millis(timeout_ms as f64);
        let mut failures = Vec::new();

        self.draining.fetch_add(1, Ordering::AcqRel);
        let drained = self.run_cycles(deadline, &mut failures);
        self.draining.fetch_sub(1, Ordering::AcqRel);

        for failure in &failures {
            (self.failure_sink)(failure);
        }
        drained
    }

    fn run_cycles(&self, deadline: Moment, failures: &mut Vec<TaskFailure>) -> bool {
        let clock = default_clock();
        loop {
            // Finally passes. The queue is swapped for an empty one before
            // iterating, so reentrant pushes go to the next pass instead of
            // racing the iterator.
            loop {
                let mut batch = std::mem::take(&mut *self.finallies.lock());
                if batch.is_empty() {
                    break;
                }
                while let Some(task) = batch.pop_front() {
                    run_captured(task, failures);
                    if clock.now() > deadline && !batch.is_empty() {
                        self.requeue_finallies(batch);
                        return false;
                    }
                }
                if clock.now() > deadline && !self.is_empty() {
                    return false;
                }
            }

            // One deferred item per cycle.
            let next = self.deferred.lock().pop_front();
            if let Some(task) = next {
                run_captured(task, failures);
            }

            if self.is_empty() {
                return true;
            }
            if clock.now() > deadline {
                return false;
            }
        }
    }

    /// Put an interrupted finally batch back, ahead of anything enqueued
    /// while it ran.
    fn requeue_finallies(&self, batch: VecDeque<Task>) {
        let mut queue = self.finallies.lock();
        for task in batch.into_iter().rev() {
            queue.push_front(task);
        }
    }

    /// Flush repeatedly with the shrinking remaining budget until empty or
    /// the budget runs out, then lend any leftover time to the eventual
    /// queue. Returns whether ordered work REMAINED when the budget ended.
    pub fn destroy(&self, timeout_ms: u64) -> bool {
        let clock = default_clock();
        let deadline = clock.now().plus_millis(timeout_ms as f64);

        while !self.is_empty() {
            let remaining = deadline.since(clock.now());
            if remaining <= 0.0 {
                return true;
            }
            self.flush(remaining as u64);
        }

        let mut failures = Vec::new();
        while clock.now() < deadline {
            match self.eventual.pop() {
                Some(task) => run_captured(task, &mut failures),
                None => break,
            }
        }
        for failure in &failures {
            (self.failure_sink)(failure);
        }

        !self.is_empty()
    }

    fn check_alive(&self) -> Result<(), SchedError> {
        if self.is_killed() {
            return Err(SchedError::Terminated {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

fn run_captured(task: Task, failures: &mut Vec<TaskFailure>) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || task())) {
        failures.push(TaskFailure::from_panic(payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::thread;
    use std::time::Duration;

    fn recording_env() -> (Arc<TaskEnvironment>, Arc<StdMutex<Vec<&'static str>>>) {
        let env = Arc::new(TaskEnvironment::new("test"));
        let log = Arc::new(StdMutex::new(Vec::new()));
        (env, log)
    }

    fn record(log: &Arc<StdMutex<Vec<&'static str>>>, label: &'static str) -> impl FnOnce() {
        let log = log.clone();
        move || log.lock().unwrap().push(label)
    }

    #[test]
    fn test_empty_flush_is_idempotent() {
        let env = TaskEnvironment::new("test");
        assert!(env.flush(10_000));
        assert!(env.flush(0));
        assert!(env.is_empty());
    }

    #[test]
    fn test_finallies_run_before_next_deferred() {
        let (env, log) = recording_env();

        // D itself schedules finally E; the recorded order must be
        // A, B, C, D, E.
        let reentrant_env = env.clone();
        let e = record(&log, "E");
        env.push_deferred(Box::new({
            let log = log.clone();
            move || {
                log.lock().unwrap().push("D");
                reentrant_env.push_finally(Box::new(e)).unwrap();
            }
        }))
        .unwrap();
        env.push_finally(Box::new(record(&log, "A"))).unwrap();
        env.push_finally(Box::new(record(&log, "B"))).unwrap();
        env.push_finally(Box::new(record(&log, "C"))).unwrap();

        assert!(env.flush(1_000));
        assert_eq!(*log.lock().unwrap(), vec!["A", "B", "C", "D", "E"]);
    }

    #[test]
    fn test_deadline_preserves_unrun_work() {
        let env = TaskEnvironment::new("test");
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let ran = ran.clone();
            env.push_finally(Box::new(move || {
                thread::sleep(Duration::from_millis(10));
                ran.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        assert!(!env.flush(50));
        let after_first = ran.load(Ordering::SeqCst);
        assert!(after_first < 20, "deadline did not stop the drain");
        assert!(env.has_finallies());

        assert!(env.flush(10_000));
        assert_eq!(ran.load(Ordering::SeqCst), 20);
        assert!(env.is_empty());
    }

    #[test]
    fn test_eventual_excluded_from_emptiness() {
        let env = TaskEnvironment::new("test");
        env.push_eventually(Box::new(|| {})).unwrap();
        assert!(env.is_empty());
        assert!(env.flush(100));
    }

    #[test]
    fn test_destroy_runs_eventual_work_with_leftover_budget() {
        let env = TaskEnvironment::new("test");
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        env.push_eventually(Box::new(move || flag.store(true, Ordering::SeqCst)))
            .unwrap();

        assert!(!env.destroy(1_000));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_destroy_reports_remaining_work() {
        let env = TaskEnvironment::new("test");
        env.push_finally(Box::new(|| thread::sleep(Duration::from_millis(30))))
            .unwrap();
        env.push_finally(Box::new(|| thread::sleep(Duration::from_millis(30))))
            .unwrap();
        env.push_finally(Box::new(|| thread::sleep(Duration::from_millis(30))))
            .unwrap();

        // Not enough budget for all three.
        assert!(env.destroy(40));
        assert!(!env.is_empty());

        // Plenty of budget now.
        assert!(!env.destroy(10_000));
        assert!(env.is_empty());
    }

    #[test]
    fn test_killed_environment_rejects_work() {
        let env = TaskEnvironment::new("doomed");
        env.kill();

        let err = env.push_deferred(Box::new(|| {})).unwrap_err();
        assert_eq!(
            err,
            SchedError::Terminated {
                name: "doomed".into()
            }
        );
        assert!(env.push_finally(Box::new(|| {})).is_err());
        assert!(env.push_eventually(Box::new(|| {})).is_err());
    }

    #[test]
    fn test_panicking_task_does_not_abort_drain() {
        let failures = Arc::new(AtomicUsize::new(0));
        let counted = failures.clone();
        let env = TaskEnvironment::with_failure_sink(
            "test",
            Arc::new(move |_failure| {
                counted.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        env.push_finally(Box::new(|| panic!("boom"))).unwrap();
        env.push_finally(Box::new(move || flag.store(true, Ordering::SeqCst)))
            .unwrap();

        assert!(env.flush(1_000));
        assert!(ran.load(Ordering::SeqCst), "drain stopped at the panic");
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_appends_during_flush() {
        let env = Arc::new(TaskEnvironment::new("test"));
        let ran = Arc::new(AtomicUsize::new(0));

        // A foreign thread posts finally work while the owner drains.
        let foreign_env = env.clone();
        let foreign_ran = ran.clone();
        let foreign = thread::spawn(move || {
            for _ in 0..50 {
                let counter = foreign_ran.clone();
                let _ = foreign_env.push_finally(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
                thread::sleep(Duration::from_micros(200));
            }
        });

        for _ in 0..50 {
            let counter = ran.clone();
            env.push_deferred(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        foreign.join().unwrap();
        assert!(env.flush(10_000));
        assert_eq!(ran.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_monitor_pumping() {
        let env = TaskEnvironment::new("test");
        let gate = Arc::new(AtomicBool::new(false));
        let fired = Arc::new(AtomicBool::new(false));

        let probe = gate.clone();
        let flag = fired.clone();
        env.push_monitor(Monitor::new(
            move || probe.load(Ordering::SeqCst),
            move || flag.store(true, Ordering::SeqCst),
        ))
        .unwrap();

        env.pump_monitors();
        assert!(env.is_empty(), "monitor fired before its probe was ready");

        gate.store(true, Ordering::SeqCst);
        env.pump_monitors();
        assert!(env.has_defers());
        assert!(env.flush(1_000));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_requested_flush_keeps_largest_budget() {
        let env = TaskEnvironment::new("test");
        env.request_flush(500);
        env.request_flush(200);
        assert_eq!(env.take_requested_flush(), 500);
        assert_eq!(env.take_requested_flush(), 0);
    }
}
