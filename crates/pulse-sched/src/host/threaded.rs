//! Execution host backed by real OS threads.

use crate::context::{run_body, ContextHandle, ContextState};
use crate::env::{Monitor, Task, TaskEnvironment};
use crate::error::SchedError;
use crate::host::ExecutionHost;
use crate::lock::AsyncLock;
use crate::scheduler::SchedulerConfig;
use crate::timer::{TimerAction, TimerThread};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use pulse_time::default_clock;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

thread_local! {
    /// The managed context executing on this thread, if any.
    static CURRENT: RefCell<Option<ContextHandle>> = const { RefCell::new(None) };
}

/// Host with real preemptible threads: one named thread per context, a
/// shared timer thread for delays and watchdogs, and a shared resolver
/// thread that waits on pending promises.
pub(crate) struct ThreadedHost {
    config: SchedulerConfig,

    /// Environments auto-created for threads the facade does not manage,
    /// keyed by thread id (first use initializes, like the original's
    /// on-demand environment map).
    anonymous_envs: DashMap<thread::ThreadId, Arc<TaskEnvironment>>,

    /// Timer and resolver threads start lazily, on first use.
    timer: OnceCell<Arc<TimerThread>>,
    resolver: OnceCell<Arc<ResolverThread>>,
}

impl ThreadedHost {
    pub(crate) fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            anonymous_envs: DashMap::new(),
            timer: OnceCell::new(),
            resolver: OnceCell::new(),
        }
    }

    fn timer(&self) -> &Arc<TimerThread> {
        self.timer.get_or_init(|| {
            let timer = TimerThread::new();
            timer.start();
            timer
        })
    }

    fn resolver(&self) -> &Arc<ResolverThread> {
        self.resolver.get_or_init(|| {
            let resolver = ResolverThread::new(self.config.resolver_poll_ms);
            resolver.start();
            resolver
        })
    }
}

impl ExecutionHost for ThreadedHost {
    fn is_multi_threaded(&self) -> bool {
        true
    }

    fn current_env(&self) -> Arc<TaskEnvironment> {
        if let Some(context) = self.current_context() {
            return context.env();
        }
        let current = thread::current();
        let entry = self.anonymous_envs.entry(current.id()).or_insert_with(|| {
            let name = current
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("thread-{:?}", current.id()));
            tracing::debug!(thread = %name, "initializing environment for unmanaged thread");
            Arc::new(TaskEnvironment::new(name))
        });
        entry.value().clone()
    }

    fn current_context(&self) -> Option<ContextHandle> {
        CURRENT.with(|current| current.borrow().clone())
    }

    fn env_for_new_context(&self, name: &str) -> Arc<TaskEnvironment> {
        Arc::new(TaskEnvironment::new(name))
    }

    fn spawn(&self, context: &ContextHandle) -> Result<(), SchedError> {
        let body = context.begin_start()?;
        // Mark Running before the thread exists, so a concurrent flush
        // never mistakes a just-started context for a never-started one.
        context.set_state(ContextState::Running);
        let ctx = context.clone();
        let flush_budget = self.config.post_task_flush_ms;
        // The handle is dropped: completion is observed through the
        // context's done latch, not a join.
        let _ = thread::Builder::new()
            .name(context.name().to_string())
            .spawn(move || {
                CURRENT.with(|current| *current.borrow_mut() = Some(ctx.clone()));
                run_body(&ctx, body, Some(flush_budget));
                CURRENT.with(|current| *current.borrow_mut() = None);
            })
            .expect("failed to spawn context thread");
        Ok(())
    }

    fn try_sleep(&self, millis: f64) -> bool {
        match self.current_context() {
            Some(context) => context.try_sleep(millis),
            None => {
                // Unmanaged threads have no interrupt hook; a plain sleep
                // always completes.
                thread::sleep(Duration::from_secs_f64(millis.max(0.0) / 1000.0));
                true
            }
        }
    }

    fn new_lock(&self) -> AsyncLock {
        AsyncLock::real()
    }

    fn schedule_after(&self, delay_ms: f64, env: Arc<TaskEnvironment>, task: Task) {
        let due = default_clock().now().plus_millis(delay_ms.max(0.0));
        self.timer().register(due, TimerAction::Run { env, task });
    }

    fn schedule_interruption(&self, delay_ms: f64) {
        match self.current_context() {
            Some(context) => {
                let due = default_clock().now().plus_millis(delay_ms.max(0.0));
                self.timer().register(due, TimerAction::Interrupt { context });
            }
            None => {
                tracing::warn!("schedule_interruption ignored outside a managed context");
            }
        }
    }

    fn register_monitor(&self, monitor: Monitor) {
        self.resolver().register(monitor);
    }

    fn await_end(&self, context: &ContextHandle, timeout_ms: u64) -> bool {
        match context.state() {
            // Never started, finished, or terminal: nothing to wait for.
            ContextState::Created | ContextState::Idle | ContextState::Killed => true,
            ContextState::Running | ContextState::Flushing => context.wait_done(timeout_ms),
        }
    }

    fn pump(&self) {
        // Timer and resolver threads promote work on their own.
    }

    fn shutdown(&self) {
        if let Some(timer) = self.timer.get() {
            timer.stop();
        }
        if let Some(resolver) = self.resolver.get() {
            resolver.stop();
        }
    }
}

impl Drop for ThreadedHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Shared polling loop that watches pending monitors (promise completions)
/// and dispatches their actions as they become ready.
struct ResolverThread {
    pending: Mutex<Vec<Monitor>>,
    notify: Condvar,
    shutdown: AtomicBool,
    poll_interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ResolverThread {
    fn new(poll_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Vec::new()),
            notify: Condvar::new(),
            shutdown: AtomicBool::new(false),
            poll_interval: Duration::from_millis(poll_ms.max(1)),
            handle: Mutex::new(None),
        })
    }

    fn start(self: &Arc<Self>) {
        let resolver = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("pulse-resolver".to_string())
            .spawn(move || resolver.run_loop())
            .expect("failed to spawn resolver thread");
        *self.handle.lock() = Some(handle);
    }

    fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.pending.lock();
            self.notify.notify_one();
        }

        if let Some(handle) = self.handle.lock().take() {
            let start = Instant::now();
            while !handle.is_finished() {
                if start.elapsed() > Duration::from_secs(2) {
                    return;
                }
                thread::sleep(Duration::from_millis(5));
            }
            let _ = handle.join();
        }
    }

    fn register(&self, monitor: Monitor) {
        self.pending.lock().push(monitor);
        self.notify.notify_one();
    }

    fn run_loop(&self) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            let mut pending = self.pending.lock();
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            if pending.is_empty() {
                // Nothing to watch; sleep until a registration arrives.
                self.notify.wait(&mut pending);
                continue;
            }

            let monitors = std::mem::take(&mut *pending);
            drop(pending);

            let mut waiting = Vec::new();
            let mut ready = Vec::new();
            for monitor in monitors {
                match monitor.poll() {
                    Ok(action) => ready.push(action),
                    Err(monitor) => waiting.push(monitor),
                }
            }

            let still_waiting = !waiting.is_empty();
            self.pending.lock().extend(waiting);

            for action in ready {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || action())) {
                    let failure = crate::error::TaskFailure::from_panic(payload);
                    tracing::error!(error = %failure, "promise receiver panicked");
                }
            }

            if still_waiting {
                // Pause between polling rounds so pending probes are not
                // spun on.
                let mut guard = self.pending.lock();
                self.notify.wait_for(&mut guard, self.poll_interval);
            }
        }
    }
}

impl Drop for ResolverThread {
    fn drop(&mut self) {
        self.stop();
    }
}
