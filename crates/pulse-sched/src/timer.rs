//! Timer thread for delayed work and runaway-task watchdogs.
//!
//! One thread waits on a min-heap of due Moments using condvar timeouts
//! instead of polling. Entries either move a task into an environment's
//! deferred queue (`run_timeout`) or interrupt a context that has been
//! running longer than its allowance (`schedule_interruption`).

use crate::context::{ContextHandle, ContextState};
use crate::env::{Task, TaskEnvironment};
use parking_lot::{Condvar, Mutex};
use pulse_time::{default_clock, Moment};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// What to do when an entry comes due.
pub(crate) enum TimerAction {
    /// Move `task` into `env`'s deferred queue.
    Run {
        /// Target environment.
        env: Arc<TaskEnvironment>,
        /// The delayed task.
        task: Task,
    },
    /// Interrupt `context` if it is still busy.
    Interrupt {
        /// The watched context.
        context: ContextHandle,
    },
}

struct TimerEntry {
    due: Moment,
    /// Tie-breaker so equal deadlines stay distinct in the heap.
    seq: u64,
    action: TimerAction,
}

// Reverse ordering for a min-heap: earliest due Moment first.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// The shared timer thread of a threaded host.
pub(crate) struct TimerThread {
    pending: Mutex<BinaryHeap<TimerEntry>>,
    notify: Condvar,
    shutdown: AtomicBool,
    seq: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(BinaryHeap::new()),
            notify: Condvar::new(),
            shutdown: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            handle: Mutex::new(None),
        })
    }

    /// Spawn the timer thread.
    pub(crate) fn start(self: &Arc<Self>) {
        let timer = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("pulse-timer".to_string())
            .spawn(move || timer.run_loop())
            .expect("failed to spawn timer thread");
        *self.handle.lock() = Some(handle);
    }

    /// Signal shutdown and wait briefly for the thread to exit.
    pub(crate) fn stop(&self) {
        self.shutdown.store(true, AtomicOrdering::Release);
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

    /// Register an action to fire at `due`.
    pub(crate) fn register(&self, due: Moment, action: TimerAction) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        let mut pending = self.pending.lock();
        pending.push(TimerEntry { due, seq, action });
        // The new entry may be due before whatever the thread is waiting on.
        self.notify.notify_one();
    }

    fn run_loop(&self) {
        let clock = default_clock();
        loop {
            if self.shutdown.load(AtomicOrdering::Acquire) {
                break;
            }

            let mut pending = self.pending.lock();

            // Re-check after taking the lock: stop() may have signalled
            // between our first check and acquiring it, losing the notify.
            if self.shutdown.load(AtomicOrdering::Acquire) {
                break;
            }

            let now = clock.now();
            let mut due = Vec::new();
            while let Some(entry) = pending.peek() {
                if entry.due <= now {
                    due.push(pending.pop().map(|e| e.action));
                } else {
                    break;
                }
            }
            drop(pending);

            for action in due.into_iter().flatten() {
                self.fire(action);
            }

            let mut pending = self.pending.lock();
            match pending.peek() {
                Some(next) => {
                    let wait_ms = next.due.since(clock.now());
                    if wait_ms > 0.0 {
                        self.notify
                            .wait_for(&mut pending, Duration::from_secs_f64(wait_ms / 1000.0));
                    }
                }
                None => {
                    // Nothing scheduled; sleep until a registration arrives.
                    self.notify.wait(&mut pending);
                }
            }
        }
    }

    fn fire(&self, action: TimerAction) {
        match action {
            TimerAction::Run { env, task } => {
                if let Err(err) = env.push_deferred(task) {
                    tracing::warn!(error = %err, "dropped delayed task");
                }
            }
            TimerAction::Interrupt { context } => match context.state() {
                ContextState::Running | ContextState::Flushing => {
                    tracing::warn!(context = %context.name(), "watchdog interrupting context");
                    context.interrupt();
                }
                _ => {
                    // Finished before its allowance ran out; nothing to do.
                }
            },
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.stop();
    }
}
