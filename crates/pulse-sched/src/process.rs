//! Resumable, time-sliced processes.
//!
//! A process does as much work as fits in a time budget and reports whether
//! it finished. Instead of unwinding with a "reschedule" signal, suspension
//! is an explicit [`StepOutcome`] the controller inspects and re-submits,
//! with the [`ProcessCursor`] carrying which stages are done across
//! invocations.

use crate::env::{Task, TaskEnvironment};
use crate::error::{SchedError, TaskFailure};
use crate::promise::Promise;
use pulse_time::Moment;
use std::sync::Arc;

/// Default retry bound for a cursor.
pub const DEFAULT_MAX_TRIES: u32 = 3;

struct Stage {
    key: String,
    done: bool,
}

/// Position marker over an ordered sequence of stage keys, with a bounded
/// try counter. `tries` counts invocations of the owning process, starts at
/// 1 and never exceeds `max_tries`.
pub struct ProcessCursor {
    stages: Vec<Stage>,
    position: usize,
    tries: u32,
    max_tries: u32,
}

impl ProcessCursor {
    /// A cursor positioned at the first of `stages`, with the default retry
    /// bound.
    pub fn new(stages: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            stages: stages
                .into_iter()
                .map(|key| Stage {
                    key: key.into(),
                    done: false,
                })
                .collect(),
            position: 0,
            tries: 1,
            max_tries: DEFAULT_MAX_TRIES,
        }
    }

    /// Override the retry bound (at least 1).
    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries.max(1);
        self
    }

    /// Whether `key` is the stage the cursor currently points at.
    pub fn if_next(&self, key: &str) -> bool {
        self.stages
            .get(self.position)
            .map(|stage| stage.key == key)
            .unwrap_or(false)
    }

    /// Mark the current stage done and advance.
    pub fn bump(&mut self) {
        if let Some(stage) = self.stages.get_mut(self.position) {
            stage.done = true;
            self.position += 1;
        }
    }

    /// Advance past the current stage without marking it done.
    pub fn skip(&mut self) {
        if self.position < self.stages.len() {
            self.position += 1;
        }
    }

    /// Whether every stage has been visited.
    pub fn is_complete(&self) -> bool {
        self.position >= self.stages.len()
    }

    /// Index of the current stage.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Stage keys marked done so far.
    pub fn done_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|stage| stage.done)
            .map(|stage| stage.key.as_str())
            .collect()
    }

    /// Stage keys not yet marked done.
    pub fn remaining_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|stage| !stage.done)
            .map(|stage| stage.key.as_str())
            .collect()
    }

    /// Invocations of the owning process so far.
    pub fn tries(&self) -> u32 {
        self.tries
    }

    /// The retry bound.
    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    /// Count one more invocation; fails once the bound is spent, leaving
    /// `tries` at `max_tries`.
    pub(crate) fn next_try(&mut self) -> Result<(), SchedError> {
        if self.tries >= self.max_tries {
            return Err(SchedError::RetriesExhausted {
                max_tries: self.max_tries,
            });
        }
        self.tries += 1;
        Ok(())
    }
}

/// What a process invocation ended with.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The process finished; it will not be invoked again.
    Completed,
    /// The process ran out of budget mid-flight; re-invoke later and resume
    /// from the cursor.
    Suspended,
}

/// A unit of long-running work that checkpoints through a cursor instead of
/// blocking.
pub trait Process: Send + 'static {
    /// Ordered stage keys the cursor will track.
    fn stages(&self) -> Vec<String>;

    /// Retry bound for this process.
    fn max_tries(&self) -> u32 {
        DEFAULT_MAX_TRIES
    }

    /// Do as much work as fits before `deadline`, stepping the cursor as
    /// stages complete.
    fn process(&mut self, cursor: &mut ProcessCursor, deadline: Moment) -> StepOutcome;
}

/// Lifecycle of a controlled process.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Not yet invoked.
    Created,
    /// Inside an invocation.
    Running,
    /// Waiting to be re-invoked.
    Suspended,
    /// Finished.
    Completed,
    /// Spent its retry bound; terminal.
    Failed,
}

/// Drives a [`Process`] through repeated bounded invocations.
pub struct ProcessController<P: Process> {
    process: P,
    cursor: Option<ProcessCursor>,
    state: ProcessState,
}

impl<P: Process> ProcessController<P> {
    /// Wrap a process; the cursor is created on the first invocation.
    pub fn new(process: P) -> Self {
        Self {
            process,
            cursor: None,
            state: ProcessState::Created,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// The cursor, once the process has been invoked.
    pub fn cursor(&self) -> Option<&ProcessCursor> {
        self.cursor.as_ref()
    }

    /// Run one time slice of up to `budget_ms`.
    ///
    /// `Ok(true)` means the process completed, `Ok(false)` that it suspended
    /// and wants another slice. A slice that would exceed the cursor's retry
    /// bound fails with [`SchedError::RetriesExhausted`] without invoking
    /// the process again.
    pub fn run_slice(&mut self, budget_ms: u64) -> Result<bool, SchedError> {
        match self.state {
            ProcessState::Completed => return Ok(true),
            ProcessState::Failed => {
                return Err(SchedError::RetriesExhausted {
                    max_tries: self
                        .cursor
                        .as_ref()
                        .map(ProcessCursor::max_tries)
                        .unwrap_or(DEFAULT_MAX_TRIES),
                })
            }
            _ => {}
        }

        if self.cursor.is_none() {
            self.cursor = Some(
                ProcessCursor::new(self.process.stages()).with_max_tries(self.process.max_tries()),
            );
        } else if let Some(cursor) = self.cursor.as_mut() {
            if let Err(err) = cursor.next_try() {
                self.state = ProcessState::Failed;
                return Err(err);
            }
        }

        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(true);
        };

        self.state = ProcessState::Running;
        let deadline = pulse_time::default_clock()
            .now()
            .plus_millis(budget_ms as f64);
        match self.process.process(cursor, deadline) {
            StepOutcome::Completed => {
                self.state = ProcessState::Completed;
                Ok(true)
            }
            StepOutcome::Suspended => {
                self.state = ProcessState::Suspended;
                Ok(false)
            }
        }
    }
}

/// Submit a controller into `env`'s deferred queue, re-submitting itself
/// after every suspension until it completes or spends its retries; the
/// outcome lands in `promise`.
pub(crate) fn drive<P: Process>(
    env: Arc<TaskEnvironment>,
    mut controller: ProcessController<P>,
    slice_ms: u64,
    promise: Promise<()>,
) {
    let next_env = env.clone();
    let settled = promise.clone();
    let task: Task = Box::new(move || match controller.run_slice(slice_ms) {
        Ok(true) => {
            settled.complete(());
        }
        Ok(false) => drive(next_env, controller, slice_ms, settled),
        Err(err) => {
            settled.fail(TaskFailure::from(err));
        }
    });
    if let Err(err) = env.push_deferred(task) {
        promise.fail(TaskFailure::from(err));
    }
}
