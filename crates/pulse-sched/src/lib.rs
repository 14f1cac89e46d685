//! Pulse scheduling core
//!
//! A cross-runtime task scheduling facility with identical ordering and
//! draining semantics whether the host has real preemptible threads or a
//! single cooperative thread of control:
//!
//! - **[`TaskEnvironment`]**: per-context deferred/finally/eventual work
//!   queues with deadline-bounded draining (`env` module)
//! - **[`Scheduler`]**: the facade for scheduling, context lifecycle, sleep,
//!   watchdogs and promise bridging (`scheduler` module)
//! - **[`Process`]**: resumable, time-sliced units of work with a bounded
//!   retry cursor (`process` module)
//!
//! Timestamps come from [`pulse_time`]'s process-wide monotonic clock.
//!
//! # Example
//!
//! ```rust,ignore
//! use pulse_sched::Scheduler;
//!
//! let sched = Scheduler::global();
//! let worker = sched.new_context("ingest", || {
//!     // ... long-running work ...
//! })?;
//! sched.start(&worker)?;
//! sched.run_finally(|| println!("runs before the next deferred task"))?;
//! sched.flush(&worker, 2_000);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod context;
mod env;
mod error;
mod host;
mod lock;
mod process;
mod promise;
mod scheduler;
mod timer;

pub use context::{ContextHandle, ContextId, ContextState};
pub use env::{FailureSink, Monitor, Task, TaskEnvironment};
pub use error::{SchedError, TaskFailure};
pub use lock::AsyncLock;
pub use process::{
    Process, ProcessController, ProcessCursor, ProcessState, StepOutcome, DEFAULT_MAX_TRIES,
};
pub use promise::Promise;
pub use scheduler::{Scheduler, SchedulerConfig};

pub use pulse_time::Moment;
