//! Pulse logical time
//!
//! A process-wide monotonic clock synthesized from the (coarse) system
//! clock. The clock hands out [`Moment`] values — immutable epoch-millisecond
//! timestamps stored as `f64` — and guarantees that [`Clock::tick`] never
//! returns the same value twice, no matter how many threads call it
//! concurrently.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod clock;
mod moment;

pub use clock::{default_clock, Clock};
pub use moment::Moment;
