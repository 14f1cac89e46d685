//! Monotonic clock over the system clock

use crate::Moment;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

/// The smallest increment that can be added to an epoch-millisecond `f64`
/// timestamp without being rounded away, valid until the timestamp crosses
/// 0x200_0000_0000 (September 2039), when the significand rolls over to the
/// 42nd bit and the spacing between representable doubles doubles.
///
/// This is the spacing used to mint distinct timestamps *between* two
/// system-clock milliseconds, so up to 0x1000 ticks fit in each one.
const TIME_ULP: f64 = 1.0 / 0x1000 as f64;

/// A clock that never repeats itself.
///
/// [`Clock::now`] reads the current time without side effects;
/// [`Clock::tick`] mints a [`Moment`] strictly greater than every Moment
/// this clock has ever returned, across all threads, using a lock-free
/// compare-and-swap loop over a shared high-water cell. When callers
/// request ticks faster than the system clock can cover (more than 0x1000
/// per millisecond), `tick` briefly spins until the next millisecond rather
/// than handing out timestamps far in the future; how far ahead it may run
/// is bounded by [`Clock::margin_of_error`].
pub struct Clock {
    /// Moment sampled when the clock was constructed.
    birth: Moment,

    /// Highest timestamp handed out so far, as f64 bits.
    high_water: AtomicU64,

    /// Fractional milliseconds `tick` may run ahead of the system clock,
    /// as f64 bits. Non-negative.
    margin_of_error: AtomicU64,
}

impl Clock {
    /// Create a clock born now, with the default 1 ms margin of error.
    pub fn new() -> Self {
        let birth = Self::system_millis();
        Self {
            birth: Moment::from_millis(birth),
            high_water: AtomicU64::new(birth.to_bits()),
            margin_of_error: AtomicU64::new(1.0_f64.to_bits()),
        }
    }

    /// The Moment this clock was constructed.
    pub fn birth(&self) -> Moment {
        self.birth
    }

    /// Current time: the system clock, or the high-water mark if ticks have
    /// run ahead of it. Never blocks.
    pub fn now(&self) -> Moment {
        let wall = Self::system_millis();
        let high = f64::from_bits(self.high_water.load(Ordering::Acquire));
        Moment::from_millis(wall.max(high))
    }

    /// The most recent value handed out by [`Clock::tick`] (or the birth
    /// Moment if tick has never been called).
    pub fn last_tick(&self) -> Moment {
        Moment::from_millis(f64::from_bits(self.high_water.load(Ordering::Acquire)))
    }

    /// Whether `moment` is still in the future.
    pub fn is_future(&self, moment: Moment) -> bool {
        moment > self.now()
    }

    /// Mint a Moment strictly greater than every Moment previously returned
    /// by this clock, from any thread.
    ///
    /// If the system clock has advanced past the high-water mark, the wall
    /// value is adopted; otherwise the high water is bumped by one ULP. A
    /// bump that would land more than [`Clock::margin_of_error`] millis
    /// ahead of the wall clock spins (yielding) until the next millisecond
    /// and restarts. Under contention the compare-and-swap retries; the
    /// call may be delayed but cannot fail.
    pub fn tick(&self) -> Moment {
        loop {
            let observed_bits = self.high_water.load(Ordering::Acquire);
            let observed = f64::from_bits(observed_bits);
            let wall = Self::system_millis();

            let next = if observed < wall {
                wall
            } else {
                let candidate = observed + TIME_ULP;
                if candidate >= wall + self.margin_of_error() {
                    // Out of room in this millisecond. Yield until the
                    // system clock moves, then restart with fresh values.
                    while Self::system_millis() == wall {
                        thread::yield_now();
                    }
                    continue;
                }
                candidate
            };

            if self
                .high_water
                .compare_exchange_weak(
                    observed_bits,
                    next.to_bits(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Moment::from_millis(next);
            }
        }
    }

    /// How many fractional milliseconds `tick` may run ahead of the system
    /// clock before it starts waiting. Default 1 ms.
    pub fn margin_of_error(&self) -> f64 {
        f64::from_bits(self.margin_of_error.load(Ordering::Acquire))
    }

    /// Set the margin of error. Negative values are clamped to zero; a zero
    /// margin forces every tick beyond the current millisecond to wait for
    /// the system clock, which performs poorly under contention.
    pub fn set_margin_of_error(&self, margin: f64) {
        self.margin_of_error
            .store(margin.max(0.0).to_bits(), Ordering::Release);
    }

    /// System clock as whole epoch milliseconds.
    fn system_millis() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is set before the unix epoch")
            .as_millis() as f64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

static DEFAULT_CLOCK: Lazy<Clock> = Lazy::new(Clock::new);

/// The process-wide clock shared by every component that needs a monotonic
/// timestamp.
pub fn default_clock() -> &'static Clock {
    &DEFAULT_CLOCK
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_now_not_before_birth() {
        let clock = Clock::new();
        assert!(clock.now() >= clock.birth());
    }

    #[test]
    fn test_tick_sequential_strictly_increasing() {
        let clock = Clock::new();
        let mut previous = clock.tick();
        for _ in 0..10_000 {
            let next = clock.tick();
            assert!(next > previous, "{next} is not after {previous}");
            previous = next;
        }
    }

    #[test]
    fn test_tick_concurrent_all_distinct() {
        let clock = Arc::new(Clock::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let clock = clock.clone();
                thread::spawn(move || {
                    let mut results = Vec::with_capacity(5_000);
                    for _ in 0..5_000 {
                        results.push(clock.tick());
                    }
                    results
                })
            })
            .collect();

        let mut all: Vec<Moment> = Vec::with_capacity(40_000);
        for handle in handles {
            all.extend(handle.join().expect("tick thread panicked"));
        }

        all.sort();
        for pair in all.windows(2) {
            assert!(pair[0] < pair[1], "duplicate moment {}", pair[0]);
        }
    }

    #[test]
    fn test_tick_never_behind_last_tick() {
        let clock = Clock::new();
        for _ in 0..100 {
            let ticked = clock.tick();
            assert!(clock.last_tick() >= ticked);
            assert!(clock.now() >= ticked);
        }
    }

    #[test]
    fn test_margin_of_error_clamped() {
        let clock = Clock::new();
        assert_eq!(clock.margin_of_error(), 1.0);

        clock.set_margin_of_error(2.5);
        assert_eq!(clock.margin_of_error(), 2.5);

        clock.set_margin_of_error(-3.0);
        assert_eq!(clock.margin_of_error(), 0.0);
    }

    #[test]
    fn test_default_clock_is_shared() {
        let a = default_clock().tick();
        let b = default_clock().tick();
        assert!(b > a);
    }
}
