// SPDX-License-Identifier: MPL-2.0

//! The monotonic clock.
//!
//! Time is measured in quantums, the period of the platform timer interrupt.
//! The clock advances only when a tick is delivered, which makes every
//! timeout deterministic: the test harness or the platform timer decides when
//! time passes.

use core::sync::atomic::{AtomicU64, Ordering};

/// A point in time, expressed in quantums since boot.
pub type Quantums = u64;

/// The infinite deadline. A wait armed with this deadline never times out.
pub const QUANTUMS_INFINITY: Quantums = u64::MAX;

/// How many quantums make up a quarter second with the default timer setup
/// (a 60 Hz quantum timer).
pub const QUANTUMS_PER_QUARTER_SECOND: u64 = 15;

/// How many quantums make up a second with the default timer setup.
pub const QUANTUMS_PER_SECOND: u64 = 4 * QUANTUMS_PER_QUARTER_SECOND;

/// A quantum-counting monotonic clock.
pub struct MonotonicClock {
    now: AtomicU64,
}

impl MonotonicClock {
    pub const fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
        }
    }

    /// Advances the clock by one quantum. Invoked from the timer interrupt.
    pub fn on_tick(&self) {
        self.now.fetch_add(1, Ordering::Release);
    }

    /// Returns the current time in quantums.
    pub fn now(&self) -> Quantums {
        self.now.load(Ordering::Acquire)
    }

    /// Computes an absolute deadline `delta` quantums from now. Saturates to
    /// [`QUANTUMS_INFINITY`].
    pub fn deadline_after(&self, delta: Quantums) -> Quantums {
        self.now().saturating_add(delta)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Busy-waits for roughly `iterations` loop iterations. This is the
/// sub-quantum delay primitive; anything longer goes through the scheduler
/// sleep queue.
pub fn spin_delay(iterations: u32) {
    for _ in 0..iterations {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clock_advances_only_on_tick() {
        let clock = MonotonicClock::new();
        assert_eq!(clock.now(), 0);
        clock.on_tick();
        clock.on_tick();
        assert_eq!(clock.now(), 2);
        assert_eq!(clock.deadline_after(3), 5);
    }

    #[test]
    fn infinite_deadline_saturates() {
        let clock = MonotonicClock::new();
        clock.on_tick();
        assert_eq!(clock.deadline_after(QUANTUMS_INFINITY), QUANTUMS_INFINITY);
    }
}
