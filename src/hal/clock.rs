//! Monotonic time source.
//!
//! Timestamps are nanoseconds since an arbitrary per-clock origin and are
//! only meaningful relative to each other.

use std::sync::Arc;
use std::time::Instant;

/// Monotonic nanosecond clock.
pub trait Clock: Send + Sync {
    /// Nanoseconds since this clock's origin
    fn now_ns(&self) -> u64;
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    #[inline]
    fn now_ns(&self) -> u64 {
        (**self).now_ns()
    }
}

impl<T: Clock + ?Sized> Clock for &T {
    #[inline]
    fn now_ns(&self) -> u64 {
        (**self).now_ns()
    }
}

/// [`Clock`] backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Create a clock whose origin is now
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_never_goes_back() {
        let clock = MonotonicClock::new();
        let mut last = clock.now_ns();
        for _ in 0..1000 {
            let now = clock.now_ns();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn monotonic_clock_measures_sleep() {
        let clock = MonotonicClock::new();
        let start = clock.now_ns();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(clock.now_ns() - start >= 2_000_000);
    }

    #[test]
    fn shared_clock_delegates() {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        let a = clock.now_ns();
        assert!(clock.now_ns() >= a);
    }
}
