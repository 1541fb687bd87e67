//! Bounded retry with backoff.
//!
//! Claims never block. A caller that finds no slot sleeps for the configured
//! interval and tries again, up to the configured budget; exhausting the
//! budget is a [`Error::BufferTimeout`].

use core::time::Duration;

use embedded_hal::delay::DelayNs;

use crate::error::{ConfigError, ConfigResult, Error, Result};
use crate::internal::constants::{DEFAULT_RETRY_BUDGET, DEFAULT_RETRY_INTERVAL_US};
use crate::internal::dma::Direction;
use crate::sync::CancelToken;

/// Retry budget and sleep interval for a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RetryPolicy {
    /// Attempts before giving up
    pub budget: u32,
    /// Sleep between attempts in microseconds
    pub interval_us: u32,
}

impl RetryPolicy {
    /// Create a policy
    pub const fn new(budget: u32, interval_us: u32) -> Self {
        Self {
            budget,
            interval_us,
        }
    }

    /// Check the policy is usable
    pub fn validate(&self) -> ConfigResult<()> {
        if self.budget == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_BUDGET, DEFAULT_RETRY_INTERVAL_US)
    }
}

/// Retry loop over a delay provider.
#[derive(Debug)]
pub struct Backoff<D: DelayNs> {
    delay: D,
    policy: RetryPolicy,
}

impl<D: DelayNs> Backoff<D> {
    /// Create a retry loop
    pub fn new(delay: D, policy: RetryPolicy) -> Self {
        Self { delay, policy }
    }

    /// Sleep for one retry interval
    #[inline]
    pub fn pause(&mut self) {
        self.delay.delay_us(self.policy.interval_us);
    }

    /// Call `attempt` until it yields a value, the budget runs out or the
    /// run is cancelled.
    ///
    /// Cancellation is checked before every attempt. There is no sleep after
    /// the final attempt.
    pub fn retry<T, F>(&mut self, direction: Direction, cancel: &CancelToken, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Option<T>,
    {
        for n in 1..=self.policy.budget {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Some(value) = attempt() {
                return Ok(value);
            }
            if n < self.policy.budget {
                self.pause();
            }
        }
        Err(Error::BufferTimeout {
            direction,
            attempts: self.policy.budget,
        })
    }
}

/// `DelayNs` backed by [`std::thread::sleep`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(Duration::from_nanos(u64::from(ns)));
    }

    fn delay_us(&mut self, us: u32) {
        std::thread::sleep(Duration::from_micros(u64::from(us)));
    }

    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}

// =============================================================================
// Tests
// =============================================================================
