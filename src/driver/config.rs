//! Configuration types for a benchmark run

use core::time::Duration;

use crate::error::{ConfigError, ConfigResult};
use crate::hal::backoff::RetryPolicy;
use crate::internal::constants::{
    DEFAULT_BUCKET_WIDTH_US, DEFAULT_BUFFER_SIZE, DEFAULT_HISTOGRAM_BUCKETS, DEFAULT_ITERATIONS,
    DEFAULT_MAX_IN_FLIGHT, DEFAULT_PATTERN_SEED, DEFAULT_POLL_INTERVAL_US,
    DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_RETRY_BUDGET, DEFAULT_RETRY_INTERVAL_US,
    DEFAULT_RING_CAPACITY, DEFAULT_WARMUP, MAX_BUFFER_SIZE,
    MAX_IN_FLIGHT, MAX_ITERATIONS, MAX_POLL_INTERVAL_US, MAX_RING_CAPACITY, MIN_BUFFER_SIZE,
    MIN_POLL_INTERVAL_US,
};
use crate::pattern::Pattern;

/// What a run measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BenchMode {
    /// Tagged probes, round-trip time per probe
    #[default]
    Latency,
    /// Streamed pattern buffers, bytes per second
    Throughput,
}

/// Where transmitted data comes back from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LoopbackMode {
    /// Device routes TX to RX internally
    #[default]
    Internal,
    /// Data leaves the device and returns over a cable
    External,
}

/// Latency histogram geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HistogramConfig {
    /// Number of buckets before the overflow counter
    pub buckets: usize,
    /// Width of each bucket in microseconds
    pub bucket_width_us: u64,
}

impl Default for HistogramConfig {
    fn default() -> Self {
        Self {
            buckets: DEFAULT_HISTOGRAM_BUCKETS,
            bucket_width_us: DEFAULT_BUCKET_WIDTH_US,
        }
    }
}

/// Benchmark run configuration
///
/// # Example
///
/// ```ignore
/// let config = BenchConfig::new()
///     .with_buffer_size(256)
///     .with_iterations(1000)
///     .with_pattern(Pattern::Random);
/// config.validate()?;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BenchConfig {
    /// Measurement mode
    pub mode: BenchMode,
    /// Transfer size in bytes (clamped to the device maximum at init)
    pub buffer_size: usize,
    /// Slots per ring, used for simulated devices and validation
    pub ring_capacity: usize,
    /// Recorded latency iterations (0 with no duration = until cancelled)
    pub iterations: usize,
    /// Unrecorded leading iterations
    pub warmup: usize,
    /// Payload pattern
    pub pattern: Pattern,
    /// Seed for [`Pattern::Random`]
    pub seed: u32,
    /// Interval between process steps in microseconds
    pub poll_interval_us: u32,
    /// Claim retry budget
    pub retry: RetryPolicy,
    /// Age at which a pending request is declared lost
    pub request_timeout: Duration,
    /// Probes allowed in flight at once
    pub max_in_flight: usize,
    /// Latency histogram geometry
    pub histogram: HistogramConfig,
    /// Print the histogram in the report
    pub show_histogram: bool,
    /// First CPU for the worker threads
    pub cpu_affinity: Option<usize>,
    /// Fill and verify slots in place
    pub zero_copy: bool,
    /// Loopback path
    pub loopback: LoopbackMode,
    /// Verify received payloads
    pub verify: bool,
    /// Log individual mismatches
    pub verbose: bool,
    /// Run length (None = until iterations complete or cancelled)
    pub duration: Option<Duration>,
    /// Progress line interval
    pub monitor_interval: Option<Duration>,
    /// Verification error fraction that fails the run
    pub error_rate_threshold: Option<f64>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BenchConfig {
    /// Create a new configuration with defaults
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mode: BenchMode::Latency,
            buffer_size: DEFAULT_BUFFER_SIZE,
            ring_capacity: DEFAULT_RING_CAPACITY,
            iterations: DEFAULT_ITERATIONS,
            warmup: DEFAULT_WARMUP,
            pattern: Pattern::Sequential,
            seed: DEFAULT_PATTERN_SEED,
            poll_interval_us: DEFAULT_POLL_INTERVAL_US,
            retry: RetryPolicy::new(DEFAULT_RETRY_BUDGET, DEFAULT_RETRY_INTERVAL_US),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            histogram: HistogramConfig {
                buckets: DEFAULT_HISTOGRAM_BUCKETS,
                bucket_width_us: DEFAULT_BUCKET_WIDTH_US,
            },
            show_histogram: true,
            cpu_affinity: None,
            zero_copy: false,
            loopback: LoopbackMode::Internal,
            verify: true,
            verbose: false,
            duration: None,
            monitor_interval: None,
            error_rate_threshold: None,
        }
    }

    // =========================================================================
    // Builder Methods
    // =========================================================================

    /// Set the measurement mode
    #[must_use]
    pub const fn with_mode(mut self, mode: BenchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the transfer size in bytes
    #[must_use]
    pub const fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the ring capacity
    #[must_use]
    pub const fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity;
        self
    }

    /// Set the recorded iteration count
    #[must_use]
    pub const fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    /// Set the warmup iteration count
    #[must_use]
    pub const fn with_warmup(mut self, warmup: usize) -> Self {
        self.warmup = warmup;
        self
    }

    /// Set the payload pattern
    #[must_use]
    pub const fn with_pattern(mut self, pattern: Pattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Set the random pattern seed
    #[must_use]
    pub const fn with_seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    /// Set the process-step polling interval
    #[must_use]
    pub const fn with_poll_interval_us(mut self, us: u32) -> Self {
        self.poll_interval_us = us;
        self
    }

    /// Set the claim retry policy
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the pending request timeout
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the in-flight probe limit
    #[must_use]
    pub const fn with_max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = limit;
        self
    }

    /// Set the histogram geometry
    #[must_use]
    pub const fn with_histogram(mut self, histogram: HistogramConfig) -> Self {
        self.histogram = histogram;
        self
    }

    /// Show or hide the histogram in the report
    #[must_use]
    pub const fn with_show_histogram(mut self, show: bool) -> Self {
        self.show_histogram = show;
        self
    }

    /// Pin workers starting at `core`
    #[must_use]
    pub const fn with_cpu_affinity(mut self, core: Option<usize>) -> Self {
        self.cpu_affinity = core;
        self
    }

    /// Enable or disable in-place slot access
    #[must_use]
    pub const fn with_zero_copy(mut self, enabled: bool) -> Self {
        self.zero_copy = enabled;
        self
    }

    /// Set the loopback path
    #[must_use]
    pub const fn with_loopback(mut self, mode: LoopbackMode) -> Self {
        self.loopback = mode;
        self
    }

    /// Enable or disable payload verification
    #[must_use]
    pub const fn with_verify(mut self, enabled: bool) -> Self {
        self.verify = enabled;
        self
    }

    /// Enable or disable per-mismatch logging
    #[must_use]
    pub const fn with_verbose(mut self, enabled: bool) -> Self {
        self.verbose = enabled;
        self
    }

    /// Bound the run by wall time
    #[must_use]
    pub const fn with_duration(mut self, duration: Option<Duration>) -> Self {
        self.duration = duration;
        self
    }

    /// Log a progress line at this interval
    #[must_use]
    pub const fn with_monitor_interval(mut self, interval: Option<Duration>) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Fail the run above this verification error fraction
    #[must_use]
    pub const fn with_error_rate_threshold(mut self, threshold: Option<f64>) -> Self {
        self.error_rate_threshold = threshold;
        self
    }

    // =========================================================================
    // Derived Values
    // =========================================================================

    /// Probes sent in total, warmup included (0 = unbounded)
    pub fn total_probes(&self) -> u64 {
        if self.iterations == 0 {
            0
        } else {
            (self.warmup + self.iterations) as u64
        }
    }

    /// Check if the run only ends on cancellation or the deadline
    pub fn is_continuous(&self) -> bool {
        match self.mode {
            BenchMode::Latency => self.iterations == 0,
            BenchMode::Throughput => true,
        }
    }

    /// Capacity of the percentile sample window
    pub fn sample_window(&self) -> usize {
        if self.iterations == 0 {
            DEFAULT_ITERATIONS
        } else {
            self.iterations
        }
    }

    /// Transfer size after clamping to the device maximum
    pub fn effective_buffer_size(&self, device_max: usize) -> usize {
        self.buffer_size.min(device_max)
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Check every field is usable
    pub fn validate(&self) -> ConfigResult<()> {
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(ConfigError::InvalidBufferSize);
        }
        if self.ring_capacity == 0 || self.ring_capacity > MAX_RING_CAPACITY {
            return Err(ConfigError::InvalidRingCapacity);
        }
        if !(MIN_POLL_INTERVAL_US..=MAX_POLL_INTERVAL_US).contains(&self.poll_interval_us) {
            return Err(ConfigError::InvalidPollInterval);
        }
        if self.iterations > MAX_ITERATIONS || self.warmup > MAX_ITERATIONS {
            return Err(ConfigError::InvalidIterations);
        }
        self.retry.validate()?;
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout);
        }
        if self.max_in_flight == 0
            || self.max_in_flight > MAX_IN_FLIGHT
            || self.max_in_flight > self.ring_capacity
        {
            return Err(ConfigError::InvalidInFlight);
        }
        if self.histogram.buckets == 0 || self.histogram.bucket_width_us == 0 {
            return Err(ConfigError::InvalidHistogram);
        }
        if let Some(threshold) = self.error_rate_threshold
            && !(0.0..=1.0).contains(&threshold)
        {
            return Err(ConfigError::InvalidErrorThreshold);
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
