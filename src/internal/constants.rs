//! Centralized Constants
//!
//! This module provides a single source of truth for all magic numbers and
//! configuration defaults used throughout the benchmark engine.
//!
//! # Organization
//!
//! Constants are grouped by category:
//! - **Buffer geometry**: Slot sizes and ring capacities
//! - **Timing**: Polling intervals, retry budgets and timeouts
//! - **Run shape**: Iteration and warmup defaults
//! - **Statistics**: Histogram and percentile defaults
//!
//! # Note
//!
//! Register offsets and bit fields remain in `internal::register::dma` as
//! they are specific to the device register map.

// =============================================================================
// Buffer Geometry
// =============================================================================

/// Size of the latency probe header (sequence id + send timestamp)
pub const PROBE_HEADER_SIZE: usize = 16;

/// Smallest transfer that can carry a probe header
pub const MIN_BUFFER_SIZE: usize = PROBE_HEADER_SIZE;

/// Largest transfer accepted by the engine
pub const MAX_BUFFER_SIZE: usize = 8192;

/// Default transfer size for latency runs
pub const DEFAULT_BUFFER_SIZE: usize = 64;

/// Default number of slots per ring
pub const DEFAULT_RING_CAPACITY: usize = 32;

/// Largest ring the 16-bit loop-status index field can describe
pub const MAX_RING_CAPACITY: usize = 1 << 16;

// =============================================================================
// Timing
// =============================================================================

/// Default interval between process steps in microseconds
pub const DEFAULT_POLL_INTERVAL_US: u32 = 10;

/// Smallest accepted polling interval in microseconds
pub const MIN_POLL_INTERVAL_US: u32 = 1;

/// Largest accepted polling interval in microseconds
pub const MAX_POLL_INTERVAL_US: u32 = 100_000;

/// Default number of claim attempts before a buffer timeout
pub const DEFAULT_RETRY_BUDGET: u32 = 1_000;

/// Default sleep between claim attempts in microseconds
pub const DEFAULT_RETRY_INTERVAL_US: u32 = 10;

/// Default age at which a pending request is declared lost (milliseconds)
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 100;

/// Maximum pending entries inspected by a single eviction scan
pub const EVICTION_SCAN_BUDGET: usize = 64;

// =============================================================================
// Run Shape
// =============================================================================

/// Default number of recorded latency iterations
pub const DEFAULT_ITERATIONS: usize = 10_000;

/// Default number of unrecorded warmup iterations
pub const DEFAULT_WARMUP: usize = 1_000;

/// Largest recorded iteration count (bounds the sample window)
pub const MAX_ITERATIONS: usize = 10_000_000;

/// Default number of probes allowed in flight at once
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1;

/// Largest pending-request table
pub const MAX_IN_FLIGHT: usize = 1 << 16;

/// Default seed for the pseudo-random pattern
pub const DEFAULT_PATTERN_SEED: u32 = 0x1234_5678;

// =============================================================================
// Statistics
// =============================================================================

/// Default histogram bucket count (1 us buckets up to 1 ms)
pub const DEFAULT_HISTOGRAM_BUCKETS: usize = 1_000;

/// Default histogram bucket width in microseconds
pub const DEFAULT_BUCKET_WIDTH_US: u64 = 1;

/// Percentiles printed by the report
pub const REPORT_PERCENTILES: [f64; 5] = [50.0, 90.0, 95.0, 99.0, 99.9];

/// Maximum mismatches reported individually per buffer in verbose mode
pub const MAX_VERBOSE_MISMATCHES: usize = 10;

/// Width of the histogram bar in the text report
pub const HISTOGRAM_BAR_WIDTH: usize = 40;

/// Default interval between progress lines in continuous mode (milliseconds)
pub const DEFAULT_MONITOR_INTERVAL_MS: u64 = 1_000;
