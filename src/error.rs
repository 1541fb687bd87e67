//! Error types for the DMA benchmark engine
//!
//! Errors are organized by domain for better diagnostics:
//! - [`ConfigError`]: Invalid run configuration
//! - [`Error`]: Everything else, from device acquisition at startup to the
//!   buffer- and sample-level conditions counted during a run
//!
//! Only startup resource acquisition (configuration, device open, ring init)
//! and the harness-level error-rate policy are fatal. Buffer- and
//! sample-level errors are recovered where they happen and show up as
//! counters in the final report; see [`Error::is_fatal`].

use crate::internal::dma::Direction;

// =============================================================================
// Configuration Errors
// =============================================================================

/// Configuration validation errors
///
/// Returned by [`BenchConfig::validate`](crate::BenchConfig::validate) before
/// any device resource is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// Buffer size below the probe header or above the device maximum
    #[error("invalid buffer size")]
    InvalidBufferSize,
    /// Ring capacity is zero or exceeds the loop-status index field
    #[error("invalid ring capacity")]
    InvalidRingCapacity,
    /// Polling interval outside 1..=100000 us
    #[error("invalid polling interval")]
    InvalidPollInterval,
    /// Iteration or warmup count above the supported maximum
    #[error("invalid iteration count")]
    InvalidIterations,
    /// Zero request timeout or zero retry budget
    #[error("invalid timeout")]
    InvalidTimeout,
    /// Histogram with zero buckets or zero bucket width
    #[error("invalid histogram configuration")]
    InvalidHistogram,
    /// In-flight limit of zero, above the maximum or above the ring capacity
    #[error("invalid in-flight limit")]
    InvalidInFlight,
    /// Error-rate threshold outside 0.0..=1.0
    #[error("invalid error-rate threshold")]
    InvalidErrorThreshold,
}

// =============================================================================
// Unified Error Type
// =============================================================================

/// This enum covers every failure the engine can report.
///
/// Match on the variant for specific handling:
/// ```ignore
/// match result {
///     Err(Error::DeviceUnavailable { .. }) => { /* abort with diagnostic */ }
///     Err(Error::BufferTimeout { .. }) => { /* count, skip iteration */ }
///     Err(e) if e.is_fatal() => { /* ... */ }
///     _ => {}
/// }
/// ```
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration error
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    /// The device could not be opened or did not identify itself
    #[error("device unavailable: {reason}")]
    DeviceUnavailable {
        /// What went wrong while acquiring the device
        reason: String,
    },
    /// No slot became available within the retry budget
    #[error("{direction} buffer timeout after {attempts} attempts")]
    BufferTimeout {
        /// Ring that stayed exhausted
        direction: Direction,
        /// Number of claim attempts made
        attempts: u32,
    },
    /// Received payload did not match the expected pattern
    #[error("data verification failed: {mismatches} mismatched words")]
    DataVerification {
        /// Number of mismatched 32-bit words
        mismatches: usize,
    },
    /// The device advanced past slots the application never released
    #[error("{direction} ring overflow: {dropped} buffers dropped")]
    RingOverflow {
        /// Ring that overflowed
        direction: Direction,
        /// Buffers skipped to resynchronise
        dropped: u64,
    },
    /// A pending request expired before its reply arrived
    #[error("request {sequence_id} lost")]
    RequestLost {
        /// Sequence id of the evicted request
        sequence_id: u64,
    },
    /// The run was stopped by the user
    #[error("cancelled")]
    Cancelled,
    /// Verification errors exceeded the configured rate
    #[error("error rate exceeded: {errors} errors over {samples} samples (threshold {threshold})")]
    ErrorRateExceeded {
        /// Verification errors counted
        errors: u64,
        /// Buffers or samples checked
        samples: u64,
        /// Configured threshold
        threshold: f64,
    },
    /// Operating system I/O failure during startup
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error must abort the run.
    ///
    /// Buffer- and sample-level conditions are always recovered locally;
    /// only resource acquisition and the harness error-rate policy escalate.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Config(_)
            | Error::DeviceUnavailable { .. }
            | Error::ErrorRateExceeded { .. }
            | Error::Io(_) => true,
            Error::BufferTimeout { .. }
            | Error::DataVerification { .. }
            | Error::RingOverflow { .. }
            | Error::RequestLost { .. }
            | Error::Cancelled => false,
        }
    }

    /// Convenience constructor for [`Error::DeviceUnavailable`]
    pub fn device_unavailable(reason: impl Into<String>) -> Self {
        Error::DeviceUnavailable {
            reason: reason.into(),
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = core::result::Result<T, Error>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = core::result::Result<T, ConfigError>;

// =============================================================================
// Unit Tests
// =============================================================================
