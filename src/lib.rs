//! DMA Ring Benchmark
//!
//! Host-side benchmark for a bidirectional, ring-buffered DMA transport
//! between host memory and a device, measuring throughput and round-trip
//! latency under configurable traffic patterns.
//!
//! # Architecture
//!
//! The engine is organized into four layers:
//!
//! 1. **Transport** ([`dma`]): per-direction buffer rings, the DMA control
//!    and its process step reconciling software and hardware progress
//! 2. **Transfer** ([`worker`]): writer and reader loops claiming, filling,
//!    verifying and returning slots under a bounded retry contract
//! 3. **Measurement** ([`probe`], [`stats`]): sequence-id correlation of
//!    probes with their replies and the latency statistics
//! 4. **Orchestration** ([`harness`]): the run context, its threads and
//!    the final report
//!
//! Device access goes through two seams: a [`RegisterBus`](registers::RegisterBus)
//! for 32-bit register I/O and a [`BufferMapping`](dma::BufferMapping) for
//! slot memory. On Unix, `hal::MmioBus` and `hal::DeviceBuffers` map both
//! from a real device file; [`sim::LoopbackDevice`] backs both with an
//! in-memory model.
//!
//! # Features
//!
//! - `cli` (default): the `dma-bench` command-line front end
//! - `defmt`: Enable defmt formatting for error and configuration types
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ph_dma_bench::{BenchConfig, BenchContext, LoopbackDevice, SimConfig};
//! use ph_dma_bench::hal::MonotonicClock;
//!
//! let device = Arc::new(LoopbackDevice::new(SimConfig::default()));
//! let config = BenchConfig::new().with_iterations(1000).with_warmup(100);
//!
//! let context = BenchContext::init(
//!     config,
//!     Arc::clone(&device),
//!     device.as_ref(),
//!     Arc::new(MonotonicClock::new()),
//! )?;
//! let report = context.run()?;
//! println!("{report}");
//! context.teardown();
//! ```
//!
//! # Logging
//!
//! The library logs through the `log` facade and never installs a logger;
//! the binary uses `env_logger`.

#![deny(unsafe_op_in_unsafe_fn)]
// Clippy lint levels live in Cargo.toml; these tighten the library only.
#![deny(clippy::correctness)]
#![warn(
    clippy::suspicious,
    clippy::style,
    clippy::complexity,
    clippy::perf,
    clippy::cloned_instead_of_copied,
    clippy::explicit_iter_loop,
    clippy::implicit_clone,
    clippy::inconsistent_struct_constructor,
    clippy::manual_assert,
    clippy::manual_let_else,
    clippy::match_same_arms,
    clippy::semicolon_if_nothing_returned,
    clippy::uninlined_format_args,
    clippy::unnested_or_patterns
)]
#![allow(
    clippy::mod_module_files,
    clippy::self_named_module_files,
    clippy::similar_names,
    clippy::too_many_arguments,
    clippy::struct_excessive_bools,
    clippy::fn_params_excessive_bools,
    clippy::type_complexity,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::cast_lossless,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::module_name_repetitions
)]

// =============================================================================
// Modules
// =============================================================================

pub mod driver;
pub mod error;
pub mod hal;
pub mod harness;
pub mod pattern;
pub mod probe;
pub mod sim;
pub mod stats;
pub mod sync;
pub mod worker;

// Internal implementation details, exposed through the facades below
mod internal;

// Test utilities (only available during testing)
#[cfg(test)]
pub mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use driver::config::{BenchConfig, BenchMode, HistogramConfig, LoopbackMode};
pub use error::{ConfigError, ConfigResult, Error, Result};
pub use harness::{BenchContext, BenchReport};
pub use pattern::{Pattern, PatternGenerator};
pub use probe::{Completion, LatencyProbe, ProbeCounters};
pub use sim::{LoopbackDevice, RxFullPolicy, SimConfig};
pub use stats::{LatencyReport, LatencySample, StatisticsAggregator};
pub use sync::CancelToken;

/// DMA transport: rings, channels and the control.
pub mod dma {
    pub use crate::internal::dma::{
        BufferArena, BufferMapping, BufferRing, ControlCounters, Direction, DmaChannel,
        DmaControl, DmaOptions, HardwareUpdate, ProcessReport, SlotHandle, SlotMemory,
    };
}

/// Register bus and device register map.
///
/// Most users only need [`RegisterBus`](registers::RegisterBus) to plug in a
/// device; the offsets are for tools that poke registers directly.
pub mod registers {
    pub use crate::internal::register::RegisterBus;
    pub use crate::internal::register::dma::{
        BUFFER_COUNT_OFFSET, BUFFER_SIZE_OFFSET, CTRL_BASE, ChannelRegs, CtrlRegs, DEVICE_IDENT,
        ENABLE_OFFSET, ENABLE_RUN, IDENT_OFFSET, LOOP_STATUS_OFFSET, LOOPBACK_INTERNAL,
        LOOPBACK_OFFSET, RX_BASE, RX_WINDOW_OFFSET, SCRATCH_OFFSET, SW_COUNT_OFFSET, TX_BASE,
        TX_WINDOW_OFFSET, channel_base, decode_loop_status, encode_loop_status,
        extend_loop_status,
    };
}

/// Shared engine constants.
pub mod constants {
    pub use crate::internal::constants::{
        // Buffer geometry
        DEFAULT_BUFFER_SIZE,
        DEFAULT_RING_CAPACITY,
        MAX_BUFFER_SIZE,
        MAX_RING_CAPACITY,
        MIN_BUFFER_SIZE,
        PROBE_HEADER_SIZE,
        // Timing
        DEFAULT_POLL_INTERVAL_US,
        DEFAULT_REQUEST_TIMEOUT_MS,
        DEFAULT_RETRY_BUDGET,
        DEFAULT_RETRY_INTERVAL_US,
        MAX_POLL_INTERVAL_US,
        MIN_POLL_INTERVAL_US,
        // Run shape
        DEFAULT_ITERATIONS,
        DEFAULT_MAX_IN_FLIGHT,
        DEFAULT_MONITOR_INTERVAL_MS,
        DEFAULT_PATTERN_SEED,
        DEFAULT_WARMUP,
        MAX_IN_FLIGHT,
        MAX_ITERATIONS,
        // Statistics
        DEFAULT_BUCKET_WIDTH_US,
        DEFAULT_HISTOGRAM_BUCKETS,
        REPORT_PERCENTILES,
    };
}
