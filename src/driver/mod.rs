//! Run configuration.
//!
//! - [`config`] - Configuration types and builder patterns
//!
//! # Example
//!
//! ```ignore
//! use ph_dma_bench::driver::{BenchConfig, BenchMode};
//!
//! let config = BenchConfig::new()
//!     .with_mode(BenchMode::Throughput)
//!     .with_buffer_size(4096);
//! ```

// Submodules
pub mod config;

// Re-exports for convenience
pub use config::{BenchConfig, BenchMode, HistogramConfig, LoopbackMode};
