//! Hardware Abstraction Layer
//!
//! Host-side counterparts of the pieces the engine needs from its
//! environment: time, polling delays, register access and CPU placement.
//!
//! # Modules
//!
//! - [`backoff`]: Bounded retry with sleep, driven by any `DelayNs`
//! - [`clock`]: Monotonic nanosecond timestamps
//! - [`mmio`]: Memory-mapped registers and buffers of a real device (Unix)
//! - [`affinity`]: CPU pinning for worker threads
//!
//! # Delay Integration
//!
//! Everything that waits takes an `embedded_hal::delay::DelayNs`. Threads use
//! [`StdDelay`]; tests substitute a counting mock.

pub mod affinity;
pub mod backoff;
pub mod clock;
#[cfg(unix)]
pub mod mmio;

// Re-export commonly used types
pub use backoff::{Backoff, RetryPolicy, StdDelay};
pub use clock::{Clock, MonotonicClock};
#[cfg(unix)]
pub use mmio::{DeviceBuffers, MmioBus};
