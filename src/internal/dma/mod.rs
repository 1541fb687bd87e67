//! DMA Transfer Engine
//!
//! This module provides the host side of a ring-buffered, bidirectional DMA
//! transport. Each direction owns a fixed-capacity [`BufferRing`] of
//! equally sized slots; the [`DmaControl`] pairs the two rings with the
//! register bus and reconciles software and hardware progress in its
//! process step.
//!
//! # Architecture
//!
//! - [`BufferArena`]: The DMA-visible slot memory for one direction
//! - [`SlotHandle`]: Exclusive ownership token for one claimed slot
//! - [`BufferRing`]: Software/hardware index bookkeeping over an arena
//! - [`DmaChannel`]: A ring plus its enable flag
//! - [`DmaControl`]: Both channels, the register bus and the process step
//!
//! # Index Model
//!
//! Indices are unbounded `u64` counters. The slot for a counter value is
//! `value % capacity`, applied only at lookup time, so wraparound never
//! makes two positions compare equal.
//!
//! # Example
//!
//! ```ignore
//! let control = DmaControl::open(bus, &mapping, DmaOptions::default())?;
//! control.enable_all();
//!
//! if let Some(mut slot) = control.try_claim_write() {
//!     slot.buffer_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
//!     control.commit(slot);
//! }
//! control.process();
//! ```

mod arena;
mod channel;
mod engine;
mod ring;

pub use arena::{BufferArena, BufferMapping, SlotHandle, SlotMemory};
pub use channel::DmaChannel;
pub use engine::{ControlCounters, DmaControl, DmaOptions, ProcessReport};
pub use ring::{BufferRing, HardwareUpdate};

/// Transfer direction of a ring or channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Host to device
    Tx,
    /// Device to host
    Rx,
}

impl Direction {
    /// Both directions, TX first
    pub const ALL: [Direction; 2] = [Direction::Tx, Direction::Rx];

    /// Short uppercase name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Direction::Tx => "TX",
            Direction::Rx => "RX",
        }
    }
}

impl core::fmt::Display for Direction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
