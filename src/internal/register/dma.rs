//! DMA Controller Register Definitions
//!
//! The device exposes one control block and one channel block per direction.
//! Channel progress is reported LitePCIe-style as a loop-status word:
//! `(loop_count << 16) | index`, which the process step extends into an
//! unbounded monotonic counter.

use super::{RegisterBus, reg_ro, reg_rw, reg_wo};
use crate::internal::dma::Direction;

// =============================================================================
// Block Base Offsets
// =============================================================================

/// Control block base offset
pub const CTRL_BASE: u32 = 0x0000;
/// Host-to-device (reader) channel block base offset
pub const TX_BASE: u32 = 0x0100;
/// Device-to-host (writer) channel block base offset
pub const RX_BASE: u32 = 0x0200;

// =============================================================================
// Control Block Offsets
// =============================================================================

/// Identification register offset (read-only)
pub const IDENT_OFFSET: u32 = 0x00;
/// Buffer count register offset (read-only)
pub const BUFFER_COUNT_OFFSET: u32 = 0x04;
/// Maximum buffer size register offset (read-only)
pub const BUFFER_SIZE_OFFSET: u32 = 0x08;
/// Loopback control register offset
pub const LOOPBACK_OFFSET: u32 = 0x0C;
/// Scratch register offset
pub const SCRATCH_OFFSET: u32 = 0x10;
/// TX buffer window register offset (read-only): byte offset of the TX
/// slots in the device file, 0 if the buffers cannot be mapped
pub const TX_WINDOW_OFFSET: u32 = 0x14;
/// RX buffer window register offset (read-only), as for TX
pub const RX_WINDOW_OFFSET: u32 = 0x18;

/// Value of the identification register ("LPCD")
pub const DEVICE_IDENT: u32 = 0x4C50_4344;

/// Internal loopback enable
pub const LOOPBACK_INTERNAL: u32 = 1 << 0;

// =============================================================================
// Channel Block Offsets
// =============================================================================

/// Channel enable register offset
pub const ENABLE_OFFSET: u32 = 0x00;
/// Loop-status register offset (read-only)
pub const LOOP_STATUS_OFFSET: u32 = 0x04;
/// Host progress doorbell offset (write-only, low 32 bits of the software index)
pub const SW_COUNT_OFFSET: u32 = 0x08;

/// Channel enable bit
pub const ENABLE_RUN: u32 = 1 << 0;

/// Loop count field shift in the loop-status word
pub const LOOP_STATUS_LOOP_SHIFT: u32 = 16;
/// Index field mask in the loop-status word
pub const LOOP_STATUS_INDEX_MASK: u32 = 0xFFFF;

// =============================================================================
// Register Views
// =============================================================================

/// Control block accessor
pub struct CtrlRegs<'a, B: RegisterBus + ?Sized> {
    bus: &'a B,
    base: u32,
}

impl<'a, B: RegisterBus + ?Sized> CtrlRegs<'a, B> {
    /// Create a view over the control block
    pub fn new(bus: &'a B) -> Self {
        Self {
            bus,
            base: CTRL_BASE,
        }
    }

    reg_ro!(ident, IDENT_OFFSET, "identification register");
    reg_ro!(buffer_count, BUFFER_COUNT_OFFSET, "buffer count register");
    reg_ro!(buffer_size, BUFFER_SIZE_OFFSET, "maximum buffer size register");
    reg_rw!(loopback, set_loopback, LOOPBACK_OFFSET, "loopback control register");
    reg_rw!(scratch, set_scratch, SCRATCH_OFFSET, "scratch register");
    reg_ro!(tx_window, TX_WINDOW_OFFSET, "TX buffer window register");
    reg_ro!(rx_window, RX_WINDOW_OFFSET, "RX buffer window register");

    /// Byte offset of the buffer window for `direction`
    #[inline]
    pub fn window(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Tx => self.tx_window(),
            Direction::Rx => self.rx_window(),
        }
    }
}

/// Channel block accessor
pub struct ChannelRegs<'a, B: RegisterBus + ?Sized> {
    bus: &'a B,
    base: u32,
}

impl<'a, B: RegisterBus + ?Sized> ChannelRegs<'a, B> {
    /// Create a view over the channel block for `direction`
    pub fn new(bus: &'a B, direction: Direction) -> Self {
        Self {
            bus,
            base: channel_base(direction),
        }
    }

    reg_rw!(enable, set_enable, ENABLE_OFFSET, "channel enable register");
    reg_ro!(loop_status, LOOP_STATUS_OFFSET, "loop-status register");
    reg_wo!(set_sw_count, SW_COUNT_OFFSET, "host progress doorbell");

    /// Start the channel
    #[inline]
    pub fn start(&self) {
        self.set_enable(self.enable() | ENABLE_RUN);
    }

    /// Stop the channel
    #[inline]
    pub fn stop(&self) {
        self.set_enable(self.enable() & !ENABLE_RUN);
    }
}

/// Base offset of the channel block for `direction`
#[inline]
pub const fn channel_base(direction: Direction) -> u32 {
    match direction {
        Direction::Tx => TX_BASE,
        Direction::Rx => RX_BASE,
    }
}

// =============================================================================
// Loop-Status Decoding
// =============================================================================

/// Encode a completion count as a loop-status word for a ring of `capacity`
#[inline]
pub fn encode_loop_status(count: u64, capacity: usize) -> u32 {
    let capacity = capacity as u64;
    let index = (count % capacity) as u32 & LOOP_STATUS_INDEX_MASK;
    let loops = ((count / capacity) as u32) & 0xFFFF;
    (loops << LOOP_STATUS_LOOP_SHIFT) | index
}

/// Decode a loop-status word into a completion count modulo one loop-counter period
#[inline]
pub fn decode_loop_status(status: u32, capacity: usize) -> u64 {
    let loops = u64::from(status >> LOOP_STATUS_LOOP_SHIFT);
    let index = u64::from(status & LOOP_STATUS_INDEX_MASK);
    loops * capacity as u64 + index
}

/// Extend a loop-status word into the unbounded counter following `previous`.
///
/// The loop field is 16 bits wide, so the raw count wraps every
/// `65536 * capacity` completions. The result is the smallest counter value
/// not below `previous` that is congruent to the decoded status.
#[inline]
pub fn extend_loop_status(previous: u64, status: u32, capacity: usize) -> u64 {
    let period = (1u64 << 16) * capacity as u64;
    let current = decode_loop_status(status, capacity) % period;
    let delta = (current + period - previous % period) % period;
    previous + delta
}

// =============================================================================
// Tests
// =============================================================================
