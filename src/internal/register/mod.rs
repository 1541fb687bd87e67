//! Register bus abstraction and device register map
//!
//! The engine never touches device memory directly. Every register access
//! goes through a [`RegisterBus`], which is implemented by the real MMIO
//! mapping ([`MmioBus`](crate::hal::mmio::MmioBus)) and by the in-memory
//! device model ([`LoopbackDevice`](crate::sim::LoopbackDevice)).

pub mod dma;

use std::sync::Arc;

// =============================================================================
// Register Bus
// =============================================================================

/// 32-bit register access to the device.
///
/// Implementations have no side effects beyond the device. Callers must not
/// assume that the effect of a write is visible without a subsequent read or
/// process step.
pub trait RegisterBus: Send + Sync {
    /// Read the 32-bit register at byte `offset`
    fn read32(&self, offset: u32) -> u32;

    /// Write the 32-bit register at byte `offset`
    fn write32(&self, offset: u32, value: u32);
}

impl<T: RegisterBus + ?Sized> RegisterBus for Arc<T> {
    #[inline]
    fn read32(&self, offset: u32) -> u32 {
        (**self).read32(offset)
    }

    #[inline]
    fn write32(&self, offset: u32, value: u32) {
        (**self).write32(offset, value);
    }
}

impl<T: RegisterBus + ?Sized> RegisterBus for &T {
    #[inline]
    fn read32(&self, offset: u32) -> u32 {
        (**self).read32(offset)
    }

    #[inline]
    fn write32(&self, offset: u32, value: u32) {
        (**self).write32(offset, value);
    }
}

// =============================================================================
// Register Access Macros
// =============================================================================

/// Generate read/write accessor methods for a register in a block view.
///
/// # Example
/// ```ignore
/// impl<B: RegisterBus> ChannelRegs<'_, B> {
///     reg_rw!(enable, set_enable, ENABLE_OFFSET, "channel enable register");
/// }
/// ```
macro_rules! reg_rw {
    ($read_fn:ident, $write_fn:ident, $offset:expr, $doc:expr) => {
        #[doc = concat!("Read ", $doc)]
        #[inline(always)]
        pub fn $read_fn(&self) -> u32 {
            self.bus.read32(self.base + $offset)
        }

        #[doc = concat!("Write ", $doc)]
        #[inline(always)]
        pub fn $write_fn(&self, value: u32) {
            self.bus.write32(self.base + $offset, value)
        }
    };
}

/// Generate a read-only accessor method for a register in a block view.
macro_rules! reg_ro {
    ($read_fn:ident, $offset:expr, $doc:expr) => {
        #[doc = concat!("Read ", $doc)]
        #[inline(always)]
        pub fn $read_fn(&self) -> u32 {
            self.bus.read32(self.base + $offset)
        }
    };
}

/// Generate a write-only accessor method for a register in a block view.
macro_rules! reg_wo {
    ($write_fn:ident, $offset:expr, $doc:expr) => {
        #[doc = concat!("Write ", $doc)]
        #[inline(always)]
        pub fn $write_fn(&self, value: u32) {
            self.bus.write32(self.base + $offset, value)
        }
    };
}

pub(crate) use reg_ro;
pub(crate) use reg_rw;
pub(crate) use reg_wo;
