//! Shared test mocks.
//!
//! - [`RecordingBus`]: in-memory register file that records writes
//! - [`MockDelay`]: `DelayNs` that only counts, optionally advancing a clock
//! - [`MockClock`]: manually driven [`Clock`]
//! - [`HostBuffers`]: plain host memory standing in for a device mapping

use core::cell::Cell;
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::hal::clock::Clock;
use crate::internal::dma::{BufferArena, BufferMapping, Direction};
use crate::internal::register::RegisterBus;

// =============================================================================
// Recording Register Bus
// =============================================================================

/// Register bus backed by a map; unset registers read as zero.
#[derive(Debug, Default)]
pub struct RecordingBus {
    registers: Mutex<HashMap<u32, u32>>,
    writes: Mutex<Vec<(u32, u32)>>,
}

impl RecordingBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset a register without recording a write
    pub fn set(&self, offset: u32, value: u32) {
        self.registers.lock().insert(offset, value);
    }

    /// Current value of a register
    pub fn get(&self, offset: u32) -> u32 {
        self.registers.lock().get(&offset).copied().unwrap_or(0)
    }

    /// All writes in order
    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.writes.lock().clone()
    }
}

impl RegisterBus for RecordingBus {
    fn read32(&self, offset: u32) -> u32 {
        self.get(offset)
    }

    fn write32(&self, offset: u32, value: u32) {
        self.registers.lock().insert(offset, value);
        self.writes.lock().push((offset, value));
    }
}

// =============================================================================
// Mock Clock
// =============================================================================

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    now_ns: Arc<AtomicU64>,
}

impl MockClock {
    /// Create a clock at time zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward
    pub fn advance_ns(&self, ns: u64) {
        self.now_ns.fetch_add(ns, Ordering::SeqCst);
    }

    /// Jump to an absolute time
    pub fn set_ns(&self, ns: u64) {
        self.now_ns.store(ns, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Mock Delay
// =============================================================================

/// Delay that records how long it was asked to wait.
#[derive(Debug, Default)]
pub struct MockDelay {
    total_ns: Cell<u64>,
    calls: Cell<u32>,
    clock: Option<MockClock>,
}

impl MockDelay {
    /// Create a new mock delay
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock delay that advances `clock` by every delay
    pub fn with_clock(clock: MockClock) -> Self {
        Self {
            clock: Some(clock),
            ..Self::default()
        }
    }

    /// Total nanoseconds "delayed"
    pub fn total_ns(&self) -> u64 {
        self.total_ns.get()
    }

    /// Number of delay calls
    pub fn calls(&self) -> u32 {
        self.calls.get()
    }
}

impl embedded_hal::delay::DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.total_ns.set(self.total_ns.get() + u64::from(ns));
        self.calls.set(self.calls.get() + 1);
        if let Some(clock) = &self.clock {
            clock.advance_ns(u64::from(ns));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::delay::DelayNs;

    #[test]
    fn recording_bus_reads_back_writes() {
        let bus = RecordingBus::new();
        assert_eq!(bus.read32(0x10), 0);
        bus.write32(0x10, 7);
        assert_eq!(bus.read32(0x10), 7);
        assert_eq!(bus.writes(), vec![(0x10, 7)]);
    }

    #[test]
    fn recording_bus_set_is_not_a_write() {
        let bus = RecordingBus::new();
        bus.set(0x04, 3);
        assert_eq!(bus.read32(0x04), 3);
        assert!(bus.writes().is_empty());
    }

    #[test]
    fn mock_delay_tracks_time() {
        let mut delay = MockDelay::new();
        delay.delay_ns(1000);
        delay.delay_us(2);
        assert_eq!(delay.total_ns(), 3000);
        assert_eq!(delay.calls(), 2);
    }

    #[test]
    fn mock_delay_advances_shared_clock() {
        let clock = MockClock::new();
        let mut delay = MockDelay::with_clock(clock.clone());
        delay.delay_us(5);
        assert_eq!(clock.now_ns(), 5_000);
    }
}

// =============================================================================
// Host Buffers
// =============================================================================

/// Host-allocated buffers for both directions.
#[derive(Debug, Clone)]
pub struct HostBuffers {
    tx: Arc<BufferArena>,
    rx: Arc<BufferArena>,
}

impl HostBuffers {
    /// Allocate `count` slots of `slot_size` bytes per direction
    pub fn new(count: usize, slot_size: usize) -> Self {
        Self {
            tx: Arc::new(BufferArena::new(count, slot_size)),
            rx: Arc::new(BufferArena::new(count, slot_size)),
        }
    }
}

impl BufferMapping for HostBuffers {
    fn arena(&self, direction: Direction) -> Arc<BufferArena> {
        match direction {
            Direction::Tx => Arc::clone(&self.tx),
            Direction::Rx => Arc::clone(&self.rx),
        }
    }
}
