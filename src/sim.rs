//! Simulated loopback device.
//!
//! [`LoopbackDevice`] implements both the register map and the buffer
//! mapping of a DMA device in host memory, so the whole benchmark runs
//! without hardware. The device has no thread of its own: it advances
//! lazily whenever the host reads a loop-status register or rings a
//! doorbell.
//!
//! Each advance:
//!
//! 1. consumes committed TX slots up to the TX doorbell; a stalling device
//!    stops once one ring of data is queued or unreleased
//! 2. queues each consumed buffer for delivery after the configured latency,
//!    if loopback is active (internal register bit or external cable)
//! 3. delivers due buffers into RX slots, stalling or overrunning when the
//!    host has not released enough of them
//!
//! Fault injection (duplicated or corrupted deliveries) exercises the
//! receive-side classification.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::hal::clock::{Clock, MonotonicClock};
use crate::internal::constants::{DEFAULT_RING_CAPACITY, MAX_BUFFER_SIZE, PROBE_HEADER_SIZE};
use crate::internal::dma::{BufferArena, BufferMapping, Direction};
use crate::internal::register::RegisterBus;
use crate::internal::register::dma::{
    BUFFER_COUNT_OFFSET, BUFFER_SIZE_OFFSET, CTRL_BASE, DEVICE_IDENT, ENABLE_OFFSET, ENABLE_RUN,
    IDENT_OFFSET, LOOP_STATUS_OFFSET, LOOPBACK_INTERNAL, LOOPBACK_OFFSET, SCRATCH_OFFSET,
    SW_COUNT_OFFSET, channel_base, encode_loop_status,
};

/// Behavior when a delivery finds every RX slot still owned by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxFullPolicy {
    /// Hold deliveries until the host releases slots
    #[default]
    Stall,
    /// Write anyway, overwriting unreleased slots
    Overrun,
}

/// Simulated device parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimConfig {
    /// Slots per ring
    pub capacity: usize,
    /// Bytes per slot
    pub buffer_size: usize,
    /// Delay between TX consumption and RX delivery
    pub latency: Duration,
    /// RX-full behavior
    pub rx_full: RxFullPolicy,
    /// A loopback cable is attached (external loopback returns data)
    pub cable: bool,
    /// Deliver every n-th buffer twice (0 = never)
    pub duplicate_every: u64,
    /// Flip a payload byte of every n-th buffer (0 = never)
    pub corrupt_every: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_RING_CAPACITY,
            buffer_size: MAX_BUFFER_SIZE,
            latency: Duration::ZERO,
            rx_full: RxFullPolicy::Stall,
            cable: true,
            duplicate_every: 0,
            corrupt_every: 0,
        }
    }
}

impl SimConfig {
    /// Ring geometry
    pub fn with_geometry(mut self, capacity: usize, buffer_size: usize) -> Self {
        self.capacity = capacity;
        self.buffer_size = buffer_size;
        self
    }

    /// Delivery latency
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// RX-full behavior
    pub fn with_rx_full(mut self, policy: RxFullPolicy) -> Self {
        self.rx_full = policy;
        self
    }

    /// Attach or detach the external loopback cable
    pub fn with_cable(mut self, attached: bool) -> Self {
        self.cable = attached;
        self
    }

    /// Duplicate every n-th delivery
    pub fn with_duplicate_every(mut self, n: u64) -> Self {
        self.duplicate_every = n;
        self
    }

    /// Corrupt every n-th delivery
    pub fn with_corrupt_every(mut self, n: u64) -> Self {
        self.corrupt_every = n;
        self
    }
}

/// Device-side event counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    /// TX slots consumed
    pub consumed: u64,
    /// RX slots written
    pub delivered: u64,
    /// Consumed buffers discarded because loopback was off
    pub discarded: u64,
    /// Deliveries that overwrote an unreleased RX slot
    pub overruns: u64,
    /// Extra deliveries injected
    pub duplicated: u64,
    /// Deliveries with a flipped byte
    pub corrupted: u64,
}

struct Delivery {
    ready_at: u64,
    data: Box<[u8]>,
}

#[derive(Default)]
struct SimState {
    loopback: u32,
    scratch: u32,
    enable: [u32; 2],
    tx_doorbell: u64,
    tx_consumed: u64,
    rx_released: u64,
    rx_produced: u64,
    queue: VecDeque<Delivery>,
    stats: SimStats,
}

impl SimState {
    fn running(&self, direction: Direction) -> bool {
        self.enable[slot_of(direction)] & ENABLE_RUN != 0
    }
}

fn slot_of(direction: Direction) -> usize {
    match direction {
        Direction::Tx => 0,
        Direction::Rx => 1,
    }
}

/// Extend a 32-bit doorbell value into the counter following `previous`
fn extend_doorbell(previous: u64, value: u32) -> u64 {
    previous + u64::from(value.wrapping_sub(previous as u32))
}

/// In-memory DMA device with a TX-to-RX loopback path.
pub struct LoopbackDevice {
    config: SimConfig,
    clock: Arc<dyn Clock>,
    tx: Arc<BufferArena>,
    rx: Arc<BufferArena>,
    state: Mutex<SimState>,
}

impl LoopbackDevice {
    /// Create a device on the monotonic clock
    pub fn new(config: SimConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    /// Create a device on a specific clock
    pub fn with_clock(config: SimConfig, clock: Arc<dyn Clock>) -> Self {
        debug!(
            "simulated device: {} x {} bytes, latency {:?}, rx_full {:?}",
            config.capacity, config.buffer_size, config.latency, config.rx_full
        );
        Self {
            tx: Arc::new(BufferArena::new(config.capacity, config.buffer_size)),
            rx: Arc::new(BufferArena::new(config.capacity, config.buffer_size)),
            state: Mutex::new(SimState::default()),
            config,
            clock,
        }
    }

    /// Device parameters
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Event counters
    pub fn stats(&self) -> SimStats {
        self.state.lock().stats
    }

    /// Buffers consumed but not yet delivered
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn loopback_active(&self, state: &SimState) -> bool {
        state.loopback & LOOPBACK_INTERNAL != 0 || self.config.cable
    }

    fn advance(&self, state: &mut SimState) {
        let now = self.clock.now_ns();
        let latency = self.config.latency.as_nanos() as u64;

        if state.running(Direction::Tx) {
            let looped = self.loopback_active(state);
            while state.tx_consumed < state.tx_doorbell {
                if looped && !self.has_room(state, 1) {
                    break;
                }
                let data: Box<[u8]> = Box::from(&self.tx.lock(state.tx_consumed as usize)[..]);
                state.tx_consumed += 1;
                state.stats.consumed += 1;

                if !looped {
                    state.stats.discarded += 1;
                    continue;
                }
                self.enqueue(state, data, now + latency);
            }
        }

        if state.running(Direction::Rx) {
            let capacity = self.config.capacity as u64;
            while state.queue.front().is_some_and(|d| d.ready_at <= now) {
                let full = state.rx_produced - state.rx_released >= capacity;
                if full {
                    match self.config.rx_full {
                        RxFullPolicy::Stall => break,
                        RxFullPolicy::Overrun => state.stats.overruns += 1,
                    }
                }
                let Some(delivery) = state.queue.pop_front() else {
                    break;
                };
                let mut slot = self.rx.lock(state.rx_produced as usize);
                let len = slot.len().min(delivery.data.len());
                slot[..len].copy_from_slice(&delivery.data[..len]);
                drop(slot);
                state.rx_produced += 1;
                state.stats.delivered += 1;
            }
        }
    }

    /// Check if `extra` more buffers fit between the TX side and the host.
    ///
    /// A stalling device holds at most one ring of data in flight and
    /// backpressures TX beyond that; an overrunning one never waits.
    fn has_room(&self, state: &SimState, extra: u64) -> bool {
        match self.config.rx_full {
            RxFullPolicy::Stall => {
                let held = state.rx_produced - state.rx_released;
                state.queue.len() as u64 + held + extra <= self.config.capacity as u64
            }
            RxFullPolicy::Overrun => true,
        }
    }

    fn enqueue(&self, state: &mut SimState, mut data: Box<[u8]>, ready_at: u64) {
        let n = state.stats.consumed;
        if self.config.corrupt_every > 0 && n % self.config.corrupt_every == 0 && !data.is_empty() {
            let index = PROBE_HEADER_SIZE.min(data.len() - 1);
            data[index] ^= 0xFF;
            state.stats.corrupted += 1;
        }
        if self.config.duplicate_every > 0
            && n % self.config.duplicate_every == 0
            && self.has_room(state, 2)
        {
            state.queue.push_back(Delivery {
                ready_at,
                data: data.clone(),
            });
            state.stats.duplicated += 1;
        }
        state.queue.push_back(Delivery { ready_at, data });
    }

    fn read_channel(&self, state: &mut SimState, direction: Direction, offset: u32) -> u32 {
        match offset {
            ENABLE_OFFSET => state.enable[slot_of(direction)],
            LOOP_STATUS_OFFSET => {
                self.advance(state);
                let count = match direction {
                    Direction::Tx => state.tx_consumed,
                    Direction::Rx => state.rx_produced,
                };
                encode_loop_status(count, self.config.capacity)
            }
            _ => 0,
        }
    }

    fn write_channel(&self, state: &mut SimState, direction: Direction, offset: u32, value: u32) {
        match offset {
            ENABLE_OFFSET => state.enable[slot_of(direction)] = value,
            SW_COUNT_OFFSET => {
                match direction {
                    Direction::Tx => state.tx_doorbell = extend_doorbell(state.tx_doorbell, value),
                    Direction::Rx => state.rx_released = extend_doorbell(state.rx_released, value),
                }
                self.advance(state);
            }
            _ => trace!("sim: write to unknown {direction} register 0x{offset:02x}"),
        }
    }
}

impl RegisterBus for LoopbackDevice {
    fn read32(&self, offset: u32) -> u32 {
        let mut state = self.state.lock();
        for direction in Direction::ALL {
            let base = channel_base(direction);
            if (base..base + 0x100).contains(&offset) {
                return self.read_channel(&mut state, direction, offset - base);
            }
        }
        match offset - CTRL_BASE {
            IDENT_OFFSET => DEVICE_IDENT,
            BUFFER_COUNT_OFFSET => self.config.capacity as u32,
            BUFFER_SIZE_OFFSET => self.config.buffer_size as u32,
            LOOPBACK_OFFSET => state.loopback,
            SCRATCH_OFFSET => state.scratch,
            _ => 0,
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut state = self.state.lock();
        for direction in Direction::ALL {
            let base = channel_base(direction);
            if (base..base + 0x100).contains(&offset) {
                self.write_channel(&mut state, direction, offset - base, value);
                return;
            }
        }
        match offset - CTRL_BASE {
            LOOPBACK_OFFSET => state.loopback = value,
            SCRATCH_OFFSET => state.scratch = value,
            _ => trace!("sim: write to read-only register 0x{offset:04x}"),
        }
    }
}

impl BufferMapping for LoopbackDevice {
    fn arena(&self, direction: Direction) -> Arc<BufferArena> {
        match direction {
            Direction::Tx => Arc::clone(&self.tx),
            Direction::Rx => Arc::clone(&self.rx),
        }
    }
}

impl core::fmt::Debug for LoopbackDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LoopbackDevice")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::dma::{DmaControl, DmaOptions};
    use crate::pattern::{Pattern, PatternGenerator};
    use crate::testing::MockClock;

    const CAPACITY: usize = 4;
    const SIZE: usize = 64;

    fn device(config: SimConfig, clock: &MockClock) -> Arc<LoopbackDevice> {
        Arc::new(LoopbackDevice::with_clock(
            config.with_geometry(CAPACITY, SIZE),
            Arc::new(clock.clone()),
        ))
    }

    fn open(device: &Arc<LoopbackDevice>, loopback: bool) -> DmaControl<Arc<LoopbackDevice>> {
        let control = DmaControl::open(
            Arc::clone(device),
            device.as_ref(),
            DmaOptions {
                loopback,
                zero_copy: false,
            },
        )
        .unwrap();
        control.enable_all();
        control
    }

    fn send(control: &DmaControl<Arc<LoopbackDevice>>, key: u64) {
        let mut slot = control.try_claim_write().unwrap();
        PatternGenerator::new(Pattern::Sequential, 0).fill(key, &mut slot.buffer_mut());
        assert!(control.commit(slot));
    }

    fn receive(control: &DmaControl<Arc<LoopbackDevice>>) -> Option<Vec<u8>> {
        let slot = control.try_claim_read()?;
        let data = slot.buffer().to_vec();
        assert!(control.release(slot));
        Some(data)
    }

    // =========================================================================
    // Register Tests
    // =========================================================================

    #[test]
    fn identifies_as_dma_device() {
        let clock = MockClock::new();
        let dev = device(SimConfig::default(), &clock);
        assert_eq!(dev.read32(CTRL_BASE + IDENT_OFFSET), DEVICE_IDENT);
        assert_eq!(dev.read32(CTRL_BASE + BUFFER_COUNT_OFFSET), CAPACITY as u32);
        assert_eq!(dev.read32(CTRL_BASE + BUFFER_SIZE_OFFSET), SIZE as u32);

        dev.write32(CTRL_BASE + SCRATCH_OFFSET, 0x5A5A);
        assert_eq!(dev.read32(CTRL_BASE + SCRATCH_OFFSET), 0x5A5A);
    }

    #[test]
    fn doorbell_extension_wraps() {
        assert_eq!(extend_doorbell(0, 5), 5);
        assert_eq!(extend_doorbell(u64::from(u32::MAX), 2), u64::from(u32::MAX) + 3);
    }

    // =========================================================================
    // Loopback Tests
    // =========================================================================

    #[test]
    fn loops_tx_back_to_rx() {
        let clock = MockClock::new();
        let dev = device(SimConfig::default(), &clock);
        let control = open(&dev, true);

        send(&control, 7);
        control.process();

        let data = receive(&control).unwrap();
        assert!(PatternGenerator::new(Pattern::Sequential, 0).verify(7, &data).is_ok());
        assert_eq!(dev.stats().consumed, 1);
        assert_eq!(dev.stats().delivered, 1);
    }

    #[test]
    fn latency_delays_delivery() {
        let clock = MockClock::new();
        let dev = device(SimConfig::default().with_latency(Duration::from_micros(50)), &clock);
        let control = open(&dev, true);

        send(&control, 1);
        control.process();
        control.process();
        assert!(receive(&control).is_none());
        assert_eq!(dev.queued(), 1);

        clock.advance_ns(50_000);
        control.process();
        assert!(receive(&control).is_some());
    }

    #[test]
    fn external_loopback_without_cable_discards() {
        let clock = MockClock::new();
        let dev = device(SimConfig::default().with_cable(false), &clock);
        let control = open(&dev, false);

        send(&control, 1);
        control.process();
        control.process();
        assert!(receive(&control).is_none());
        assert_eq!(dev.stats().discarded, 1);
    }

    // =========================================================================
    // RX-Full Tests
    // =========================================================================

    #[test]
    fn stall_holds_deliveries_until_release() {
        let clock = MockClock::new();
        let dev = device(SimConfig::default(), &clock);
        let control = open(&dev, true);

        for round in 0..2 {
            for key in 0..CAPACITY as u64 {
                send(&control, round * 10 + key);
            }
            control.process();
        }
        control.process();
        assert_eq!(dev.stats().delivered, CAPACITY as u64);
        assert_eq!(dev.stats().consumed, CAPACITY as u64);
        assert_eq!(dev.queued(), 0);

        for _ in 0..CAPACITY {
            receive(&control).unwrap();
        }
        control.process();
        control.process();
        assert_eq!(dev.stats().consumed, 2 * CAPACITY as u64);
        assert_eq!(dev.stats().delivered, 2 * CAPACITY as u64);
        assert_eq!(control.counters().rx_dropped, 0);
    }

    #[test]
    fn stall_backpressures_tx() {
        let clock = MockClock::new();
        let dev = device(SimConfig::default(), &clock);
        let control = open(&dev, true);

        // The host keeps committing but never releases RX
        for _ in 0..250 {
            while let Some(slot) = control.try_claim_write() {
                assert!(control.commit(slot));
            }
            control.process();
            assert!(dev.queued() <= CAPACITY);
        }

        let stats = dev.stats();
        assert_eq!(stats.consumed, CAPACITY as u64);
        assert_eq!(stats.delivered, CAPACITY as u64);
        assert!(control.try_claim_write().is_none());
        assert_eq!(control.counters().rx_dropped, 0);
    }

    #[test]
    fn stall_with_latency_bounds_queue() {
        let clock = MockClock::new();
        let dev = device(SimConfig::default().with_latency(Duration::from_micros(10)), &clock);
        let control = open(&dev, true);

        for _ in 0..50 {
            while let Some(slot) = control.try_claim_write() {
                assert!(control.commit(slot));
            }
            control.process();
            assert!(dev.queued() + control.occupancy(Direction::Rx) as usize <= CAPACITY);
        }
        assert_eq!(dev.stats().delivered, 0);

        clock.advance_ns(10_000);
        control.process();
        assert_eq!(dev.stats().delivered, CAPACITY as u64);
        assert_eq!(dev.queued(), 0);
    }

    #[test]
    fn overrun_is_detected_by_host() {
        let clock = MockClock::new();
        let dev = device(SimConfig::default().with_rx_full(RxFullPolicy::Overrun), &clock);
        let control = open(&dev, true);

        for round in 0..2 {
            for key in 0..CAPACITY as u64 {
                send(&control, round * 10 + key);
            }
            control.process();
            control.process();
        }
        assert!(dev.stats().overruns > 0);
        assert!(control.counters().rx_dropped > 0);
    }

    // =========================================================================
    // Fault Injection Tests
    // =========================================================================

    #[test]
    fn duplicate_and_corrupt_injection() {
        let clock = MockClock::new();
        let dev = device(
            SimConfig::default().with_duplicate_every(2).with_corrupt_every(3),
            &clock,
        );
        let control = open(&dev, true);

        for key in 0..3 {
            send(&control, key);
        }
        control.process();
        control.process();

        let stats = dev.stats();
        assert_eq!(stats.consumed, 3);
        assert_eq!(stats.duplicated, 1);
        assert_eq!(stats.corrupted, 1);
        assert_eq!(stats.delivered, 4);
    }
}
