//! DMA control: both channels, the register bus and the process step.

use core::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, trace, warn};
use parking_lot::Mutex;

use super::{BufferMapping, BufferRing, DmaChannel, Direction, HardwareUpdate, SlotHandle};
use crate::error::{Error, Result};
use crate::internal::register::RegisterBus;
use crate::internal::register::dma::{
    ChannelRegs, CtrlRegs, DEVICE_IDENT, LOOPBACK_INTERNAL, extend_loop_status,
};

/// Options applied when the channels are created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaOptions {
    /// Route TX back to RX inside the device
    pub loopback: bool,
    /// Workers fill and verify slots in place
    pub zero_copy: bool,
}

/// Result of one process step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// TX reconciliation
    pub tx: HardwareUpdate,
    /// RX reconciliation
    pub rx: HardwareUpdate,
}

impl ProcessReport {
    /// Update for `direction`
    pub fn update(&self, direction: Direction) -> HardwareUpdate {
        match direction {
            Direction::Tx => self.tx,
            Direction::Rx => self.rx,
        }
    }

    /// Overflow detected by this step, if any (TX reported first)
    pub fn overflow(&self) -> Option<Error> {
        Direction::ALL.into_iter().find_map(|direction| {
            let dropped = self.update(direction).dropped;
            (dropped > 0).then_some(Error::RingOverflow { direction, dropped })
        })
    }
}

/// Snapshot of the control-level counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlCounters {
    /// Process steps executed
    pub process_calls: u64,
    /// TX slots consumed by the device
    pub tx_completed: u64,
    /// RX slots filled by the device
    pub rx_completed: u64,
    /// Process steps that detected an overflow
    pub overflow_events: u64,
    /// TX slots reported beyond the committed index
    pub tx_dropped: u64,
    /// RX slots overwritten before they were released
    pub rx_dropped: u64,
}

#[derive(Debug, Default)]
struct AtomicCounters {
    process_calls: AtomicU64,
    tx_completed: AtomicU64,
    rx_completed: AtomicU64,
    overflow_events: AtomicU64,
    tx_dropped: AtomicU64,
    rx_dropped: AtomicU64,
}

/// Host-side controller of a bidirectional ring transport.
///
/// Channel state sits behind one lock per direction, held only while ring
/// indices are read or updated. Register I/O always happens with the
/// channel lock released; concurrent process steps are serialized by a
/// separate lock so hardware indices are only ever advanced by one caller.
pub struct DmaControl<B: RegisterBus> {
    bus: B,
    tx: Mutex<DmaChannel>,
    rx: Mutex<DmaChannel>,
    process_lock: Mutex<()>,
    buffer_size: usize,
    capacity: usize,
    options: DmaOptions,
    counters: AtomicCounters,
}

impl<B: RegisterBus> DmaControl<B> {
    /// Identify the device, check its buffer geometry against `mapping`
    /// and create both (disabled) channels.
    pub fn open<M: BufferMapping + ?Sized>(bus: B, mapping: &M, options: DmaOptions) -> Result<Self> {
        let ctrl = CtrlRegs::new(&bus);

        let ident = ctrl.ident();
        if ident != DEVICE_IDENT {
            return Err(Error::device_unavailable(format!(
                "unexpected identification 0x{ident:08x}"
            )));
        }

        let capacity = ctrl.buffer_count() as usize;
        let buffer_size = ctrl.buffer_size() as usize;
        if capacity == 0 || buffer_size == 0 {
            return Err(Error::device_unavailable(format!(
                "device reports empty rings ({capacity} x {buffer_size} bytes)"
            )));
        }

        let tx_arena = mapping.arena(Direction::Tx);
        let rx_arena = mapping.arena(Direction::Rx);
        for arena in [&tx_arena, &rx_arena] {
            if arena.len() != capacity || arena.slot_size() != buffer_size {
                return Err(Error::device_unavailable(format!(
                    "buffer mapping is {} x {} bytes, device reports {capacity} x {buffer_size}",
                    arena.len(),
                    arena.slot_size()
                )));
            }
        }

        ctrl.set_loopback(if options.loopback { LOOPBACK_INTERNAL } else { 0 });

        info!(
            "DMA device opened: {capacity} buffers x {buffer_size} bytes, loopback={}, zero_copy={}",
            options.loopback, options.zero_copy
        );

        let channel = |direction, arena| Mutex::new(DmaChannel::new(BufferRing::new(direction, arena)));

        Ok(Self {
            tx: channel(Direction::Tx, tx_arena),
            rx: channel(Direction::Rx, rx_arena),
            bus,
            process_lock: Mutex::new(()),
            buffer_size,
            capacity,
            options,
            counters: AtomicCounters::default(),
        })
    }

    fn channel(&self, direction: Direction) -> &Mutex<DmaChannel> {
        match direction {
            Direction::Tx => &self.tx,
            Direction::Rx => &self.rx,
        }
    }

    /// Register bus handle
    #[inline]
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Slots per ring
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Device slot size in bytes
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Options the channels were created with
    #[inline]
    pub fn options(&self) -> DmaOptions {
        self.options
    }

    /// Check if workers access slots in place
    #[inline]
    pub fn zero_copy(&self) -> bool {
        self.options.zero_copy
    }

    // =========================================================================
    // Channel Control
    // =========================================================================

    /// Start the device channel and accept claims
    pub fn enable(&self, direction: Direction) {
        ChannelRegs::new(&self.bus, direction).start();
        self.channel(direction).lock().enabled = true;
        info!("{direction} channel enabled");
    }

    /// Refuse claims and stop the device channel
    pub fn disable(&self, direction: Direction) {
        self.channel(direction).lock().enabled = false;
        ChannelRegs::new(&self.bus, direction).stop();
        info!("{direction} channel disabled");
    }

    /// Enable both channels, RX first so replies always have somewhere to land
    pub fn enable_all(&self) {
        self.enable(Direction::Rx);
        self.enable(Direction::Tx);
    }

    /// Disable both channels and return every slot to the free pool
    pub fn shutdown(&self) {
        for direction in Direction::ALL {
            self.disable(direction);
        }
        let _serial = self.process_lock.lock();
        for direction in Direction::ALL {
            self.channel(direction).lock().ring.reset();
        }
        debug!("DMA rings released");
    }

    // =========================================================================
    // Claims
    // =========================================================================

    /// Claim the next free TX slot
    pub fn try_claim_write(&self) -> Option<SlotHandle> {
        let mut channel = self.tx.lock();
        if !channel.enabled {
            return None;
        }
        channel.ring.try_claim()
    }

    /// Hand a filled TX slot to the device
    pub fn commit(&self, handle: SlotHandle) -> bool {
        let sequence = handle.sequence();
        let accepted = self.tx.lock().ring.commit(handle);
        if !accepted {
            debug!("TX commit rejected for stale handle {sequence}");
        }
        accepted
    }

    /// Claim the oldest completed RX slot
    pub fn try_claim_read(&self) -> Option<SlotHandle> {
        let mut channel = self.rx.lock();
        if !channel.enabled {
            return None;
        }
        channel.ring.try_claim()
    }

    /// Return a consumed RX slot to the device
    pub fn release(&self, handle: SlotHandle) -> bool {
        let sequence = handle.sequence();
        let accepted = self.rx.lock().ring.release(handle);
        if !accepted {
            debug!("RX release ignored for invalidated handle {sequence}");
        }
        accepted
    }

    /// Slots in use on `direction` (see [`BufferRing::occupancy`])
    pub fn occupancy(&self, direction: Direction) -> u64 {
        self.channel(direction).lock().ring.occupancy()
    }

    /// `(claim, software, hardware)` indices of `direction`
    pub fn indices(&self, direction: Direction) -> (u64, u64, u64) {
        let channel = self.channel(direction).lock();
        (
            channel.ring.claim_index(),
            channel.ring.software_index(),
            channel.ring.hardware_index(),
        )
    }

    // =========================================================================
    // Process Step
    // =========================================================================

    /// Reconcile software and hardware progress on both channels.
    ///
    /// For each enabled channel: publish the software index through the
    /// doorbell, read the loop-status word, extend it and advance the ring.
    /// Overflows are counted and logged; they never fail the step.
    pub fn process(&self) -> ProcessReport {
        let _serial = self.process_lock.lock();
        self.counters.process_calls.fetch_add(1, Ordering::Relaxed);

        let mut report = ProcessReport::default();
        for direction in Direction::ALL {
            let channel = self.channel(direction);
            let (software, previous, capacity) = {
                let channel = channel.lock();
                if !channel.enabled {
                    continue;
                }
                (
                    channel.ring.software_index(),
                    channel.ring.hardware_index(),
                    channel.ring.capacity(),
                )
            };

            let regs = ChannelRegs::new(&self.bus, direction);
            regs.set_sw_count(software as u32);
            let reported = extend_loop_status(previous, regs.loop_status(), capacity);

            let update = channel.lock().ring.advance_hardware(reported);
            if update.completed > 0 {
                trace!("{direction} hardware index {previous} -> {reported}");
            }
            self.account(direction, update);

            match direction {
                Direction::Tx => report.tx = update,
                Direction::Rx => report.rx = update,
            }
        }
        report
    }

    fn account(&self, direction: Direction, update: HardwareUpdate) {
        let (completed, dropped) = match direction {
            Direction::Tx => (&self.counters.tx_completed, &self.counters.tx_dropped),
            Direction::Rx => (&self.counters.rx_completed, &self.counters.rx_dropped),
        };
        completed.fetch_add(update.completed, Ordering::Relaxed);
        if update.dropped > 0 {
            dropped.fetch_add(update.dropped, Ordering::Relaxed);
            self.counters.overflow_events.fetch_add(1, Ordering::Relaxed);
            warn!(
                "{}",
                Error::RingOverflow {
                    direction,
                    dropped: update.dropped
                }
            );
        }
    }

    /// Counter snapshot
    pub fn counters(&self) -> ControlCounters {
        let c = &self.counters;
        ControlCounters {
            process_calls: c.process_calls.load(Ordering::Relaxed),
            tx_completed: c.tx_completed.load(Ordering::Relaxed),
            rx_completed: c.rx_completed.load(Ordering::Relaxed),
            overflow_events: c.overflow_events.load(Ordering::Relaxed),
            tx_dropped: c.tx_dropped.load(Ordering::Relaxed),
            rx_dropped: c.rx_dropped.load(Ordering::Relaxed),
        }
    }
}

impl<B: RegisterBus> core::fmt::Debug for DmaControl<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaControl")
            .field("capacity", &self.capacity)
            .field("buffer_size", &self.buffer_size)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::register::dma::{
        BUFFER_COUNT_OFFSET, BUFFER_SIZE_OFFSET, CTRL_BASE, ENABLE_OFFSET, ENABLE_RUN,
        IDENT_OFFSET, LOOP_STATUS_OFFSET, LOOPBACK_OFFSET, RX_BASE, SW_COUNT_OFFSET, TX_BASE,
        encode_loop_status,
    };
    use crate::testing::{HostBuffers, RecordingBus};

    const CAPACITY: usize = 4;
    const SIZE: usize = 32;

    fn device_bus() -> RecordingBus {
        let bus = RecordingBus::new();
        bus.set(CTRL_BASE + IDENT_OFFSET, DEVICE_IDENT);
        bus.set(CTRL_BASE + BUFFER_COUNT_OFFSET, CAPACITY as u32);
        bus.set(CTRL_BASE + BUFFER_SIZE_OFFSET, SIZE as u32);
        bus
    }

    fn open(options: DmaOptions) -> DmaControl<RecordingBus> {
        DmaControl::open(device_bus(), &HostBuffers::new(CAPACITY, SIZE), options).unwrap()
    }

    fn report_progress(control: &DmaControl<RecordingBus>, direction: Direction, count: u64) {
        let base = match direction {
            Direction::Tx => TX_BASE,
            Direction::Rx => RX_BASE,
        };
        control
            .bus()
            .set(base + LOOP_STATUS_OFFSET, encode_loop_status(count, CAPACITY));
    }

    // =========================================================================
    // Open Tests
    // =========================================================================

    #[test]
    fn open_rejects_missing_device() {
        let bus = RecordingBus::new();
        let err = DmaControl::open(bus, &HostBuffers::new(CAPACITY, SIZE), DmaOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::DeviceUnavailable { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn open_rejects_geometry_mismatch() {
        let err = DmaControl::open(device_bus(), &HostBuffers::new(8, SIZE), DmaOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::DeviceUnavailable { .. }));
    }

    #[test]
    fn open_programs_loopback() {
        let control = open(DmaOptions {
            loopback: true,
            zero_copy: false,
        });
        assert_eq!(control.bus().get(CTRL_BASE + LOOPBACK_OFFSET), LOOPBACK_INTERNAL);
        assert_eq!(control.capacity(), CAPACITY);
        assert_eq!(control.buffer_size(), SIZE);
    }

    #[test]
    fn channels_start_disabled() {
        let control = open(DmaOptions::default());
        assert!(control.try_claim_write().is_none());
        assert!(!control.tx.lock().enabled);
    }

    #[test]
    fn enable_starts_device_channel() {
        let control = open(DmaOptions::default());
        control.enable_all();
        assert_eq!(control.bus().get(TX_BASE + ENABLE_OFFSET) & ENABLE_RUN, ENABLE_RUN);
        assert_eq!(control.bus().get(RX_BASE + ENABLE_OFFSET) & ENABLE_RUN, ENABLE_RUN);
        assert!(control.try_claim_write().is_some());
    }

    // =========================================================================
    // Process Step Tests
    // =========================================================================

    #[test]
    fn process_publishes_software_index() {
        let control = open(DmaOptions::default());
        control.enable_all();

        for _ in 0..3 {
            let h = control.try_claim_write().unwrap();
            assert!(control.commit(h));
        }
        control.process();

        assert_eq!(control.bus().get(TX_BASE + SW_COUNT_OFFSET), 3);
        assert_eq!(control.counters().process_calls, 1);
    }

    #[test]
    fn process_frees_consumed_tx_slots() {
        let control = open(DmaOptions::default());
        control.enable_all();

        for _ in 0..CAPACITY {
            let h = control.try_claim_write().unwrap();
            control.commit(h);
        }
        assert!(control.try_claim_write().is_none());

        report_progress(&control, Direction::Tx, 2);
        let report = control.process();
        assert_eq!(report.tx.completed, 2);
        assert!(report.overflow().is_none());
        assert!(control.try_claim_write().is_some());
    }

    #[test]
    fn process_makes_rx_slots_readable() {
        let control = open(DmaOptions::default());
        control.enable_all();
        assert!(control.try_claim_read().is_none());

        report_progress(&control, Direction::Rx, 1);
        control.process();

        let h = control.try_claim_read().unwrap();
        assert_eq!(h.sequence(), 0);
        assert!(control.release(h));
        control.process();
        assert_eq!(control.bus().get(RX_BASE + SW_COUNT_OFFSET), 1);
    }

    #[test]
    fn process_counts_rx_overrun() {
        let control = open(DmaOptions::default());
        control.enable_all();

        report_progress(&control, Direction::Rx, CAPACITY as u64 + 3);
        let report = control.process();

        match report.overflow() {
            Some(Error::RingOverflow { direction, dropped }) => {
                assert_eq!(direction, Direction::Rx);
                assert_eq!(dropped, 3);
            }
            other => panic!("expected overflow, got {other:?}"),
        }
        let counters = control.counters();
        assert_eq!(counters.rx_dropped, 3);
        assert_eq!(counters.overflow_events, 1);
        assert_eq!(control.indices(Direction::Rx).1, 3);
    }

    #[test]
    fn process_clamps_tx_report_beyond_commits() {
        let control = open(DmaOptions::default());
        control.enable_all();
        let h = control.try_claim_write().unwrap();
        control.commit(h);

        report_progress(&control, Direction::Tx, 3);
        let report = control.process();
        assert_eq!(report.tx, HardwareUpdate { completed: 1, dropped: 2 });
        assert_eq!(control.counters().tx_dropped, 2);
    }

    #[test]
    fn process_skips_disabled_channels() {
        let control = open(DmaOptions::default());
        report_progress(&control, Direction::Rx, 2);
        let report = control.process();
        assert_eq!(report, ProcessReport::default());
        assert_eq!(control.indices(Direction::Rx), (0, 0, 0));
    }

    #[test]
    fn shutdown_stops_channels_and_resets_rings() {
        let control = open(DmaOptions::default());
        control.enable_all();
        let h = control.try_claim_write().unwrap();
        control.commit(h);

        control.shutdown();
        assert_eq!(control.bus().get(TX_BASE + ENABLE_OFFSET) & ENABLE_RUN, 0);
        assert_eq!(control.indices(Direction::Tx), (0, 0, 0));
        assert!(control.try_claim_write().is_none());
    }
}
