//! Fixed-capacity slot ring with software and hardware indices.
//!
//! TX ring:
//! - `[hardware, software)`: committed, owned by the device
//! - `[software, claim)`: claimed by the writer, not yet committed
//! - claims fail once `claim - hardware == capacity`
//!
//! RX ring:
//! - `[software, claim)`: filled and claimed by the reader
//! - `[claim, hardware)`: filled, waiting to be claimed
//! - `[hardware, software + capacity)`: free for the device to fill

use std::sync::Arc;

use super::{BufferArena, Direction, SlotHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Claimed,
    /// TX: handed to the device
    Committed,
    /// RX: consumed, waiting for earlier slots
    Released,
}

/// Outcome of reconciling a hardware progress report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HardwareUpdate {
    /// Slots the device completed since the previous report
    pub completed: u64,
    /// Slots lost or rejected because the report broke the ring protocol
    pub dropped: u64,
}

/// Circular slot ring for one transfer direction.
#[derive(Debug)]
pub struct BufferRing {
    direction: Direction,
    arena: Arc<BufferArena>,
    states: Box<[SlotState]>,
    /// Next sequence handed out by a claim
    claim: u64,
    /// TX: committed prefix, RX: released prefix
    software: u64,
    /// TX: consumed by the device, RX: filled by the device
    hardware: u64,
}

impl BufferRing {
    /// Create a ring over `arena`
    pub fn new(direction: Direction, arena: Arc<BufferArena>) -> Self {
        let states = vec![SlotState::Idle; arena.len()].into_boxed_slice();
        Self {
            direction,
            arena,
            states,
            claim: 0,
            software: 0,
            hardware: 0,
        }
    }

    /// Transfer direction
    #[inline(always)]
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Number of slots
    #[inline(always)]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.states.len()
    }

    /// Size of each slot in bytes
    #[inline(always)]
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.arena.slot_size()
    }

    /// Software progress index
    #[inline(always)]
    #[must_use]
    pub fn software_index(&self) -> u64 {
        self.software
    }

    /// Hardware progress index
    #[inline(always)]
    #[must_use]
    pub fn hardware_index(&self) -> u64 {
        self.hardware
    }

    /// Next claim sequence
    #[inline(always)]
    #[must_use]
    pub fn claim_index(&self) -> u64 {
        self.claim
    }

    /// Slots currently claimed or owned by the device (TX), or filled and
    /// not yet released (RX)
    #[must_use]
    pub fn occupancy(&self) -> u64 {
        match self.direction {
            Direction::Tx => self.claim - self.hardware,
            Direction::Rx => self.hardware - self.software,
        }
    }

    /// RX slots filled by the device and not yet claimed
    #[must_use]
    pub fn ready(&self) -> u64 {
        match self.direction {
            Direction::Tx => 0,
            Direction::Rx => self.hardware.saturating_sub(self.claim),
        }
    }

    #[inline(always)]
    fn slot(&self, sequence: u64) -> usize {
        (sequence % self.states.len() as u64) as usize
    }

    fn set_state(&mut self, sequence: u64, state: SlotState) {
        let slot = self.slot(sequence);
        self.states[slot] = state;
    }

    fn state(&self, sequence: u64) -> SlotState {
        self.states[self.slot(sequence)]
    }

    // =========================================================================
    // Claims
    // =========================================================================

    /// Claim the next slot, or `None` if none is available right now.
    ///
    /// TX hands out the next free slot; RX hands out the oldest filled slot.
    pub fn try_claim(&mut self) -> Option<SlotHandle> {
        if self.states.is_empty() {
            return None;
        }

        let available = match self.direction {
            Direction::Tx => self.claim - self.hardware < self.capacity() as u64,
            Direction::Rx => self.ready() > 0,
        };
        if !available {
            return None;
        }

        let sequence = self.claim;
        debug_assert_eq!(self.state(sequence), SlotState::Idle);
        self.set_state(sequence, SlotState::Claimed);
        self.claim += 1;

        Some(SlotHandle::new(
            self.direction,
            sequence,
            Arc::clone(&self.arena),
        ))
    }

    /// Check that `handle` is a live claim from this ring
    fn owns(&self, handle: &SlotHandle) -> bool {
        let sequence = handle.sequence();
        handle.direction() == self.direction
            && sequence >= self.software
            && sequence < self.claim
            && self.state(sequence) == SlotState::Claimed
    }

    /// Hand a filled TX slot to the device.
    ///
    /// Returns `false` (and drops the handle) if it is not a live TX claim.
    pub fn commit(&mut self, handle: SlotHandle) -> bool {
        if self.direction != Direction::Tx || !self.owns(&handle) {
            return false;
        }

        self.set_state(handle.sequence(), SlotState::Committed);
        while self.software < self.claim && self.state(self.software) == SlotState::Committed {
            self.software += 1;
        }
        true
    }

    /// Return a consumed RX slot to the device.
    ///
    /// Returns `false` (and drops the handle) if it is not a live RX claim,
    /// which includes claims invalidated by an overrun.
    pub fn release(&mut self, handle: SlotHandle) -> bool {
        if self.direction != Direction::Rx || !self.owns(&handle) {
            return false;
        }

        self.set_state(handle.sequence(), SlotState::Released);
        while self.software < self.claim && self.state(self.software) == SlotState::Released {
            self.set_state(self.software, SlotState::Idle);
            self.software += 1;
        }
        true
    }

    // =========================================================================
    // Hardware Progress
    // =========================================================================

    /// Reconcile an extended hardware progress counter.
    ///
    /// Reports that do not move forward are ignored. A TX report beyond the
    /// committed index is clamped; an RX report more than one ring ahead of
    /// the software index means the device overwrote unread slots, and the
    /// software index is resynchronized to the oldest surviving slot.
    pub fn advance_hardware(&mut self, reported: u64) -> HardwareUpdate {
        if reported <= self.hardware {
            return HardwareUpdate::default();
        }

        match self.direction {
            Direction::Tx => {
                let (target, dropped) = if reported > self.software {
                    (self.software, reported - self.software)
                } else {
                    (reported, 0)
                };
                for sequence in self.hardware..target {
                    self.set_state(sequence, SlotState::Idle);
                }
                let completed = target - self.hardware;
                self.hardware = target;
                HardwareUpdate { completed, dropped }
            }
            Direction::Rx => {
                let completed = reported - self.hardware;
                self.hardware = reported;

                let capacity = self.capacity() as u64;
                let mut dropped = 0;
                if self.hardware - self.software > capacity {
                    let resync = self.hardware - capacity;
                    dropped = resync - self.software;
                    let span = dropped.min(capacity);
                    for sequence in self.software..self.software + span {
                        self.set_state(sequence, SlotState::Idle);
                    }
                    self.software = resync;
                    self.claim = self.claim.max(resync);
                }
                HardwareUpdate { completed, dropped }
            }
        }
    }

    /// Forget all progress and ownership
    pub fn reset(&mut self) {
        self.states.fill(SlotState::Idle);
        self.claim = 0;
        self.software = 0;
        self.hardware = 0;
    }
}

// =============================================================================
// Tests
// =============================================================================
