//! Slot memory shared between the host and the device.

use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::Direction;

/// Bytes of one slot, either host-allocated or inside a device mapping
#[derive(Debug)]
pub struct SlotMemory(Backing);

#[derive(Debug)]
enum Backing {
    Owned(Box<[u8]>),
    Mapped { ptr: NonNull<u8>, len: usize },
}

// SAFETY: a mapped slot is only reachable through its arena's mutex, and the
// arena keeps the mapping alive for as long as the slot exists.
unsafe impl Send for Backing {}

impl Deref for SlotMemory {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        match &self.0 {
            Backing::Owned(bytes) => bytes,
            // SAFETY: guaranteed valid by the `BufferArena::from_raw` contract
            Backing::Mapped { ptr, len } => unsafe {
                core::slice::from_raw_parts(ptr.as_ptr(), *len)
            },
        }
    }
}

impl DerefMut for SlotMemory {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.0 {
            Backing::Owned(bytes) => bytes,
            // SAFETY: guaranteed valid and unaliased by the
            // `BufferArena::from_raw` contract; the mutex serialises access
            Backing::Mapped { ptr, len } => unsafe {
                core::slice::from_raw_parts_mut(ptr.as_ptr(), *len)
            },
        }
    }
}

/// Fixed-size byte buffers backing one ring.
///
/// Logical ownership of a slot is decided by the ring indices. The per-slot
/// lock only makes concurrent host/device access memory-safe; under the ring
/// protocol it is never contended.
pub struct BufferArena {
    slots: Box<[Mutex<SlotMemory>]>,
    slot_size: usize,
    owner: Option<Arc<dyn Send + Sync>>,
}

impl BufferArena {
    /// Allocate `count` zeroed slots of `slot_size` bytes
    pub fn new(count: usize, slot_size: usize) -> Self {
        let slots = (0..count)
            .map(|_| {
                Mutex::new(SlotMemory(Backing::Owned(
                    vec![0u8; slot_size].into_boxed_slice(),
                )))
            })
            .collect();
        Self {
            slots,
            slot_size,
            owner: None,
        }
    }

    /// Carve `count` consecutive slots of `slot_size` bytes out of foreign
    /// memory starting at `base`. `owner` is kept alive with the arena.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `count * slot_size`
    /// bytes for as long as `owner` lives, and must not be accessed through
    /// any other Rust reference while the arena exists.
    pub unsafe fn from_raw(
        base: NonNull<u8>,
        count: usize,
        slot_size: usize,
        owner: Arc<dyn Send + Sync>,
    ) -> Self {
        let slots = (0..count)
            .map(|i| {
                // SAFETY: in bounds of the region described by the caller
                let ptr = unsafe { base.add(i * slot_size) };
                Mutex::new(SlotMemory(Backing::Mapped {
                    ptr,
                    len: slot_size,
                }))
            })
            .collect();
        Self {
            slots,
            slot_size,
            owner: Some(owner),
        }
    }

    /// Number of slots
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if the arena has no slots
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Size of every slot in bytes
    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Lock slot `index` (taken modulo the slot count)
    #[inline]
    pub fn lock(&self, index: usize) -> MutexGuard<'_, SlotMemory> {
        self.slots[index % self.slots.len()].lock()
    }
}

impl core::fmt::Debug for BufferArena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferArena")
            .field("slots", &self.slots.len())
            .field("slot_size", &self.slot_size)
            .field("mapped", &self.owner.is_some())
            .finish()
    }
}

/// Device-side view of the buffer memory: one arena per direction.
///
/// Implemented by whatever maps the device buffers into the host. The
/// arenas must stay valid and keep their geometry for the whole run.
pub trait BufferMapping {
    /// Arena backing the ring for `direction`
    fn arena(&self, direction: Direction) -> Arc<BufferArena>;
}

// =============================================================================
// Slot Handle
// =============================================================================

/// Exclusive ownership of one claimed slot.
///
/// A handle is produced by a claim and consumed by `commit` (TX) or
/// `release` (RX); moving it is the only way a slot changes hands.
#[derive(Debug)]
pub struct SlotHandle {
    direction: Direction,
    sequence: u64,
    arena: Arc<BufferArena>,
}

impl SlotHandle {
    pub(super) fn new(direction: Direction, sequence: u64, arena: Arc<BufferArena>) -> Self {
        Self {
            direction,
            sequence,
            arena,
        }
    }

    /// Ring direction this slot belongs to
    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Monotonic position of this claim in its ring
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Physical slot index
    #[inline]
    pub fn slot(&self) -> usize {
        (self.sequence % self.arena.len() as u64) as usize
    }

    /// Slot size in bytes
    #[inline]
    pub fn capacity(&self) -> usize {
        self.arena.slot_size()
    }

    /// Read access to the slot bytes
    #[inline]
    pub fn buffer(&self) -> MutexGuard<'_, SlotMemory> {
        self.arena.lock(self.slot())
    }

    /// Write access to the slot bytes
    #[inline]
    pub fn buffer_mut(&mut self) -> MutexGuard<'_, SlotMemory> {
        self.arena.lock(self.slot())
    }
}

// =============================================================================
// Tests
// =============================================================================
