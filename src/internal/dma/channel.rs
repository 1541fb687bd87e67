//! One direction of the transport: a ring and its enable flag.

use super::BufferRing;

/// A [`BufferRing`] that only accepts claims while enabled.
///
/// Always accessed under the owning control's per-channel lock.
#[derive(Debug)]
pub struct DmaChannel {
    pub(super) ring: BufferRing,
    pub(super) enabled: bool,
}

impl DmaChannel {
    /// Create a disabled channel around `ring`
    pub fn new(ring: BufferRing) -> Self {
        Self {
            ring,
            enabled: false,
        }
    }
}
