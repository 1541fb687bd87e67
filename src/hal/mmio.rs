//! Memory-mapped access to a real device.
//!
//! The device file (a UIO node or a PCIe BAR resource file) exposes the
//! register window at offset 0 and one buffer window per direction at the
//! offsets the control block advertises. [`MmioBus`] performs volatile
//! 32-bit accesses on the registers; [`DeviceBuffers`] turns the buffer
//! windows into the arenas the rings run on, so the workers fill and check
//! the very memory the device transfers from and to.

use core::ptr::NonNull;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use log::info;

use crate::error::{Error, Result};
use crate::internal::dma::{BufferArena, BufferMapping, Direction};
use crate::internal::register::RegisterBus;
use crate::internal::register::dma::{CtrlRegs, DEVICE_IDENT};

/// Value returned for reads outside the mapped window
const UNMAPPED_READ: u32 = 0xFFFF_FFFF;

fn open_device(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::device_unavailable(format!("{}: {e}", path.display())))
}

// =============================================================================
// Mapped Region
// =============================================================================

/// A shared `mmap` of part of a device file, unmapped on drop
#[derive(Debug)]
struct MappedRegion {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is plain shared memory that stays mapped until `drop`;
// every user synchronises its own accesses.
unsafe impl Send for MappedRegion {}
// SAFETY: see above
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    fn map(file: &File, path: &Path, offset: u64, len: usize) -> Result<Self> {
        // SAFETY: mapping a fresh shared region of an open file; the result is
        // checked against MAP_FAILED before use. The mapping outlives `file`.
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            return Err(Error::device_unavailable(format!(
                "mmap {} ({len} bytes at 0x{offset:x}): {err}",
                path.display()
            )));
        }

        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::device_unavailable("mmap returned a null mapping"))?;
        Ok(Self { base, len })
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the region returned by mmap in `map`
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

// =============================================================================
// Register Bus
// =============================================================================

/// Register bus over an `mmap`ed register window.
#[derive(Debug)]
pub struct MmioBus {
    region: MappedRegion,
}

impl MmioBus {
    /// Map `len` bytes of registers from `path`
    pub fn open(path: impl AsRef<Path>, len: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = open_device(path)?;
        let region = MappedRegion::map(&file, path, 0, len)?;

        info!("mapped {len} bytes of registers from {}", path.display());
        Ok(Self { region })
    }

    /// Size of the mapped window in bytes
    pub fn len(&self) -> usize {
        self.region.len
    }

    /// Check if the window is empty
    pub fn is_empty(&self) -> bool {
        self.region.len == 0
    }

    fn register(&self, offset: u32) -> Option<*mut u32> {
        let offset = offset as usize;
        if offset % 4 != 0 || offset + 4 > self.region.len {
            return None;
        }
        // SAFETY: bounds and alignment checked above; mmap returns page-aligned memory
        Some(unsafe { self.region.base.as_ptr().add(offset).cast::<u32>() })
    }
}

impl RegisterBus for MmioBus {
    fn read32(&self, offset: u32) -> u32 {
        match self.register(offset) {
            // SAFETY: in-bounds aligned register inside a live mapping
            Some(reg) => unsafe { reg.read_volatile() },
            None => UNMAPPED_READ,
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        if let Some(reg) = self.register(offset) {
            // SAFETY: in-bounds aligned register inside a live mapping
            unsafe { reg.write_volatile(value) }
        }
    }
}

// =============================================================================
// Device Buffers
// =============================================================================

/// Slot memory of a real device, mapped from its device file.
#[derive(Debug, Clone)]
pub struct DeviceBuffers {
    tx: Arc<BufferArena>,
    rx: Arc<BufferArena>,
}

impl DeviceBuffers {
    /// Map both buffer windows of the device behind `bus` from `path`.
    ///
    /// The identification register is checked before any geometry is
    /// trusted. A device that advertises no window for a direction is
    /// unavailable.
    pub fn open<B: RegisterBus + ?Sized>(path: impl AsRef<Path>, bus: &B) -> Result<Self> {
        let path = path.as_ref();
        let ctrl = CtrlRegs::new(bus);

        let ident = ctrl.ident();
        if ident != DEVICE_IDENT {
            return Err(Error::device_unavailable(format!(
                "{}: unexpected identification 0x{ident:08x}",
                path.display()
            )));
        }

        let count = ctrl.buffer_count() as usize;
        let slot_size = ctrl.buffer_size() as usize;
        if count == 0 || slot_size == 0 {
            return Err(Error::device_unavailable(format!(
                "{}: device reports empty rings ({count} x {slot_size} bytes)",
                path.display()
            )));
        }

        let file = open_device(path)?;
        let map = |direction: Direction| -> Result<Arc<BufferArena>> {
            let offset = ctrl.window(direction);
            if offset == 0 {
                return Err(Error::device_unavailable(format!(
                    "{}: device does not expose its {direction} buffers",
                    path.display()
                )));
            }
            let region = Arc::new(MappedRegion::map(
                &file,
                path,
                u64::from(offset),
                count * slot_size,
            )?);
            let base = region.base;
            // SAFETY: the region spans `count * slot_size` bytes, is kept
            // alive by the arena and is reached through nothing else
            Ok(Arc::new(unsafe { BufferArena::from_raw(base, count, slot_size, region) }))
        };

        let buffers = Self {
            tx: map(Direction::Tx)?,
            rx: map(Direction::Rx)?,
        };
        info!(
            "mapped {count} x {slot_size} byte buffers per direction from {}",
            path.display()
        );
        Ok(buffers)
    }
}

impl BufferMapping for DeviceBuffers {
    fn arena(&self, direction: Direction) -> Arc<BufferArena> {
        match direction {
            Direction::Tx => Arc::clone(&self.tx),
            Direction::Rx => Arc::clone(&self.rx),
        }
    }
}
