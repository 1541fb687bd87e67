//! CPU pinning for worker threads.
//!
//! Pinning is a hint: failure is logged and the thread keeps running
//! wherever the scheduler puts it. Outside Linux it does nothing.

use std::num::NonZeroUsize;

/// Number of CPUs available to this process
pub fn online_cpus() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// Pin the calling thread to `core` (taken modulo the online CPU count)
#[cfg(target_os = "linux")]
pub fn pin_current_thread(core: usize) -> std::io::Result<()> {
    let core = core % online_cpus();
    // SAFETY: cpu_set_t is a plain bitmask; zeroed is the empty set and
    // CPU_SET stays within it because `core` is below the CPU count.
    let result = unsafe {
        let mut set: libc::cpu_set_t = core::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        libc::sched_setaffinity(0, core::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Pin the calling thread to `core` (no-op on this platform)
#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_core: usize) -> std::io::Result<()> {
    Ok(())
}

/// Pin the calling thread if a core was requested, warning on failure
pub fn apply(role: &str, core: Option<usize>) {
    let Some(core) = core else {
        return;
    };
    match pin_current_thread(core) {
        Ok(()) => log::debug!("{role} thread pinned to CPU {}", core % online_cpus()),
        Err(e) => log::warn!("failed to pin {role} thread to CPU {core}: {e}"),
    }
}
