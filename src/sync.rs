//! Cooperative cancellation.
//!
//! Every loop in a run checks one shared flag once per iteration. The flag
//! is set by a signal handler, an explicit stop call or the run deadline.
//!
//! # Example
//!
//! ```ignore
//! let cancel = context.cancel_token();
//! ctrlc::set_handler(move || cancel.cancel())?;
//! let report = context.run()?;
//! ```

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create an unset token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request every observer to stop
    #[inline]
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Check if cancellation was requested
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
