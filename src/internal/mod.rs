//! Internal Implementation Details
//!
//! This module contains implementation details that are not part of the public API.
//! Public types are re-exported through the crate-level facades.
//!
//! # Contents
//!
//! - [`constants`]: Defaults and limits
//! - [`dma`]: Buffer rings, channels and the DMA control
//! - [`register`]: Register bus trait and the device register map

pub mod constants;
pub mod dma;
pub mod register;
