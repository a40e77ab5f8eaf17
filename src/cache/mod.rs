//! Three-tier block cache.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`block`]: block indexing, geometry and tier definitions
//! - [`slots`]: slot allocator shared by every tier
//! - [`evictor`]: LRU victim selection
//! - [`tier`]: tier locking, the settle protocol and pipeline lifecycle
//! - [`host`], [`device`], [`processing`]: the three tiers
//! - [`prefetcher`]: which blocks to warm around a visible window

pub mod block;
pub mod device;
pub mod evictor;
pub mod host;
pub mod prefetcher;
pub mod processing;
pub mod slots;
pub mod tier;

use thiserror::Error;

use crate::gpu::device::DeviceError;
use slots::SlotError;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("No candidate blocks given")]
    EmptyCandidates,

    #[error("Pipeline halted")]
    Halted,

    #[error(transparent)]
    Slot(#[from] SlotError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}
