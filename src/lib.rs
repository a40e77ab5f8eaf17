//! signal-cache-tier: tiered block cache for streaming huge recordings.
//!
//! Multi-channel recordings far larger than memory are paged through a
//! hierarchy of caches on their way to the display:
//!   Sample source (disk) → Host RAM → Device memory → Processing working set
//!
//! Each tier is filled by its own worker or by device completion callbacks;
//! consumers ask [`processor::SignalProcessor`] for any of a set of blocks and
//! get back whichever is resident first.

pub mod cache;
pub mod config;
pub mod gpu;
pub mod metrics;
pub mod processor;
pub mod transfer;
