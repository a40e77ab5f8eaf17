//! Data movement into and between tiers.
//!
//! - [`disk_io`]: sample sources that fill the host tier
//! - [`gpu_transfer`]: padded rect transfers host → device and device → device

pub mod disk_io;
pub mod gpu_transfer;
