//! Compute device model and device memory.
//!
//! - [`device`]: device handle, buffers, events and the callback thread
//! - [`queue`]: in-order command queue with rect transfers and kernels
//! - [`allocator`]: fixed buffer pools sized from memory budgets
//! - [`kernels`]: transforms run while uploading a block

pub mod allocator;
pub mod device;
pub mod kernels;
pub mod queue;
