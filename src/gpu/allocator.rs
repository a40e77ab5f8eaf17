//! Fixed-size buffer pools for the cache tiers.
//!
//! Each tier turns its memory budget into a slot count once, at construction,
//! and allocates every buffer up front. Pools never grow or shrink afterwards.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::block::{SlotId, Tier};
use crate::gpu::device::{Device, DeviceBuffer, DeviceError};
use crate::gpu::queue::HostBuffer;

#[derive(Error, Debug)]
pub enum AllocatorError {
    #[error("Not enough memory for the {tier} cache: budget {budget} bytes, one block needs {block_bytes} bytes")]
    InsufficientMemory {
        tier: Tier,
        budget: usize,
        block_bytes: usize,
    },

    #[error("A block of {block_bytes} bytes does not fit into one device allocation (max {max} bytes)")]
    BlockTooLarge { block_bytes: usize, max: usize },

    #[error("Device allocation failed: {0}")]
    Device(#[from] DeviceError),
}

/// Number of whole blocks a budget holds; at least one or an error.
pub fn slots_for_budget(tier: Tier, budget: usize, block_bytes: usize) -> Result<usize, AllocatorError> {
    let count = budget.checked_div(block_bytes).unwrap_or(0);
    if count == 0 {
        return Err(AllocatorError::InsufficientMemory {
            tier,
            budget,
            block_bytes,
        });
    }
    Ok(count)
}

/// Pool of host buffers, one per slot.
#[derive(Debug)]
pub struct HostPool {
    buffers: Vec<HostBuffer>,
    block_len: usize,
}

impl HostPool {
    pub fn allocate(count: usize, block_len: usize) -> Self {
        let buffers = (0..count)
            .map(|_| Arc::new(RwLock::new(vec![0.0f32; block_len])))
            .collect();
        info!(slots = count, block_len, "Allocated host pool");
        Self { buffers, block_len }
    }

    pub fn get(&self, slot: SlotId) -> &HostBuffer {
        &self.buffers[slot]
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn block_len(&self) -> usize {
        self.block_len
    }
}

/// Pool of device buffers, one per slot.
#[derive(Debug)]
pub struct DevicePool {
    buffers: Vec<DeviceBuffer>,
    block_len: usize,
}

impl DevicePool {
    /// Allocate `count` buffers of `block_len` floats.
    pub fn allocate(device: &Device, tier: Tier, count: usize, block_len: usize) -> Result<Self, AllocatorError> {
        let block_bytes = block_len * std::mem::size_of::<f32>();
        let max = device.info().max_allocation;
        if block_bytes > max {
            return Err(AllocatorError::BlockTooLarge { block_bytes, max });
        }

        let buffers = (0..count)
            .map(|_| device.create_buffer(block_len))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(tier = %tier, slots = count, block_bytes, "Allocated device pool");
        Ok(Self { buffers, block_len })
    }

    pub fn get(&self, slot: SlotId) -> &DeviceBuffer {
        &self.buffers[slot]
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn block_len(&self) -> usize {
        self.block_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::DeviceInfo;

    #[test]
    fn test_slots_for_budget() {
        assert_eq!(slots_for_budget(Tier::Host, 4096, 1024).unwrap(), 4);
        assert_eq!(slots_for_budget(Tier::Host, 4095, 1024).unwrap(), 3);
        assert!(matches!(
            slots_for_budget(Tier::Device, 1023, 1024),
            Err(AllocatorError::InsufficientMemory { tier: Tier::Device, .. })
        ));
        assert!(slots_for_budget(Tier::Device, 1024, 0).is_err());
    }

    #[test]
    fn test_device_pool() {
        let device = Device::new(DeviceInfo {
            name: "test".into(),
            global_memory: 64 * 1024,
            max_allocation: 16 * 1024,
        })
        .unwrap();

        let pool = DevicePool::allocate(&device, Tier::Device, 3, 1024).unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(device.allocated_bytes(), 3 * 4096);

        assert!(matches!(
            DevicePool::allocate(&device, Tier::Device, 1, 8192),
            Err(AllocatorError::BlockTooLarge { .. })
        ));
        assert!(matches!(
            DevicePool::allocate(&device, Tier::Device, 100, 1024),
            Err(AllocatorError::Device(DeviceError::OutOfMemory { .. }))
        ));

        // A failed pool gives its partial allocations back.
        assert_eq!(device.allocated_bytes(), 3 * 4096);
        drop(pool);
        assert_eq!(device.allocated_bytes(), 0);
    }

    #[test]
    fn test_host_pool() {
        let pool = HostPool::allocate(2, 16);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(1).read().len(), 16);
    }
}
