//! Tier 2: device block cache.
//!
//! Blocks are uploaded from the host tier into a scratch buffer with the row
//! pitch widened by the device padding, then either transformed or copied into
//! their slot. Completion is signalled by a device callback, which settles the
//! host and device references and serves any `get_any` waiters of the block.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cache::block::{BlockGeometry, BlockIndex, SlotId, Tier};
use crate::cache::host::HostBlockCache;
use crate::cache::slots::{FillOutcome, SlotError};
use crate::cache::tier::{settle, Lifecycle, TierState};
use crate::cache::CacheError;
use crate::gpu::allocator::{AllocatorError, DevicePool};
use crate::gpu::device::{Device, DeviceBuffer, DeviceError, Event};
use crate::gpu::kernels::SignalTransform;
use crate::gpu::queue::CommandQueue;
use crate::transfer::gpu_transfer::{BlockTransfer, TransferSnapshot};

/// A consumer copy waiting for a block to land.
struct Waiter {
    dest: DeviceBuffer,
    ready: Event,
}

pub struct DeviceBlockCache {
    state: Arc<TierState>,
    host: Arc<HostBlockCache>,
    pool: DevicePool,
    scratch: DeviceBuffer,
    queue: CommandQueue,
    transform: Option<Arc<dyn SignalTransform>>,
    transfer: BlockTransfer,
    /// Leaf lock, only taken with the device tier lock held.
    waiters: Mutex<HashMap<BlockIndex, Vec<Waiter>>>,
    lifecycle: Arc<Lifecycle>,
}

impl DeviceBlockCache {
    pub fn new(
        device: &Device,
        state: Arc<TierState>,
        host: Arc<HostBlockCache>,
        geometry: &BlockGeometry,
        transform: Option<Arc<dyn SignalTransform>>,
        lifecycle: Arc<Lifecycle>,
    ) -> Result<Self, AllocatorError> {
        let capacity = state.lock().capacity();
        let pool = DevicePool::allocate(device, Tier::Device, capacity, geometry.device_block_len())?;
        let scratch = device.create_buffer(geometry.device_block_len())?;
        let queue = CommandQueue::new(device, "device-cache")?;

        info!(
            slots = capacity,
            block_bytes = geometry.device_block_bytes(),
            transform = transform.is_some(),
            "Device cache ready"
        );

        Ok(Self {
            state,
            host,
            pool,
            scratch,
            queue,
            transform,
            transfer: BlockTransfer::new(geometry),
            waiters: Mutex::new(HashMap::new()),
            lifecycle,
        })
    }

    pub fn state(&self) -> &Arc<TierState> {
        &self.state
    }

    pub fn device(&self) -> &Device {
        self.queue.device()
    }

    pub fn transfer_stats(&self) -> TransferSnapshot {
        self.transfer.stats()
    }

    /// Copy one of `candidates` into `dest` and complete `ready` once the copy lands.
    ///
    /// A ready candidate is copied right away. Otherwise a candidate already in
    /// flight or pending is preferred over the first one, and the copy is
    /// issued when its fill completes. Either way the returned block carries a
    /// device read reference the caller releases after `ready` fires.
    pub fn get_any(
        &self,
        candidates: &[BlockIndex],
        dest: &DeviceBuffer,
        ready: Event,
    ) -> Result<BlockIndex, CacheError> {
        let first = *candidates.first().ok_or(CacheError::EmptyCandidates)?;
        let waiter = Waiter {
            dest: dest.clone(),
            ready,
        };

        let mut logic = self.state.lock();
        if let Some((slot, index)) = logic.read_any(candidates) {
            drop(logic);
            debug!(block = index, slot, "Device hit");
            self.copy_out(slot, index, waiter)?;
            return Ok(index);
        }

        let chosen = candidates
            .iter()
            .copied()
            .find(|&index| logic.is_bound(index) || logic.is_pending(index))
            .unwrap_or(first);
        self.waiters.lock().entry(chosen).or_default().push(waiter);
        if logic.request_fill(chosen) {
            self.state.notify_work();
        }
        debug!(block = chosen, "Device miss, waiter registered");
        Ok(chosen)
    }

    fn copy_out(&self, slot: SlotId, index: BlockIndex, waiter: Waiter) -> Result<(), DeviceError> {
        let copied = self
            .transfer
            .copy(&self.queue, index, self.pool.get(slot), &waiter.dest)?;
        let ready = waiter.ready;
        copied.on_complete(move |status| {
            ready.complete(status);
        });
        Ok(())
    }

    /// Fill loop of the device worker thread.
    pub fn run_worker(self: &Arc<Self>) {
        info!(tier = %Tier::Device, "Worker started");
        while let Some((slot, index)) = self.next_fill() {
            let Some(host_slot) = self.host.acquire(index) else {
                break;
            };
            if let Err(e) = self.upload(slot, index, host_slot) {
                self.lifecycle.fatal(&format!("uploading block {index}"), &e);
                break;
            }
        }
        info!(tier = %Tier::Device, "Worker stopped");
    }

    fn next_fill(&self) -> Option<(SlotId, BlockIndex)> {
        let mut logic = self.state.lock();
        loop {
            if self.lifecycle.is_stopped() {
                return None;
            }
            match logic.fill() {
                FillOutcome::Fill {
                    slot,
                    index,
                    evicted,
                } => {
                    if let Some(old) = evicted {
                        debug!(tier = %Tier::Device, block = old, slot, "Evicted");
                    }
                    return Some((slot, index));
                }
                FillOutcome::Idle | FillOutcome::Saturated => self.state.wait_work(&mut logic),
            }
        }
    }

    /// Enqueue host → scratch → slot. The host reference is held until the
    /// completion callback settles it.
    fn upload(self: &Arc<Self>, slot: SlotId, index: BlockIndex, host_slot: SlotId) -> Result<(), DeviceError> {
        let dst = self.pool.get(slot);
        self.transfer
            .upload(&self.queue, index, self.host.buffer(host_slot), &self.scratch)?;
        let done = match &self.transform {
            Some(transform) => transform.process(&self.scratch, dst, &self.queue)?,
            None => self.transfer.copy(&self.queue, index, &self.scratch, dst)?,
        };

        let cache = self.clone();
        done.on_complete(move |status| cache.finish_fill(index, status));
        Ok(())
    }

    /// Runs on the device callback thread once a block has landed in its slot.
    fn finish_fill(&self, index: BlockIndex, status: Result<(), DeviceError>) {
        if let Err(e) = status {
            self.lifecycle.fatal(&format!("device fill of block {index}"), &e);
            return;
        }

        let result = self.settle_fill(index);
        // Tier locks are released here; halting takes them again.
        if let Err(e) = result {
            self.lifecycle.fatal(&format!("settling device block {index}"), &e);
        }
    }

    fn settle_fill(&self, index: BlockIndex) -> Result<(), CacheError> {
        let mut settlement = settle(&[(&**self.host.state(), index), (&*self.state, index)])?;
        let waiters = self.waiters.lock().remove(&index).unwrap_or_default();
        debug!(block = index, waiters = waiters.len(), "Device block ready");

        let logic = settlement
            .logic_mut(Tier::Device)
            .ok_or_else(|| SlotError::Corrupted("device tier missing from settlement".into()))?;
        for waiter in waiters {
            let slot = logic.read(index).ok_or(SlotError::NotResident(index))?;
            self.copy_out(slot, index, waiter)?;
        }
        Ok(())
    }
}
