//! Tier 3: processing working set.
//!
//! A handful of device buffers, each paired with the render-side handles that
//! draw it. Misses are served by a device → device copy out of the device
//! tier; the copy's completion settles both tiers and wakes waiting consumers.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::block::{BlockGeometry, BlockIndex, SlotId, Tier};
use crate::cache::device::DeviceBlockCache;
use crate::cache::slots::{FillOutcome, SlotError};
use crate::cache::tier::{settle, Lifecycle, TierState};
use crate::cache::CacheError;
use crate::gpu::allocator::{AllocatorError, DevicePool};
use crate::gpu::device::DeviceBuffer;

/// Render-side handles bound to one processing slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderBuffers {
    pub vertex_array: u32,
    pub vertex_buffer: u32,
}

pub struct ProcessingWorkingSet {
    state: Arc<TierState>,
    device: Arc<DeviceBlockCache>,
    pool: DevicePool,
    render_buffers: Vec<RenderBuffers>,
    geometry: BlockGeometry,
    /// Consumers currently blocked on each block. Leaf lock.
    interest: Mutex<HashMap<BlockIndex, usize>>,
    lifecycle: Arc<Lifecycle>,
}

/// Registration of one `get_any_block` caller's candidates.
struct Interest<'a> {
    interest: &'a Mutex<HashMap<BlockIndex, usize>>,
    candidates: &'a [BlockIndex],
}

impl<'a> Interest<'a> {
    fn register(
        interest: &'a Mutex<HashMap<BlockIndex, usize>>,
        candidates: &'a [BlockIndex],
    ) -> Self {
        let mut map = interest.lock();
        for &index in candidates {
            *map.entry(index).or_default() += 1;
        }
        Self {
            interest,
            candidates,
        }
    }
}

impl Drop for Interest<'_> {
    fn drop(&mut self) {
        let mut map = self.interest.lock();
        for index in self.candidates {
            if let Some(count) = map.get_mut(index) {
                *count -= 1;
                if *count == 0 {
                    map.remove(index);
                }
            }
        }
    }
}

impl ProcessingWorkingSet {
    pub fn new(
        state: Arc<TierState>,
        device: Arc<DeviceBlockCache>,
        geometry: BlockGeometry,
        lifecycle: Arc<Lifecycle>,
    ) -> Result<Self, AllocatorError> {
        let capacity = state.lock().capacity();
        let pool = DevicePool::allocate(
            device.device(),
            Tier::Processing,
            capacity,
            geometry.device_block_len(),
        )?;
        let render_buffers = (0..capacity as u32)
            .map(|slot| RenderBuffers {
                vertex_array: 2 * slot + 1,
                vertex_buffer: 2 * slot + 2,
            })
            .collect();

        info!(slots = capacity, "Processing working set ready");
        Ok(Self {
            state,
            device,
            pool,
            render_buffers,
            geometry,
            interest: Mutex::new(HashMap::new()),
            lifecycle,
        })
    }

    pub fn state(&self) -> &Arc<TierState> {
        &self.state
    }

    /// Return any one of `candidates` once it sits in a processing slot.
    ///
    /// Blocks until one is ready or the pipeline halts. Pending requests no
    /// blocked caller wants any more are dropped first; the candidates are
    /// requested again on every pass, so a request pruned or evicted meanwhile
    /// is queued anew.
    pub fn get_any_block(&self, candidates: &[BlockIndex]) -> Result<RenderableBlock, CacheError> {
        if candidates.is_empty() {
            return Err(CacheError::EmptyCandidates);
        }

        let mut logic = self.state.lock();
        let _interest = Interest::register(&self.interest, candidates);
        let stale = {
            let wanted = self.interest.lock();
            logic.retain_pending(|index| wanted.contains_key(&index))
        };
        if stale > 0 {
            debug!(dropped = stale, "Dropped stale processing requests");
        }

        loop {
            if self.lifecycle.is_stopped() {
                return Err(CacheError::Halted);
            }
            if let Some((slot, index)) = logic.read_any(candidates) {
                return Ok(self.renderable(slot, index));
            }
            for &index in candidates {
                logic.request_fill(index);
            }

            let mut fills = Vec::new();
            while let FillOutcome::Fill {
                slot,
                index,
                evicted,
            } = logic.fill()
            {
                if let Some(old) = evicted {
                    debug!(tier = %Tier::Processing, block = old, slot, "Evicted");
                }
                fills.push((slot, index));
            }

            if fills.is_empty() {
                self.state.wait_ready(&mut logic);
                continue;
            }

            drop(logic);
            for (slot, index) in fills {
                if let Err(e) = self.dispatch(slot, index) {
                    self.lifecycle.fatal(&format!("requesting block {index}"), &e);
                    return Err(CacheError::Halted);
                }
            }
            logic = self.state.lock();
        }
    }

    /// Ask the device tier to copy `index` into `slot`; the copy's completion
    /// settles the device read and the processing fill.
    fn dispatch(&self, slot: SlotId, index: BlockIndex) -> Result<(), CacheError> {
        let ready = self.device.device().create_user_event();
        let device_state = self.device.state().clone();
        let state = self.state.clone();
        let lifecycle = self.lifecycle.clone();
        ready.on_complete(move |status| {
            let result = status.map_err(CacheError::from).and_then(|()| {
                settle(&[(&*device_state, index), (&*state, index)])
                    .map(drop)
                    .map_err(CacheError::from)
            });
            if let Err(e) = result {
                lifecycle.fatal(&format!("processing fill of block {index}"), &e);
            }
        });

        let served = self.device.get_any(&[index], self.pool.get(slot), ready)?;
        debug!(block = served, slot, "Processing fill dispatched");
        Ok(())
    }

    fn renderable(&self, slot: SlotId, index: BlockIndex) -> RenderableBlock {
        let bounds = self.geometry.boundaries(index);
        RenderableBlock {
            slot,
            index,
            channel_count: self.geometry.channel_count,
            first_sample: bounds.start,
            last_sample: bounds.end,
            buffer: self.pool.get(slot).clone(),
            render_buffers: self.render_buffers[slot],
            state: self.state.clone(),
            released: false,
        }
    }
}

/// A block resident in the processing working set.
///
/// Holds one reference on its slot until [`RenderableBlock::release`] is
/// called or the handle is dropped.
pub struct RenderableBlock {
    slot: SlotId,
    index: BlockIndex,
    channel_count: usize,
    first_sample: i64,
    last_sample: i64,
    buffer: DeviceBuffer,
    render_buffers: RenderBuffers,
    state: Arc<TierState>,
    released: bool,
}

impl std::fmt::Debug for RenderableBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderableBlock")
            .field("index", &self.index)
            .field("slot", &self.slot)
            .field("samples", &(self.first_sample..self.last_sample))
            .finish()
    }
}

impl RenderableBlock {
    pub fn block_index(&self) -> BlockIndex {
        self.index
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn first_sample(&self) -> i64 {
        self.first_sample
    }

    /// One past the last rendered sample.
    pub fn last_sample(&self) -> i64 {
        self.last_sample
    }

    pub fn sample_range(&self) -> Range<i64> {
        self.first_sample..self.last_sample
    }

    /// Device buffer in the padded device layout.
    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    pub fn render_buffers(&self) -> RenderBuffers {
        self.render_buffers
    }

    /// Give the slot back to the working set.
    pub fn release(mut self) -> Result<(), SlotError> {
        self.released = true;
        self.state.release(self.index)
    }
}

impl Drop for RenderableBlock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(block = self.index, "Renderable block dropped without release");
        if let Err(e) = self.state.release(self.index) {
            error!(block = self.index, error = %e, "Release on drop failed");
        }
    }
}
