//! Tier 1: host RAM block cache.
//!
//! A fixed pool of host buffers, each holding one block of
//! `(block_size + offset) * channel_count` samples in channel-major order.
//! One worker thread binds pending requests to slots and reads them from the
//! sample source. Reads happen without the tier lock held.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::block::{BlockGeometry, BlockIndex, SlotId, Tier};
use crate::cache::slots::FillOutcome;
use crate::cache::tier::{settle, Lifecycle, TierState};
use crate::gpu::allocator::HostPool;
use crate::gpu::queue::HostBuffer;
use crate::transfer::disk_io::SampleSource;

pub struct HostBlockCache {
    state: Arc<TierState>,
    pool: HostPool,
    source: Arc<dyn SampleSource>,
    geometry: BlockGeometry,
    lifecycle: Arc<Lifecycle>,
}

impl HostBlockCache {
    pub fn new(
        state: Arc<TierState>,
        source: Arc<dyn SampleSource>,
        geometry: BlockGeometry,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        let capacity = state.lock().capacity();
        let pool = HostPool::allocate(capacity, geometry.host_block_len());
        info!(
            slots = capacity,
            block_bytes = geometry.host_block_bytes(),
            "Host cache ready"
        );
        Self {
            state,
            pool,
            source,
            geometry,
            lifecycle,
        }
    }

    pub fn state(&self) -> &Arc<TierState> {
        &self.state
    }

    pub fn buffer(&self, slot: SlotId) -> &HostBuffer {
        self.pool.get(slot)
    }

    /// Block until `index` is resident and take a read reference on it.
    ///
    /// Requests the fill itself if nobody has. Returns `None` once the pipeline stops.
    pub fn acquire(&self, index: BlockIndex) -> Option<SlotId> {
        let mut logic = self.state.lock();
        loop {
            if self.lifecycle.is_stopped() {
                return None;
            }
            if let Some(slot) = logic.read(index) {
                return Some(slot);
            }
            if logic.request_fill(index) {
                debug!(block = index, "Host miss, fill requested");
                self.state.notify_work();
            }
            self.state.wait_ready(&mut logic);
        }
    }

    /// Fill loop of the host worker thread. Returns when the pipeline stops
    /// or a read fails.
    pub fn run_worker(&self) {
        info!(tier = %Tier::Host, "Worker started");
        while let Some((slot, index)) = self.next_fill() {
            let range = self.geometry.read_range(index);
            let result = {
                let mut buffer = self.pool.get(slot).write();
                self.source.read_samples(&mut buffer, range.start, range.end)
            };
            if let Err(e) = result {
                self.lifecycle.fatal(&format!("reading block {index}"), &e);
                break;
            }

            debug!(block = index, slot, from = range.start, to = range.end, "Host block loaded");
            if let Err(e) = settle(&[(&*self.state, index)]) {
                self.lifecycle.fatal("settling host fill", &e);
                break;
            }
        }
        info!(tier = %Tier::Host, "Worker stopped");
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
                        debug!(tier = %Tier::Host, block = old, slot, "Evicted");
                    }
                    return Some((slot, index));
                }
                FillOutcome::Idle | FillOutcome::Saturated => self.state.wait_work(&mut logic),
            }
        }
    }
}
