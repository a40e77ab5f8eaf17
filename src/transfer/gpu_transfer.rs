//! Block transfers between host and device memory.
//!
//! Host blocks are stored densely (`row_len` floats per channel); device blocks
//! widen every row by the padding. Uploads therefore go through a rect copy
//! with different source and destination pitches, and device-to-device copies
//! move the same rows while leaving the padding of the destination alone.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::cache::block::{BlockGeometry, BlockIndex};
use crate::gpu::device::{DeviceBuffer, DeviceError, Event};
use crate::gpu::queue::{CommandQueue, HostBuffer, RectRegion};

/// Transfer counters.
#[derive(Debug, Default)]
pub struct TransferStats {
    h2d_bytes: AtomicU64,
    h2d_transfers: AtomicU64,
    d2d_bytes: AtomicU64,
    d2d_transfers: AtomicU64,
}

/// Point-in-time copy of [`TransferStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferSnapshot {
    pub h2d_bytes: u64,
    pub h2d_transfers: u64,
    pub d2d_bytes: u64,
    pub d2d_transfers: u64,
}

impl TransferStats {
    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            h2d_bytes: self.h2d_bytes.load(Ordering::Relaxed),
            h2d_transfers: self.h2d_transfers.load(Ordering::Relaxed),
            d2d_bytes: self.d2d_bytes.load(Ordering::Relaxed),
            d2d_transfers: self.d2d_transfers.load(Ordering::Relaxed),
        }
    }
}

/// Builds and enqueues the rect transfers for one block geometry.
#[derive(Debug)]
pub struct BlockTransfer {
    upload: RectRegion,
    copy: RectRegion,
    stats: TransferStats,
}

impl BlockTransfer {
    pub fn new(geometry: &BlockGeometry) -> Self {
        let row_len = geometry.row_len();
        let pitch = geometry.device_row_pitch();
        Self {
            upload: RectRegion {
                row_len,
                rows: geometry.channel_count,
                src_pitch: row_len,
                dst_pitch: pitch,
            },
            copy: RectRegion {
                row_len,
                rows: geometry.channel_count,
                src_pitch: pitch,
                dst_pitch: pitch,
            },
            stats: TransferStats::default(),
        }
    }

    fn bytes(region: &RectRegion) -> u64 {
        (region.elements() * std::mem::size_of::<f32>()) as u64
    }

    /// Host block → device buffer, widening rows to the padded pitch.
    pub fn upload(
        &self,
        queue: &CommandQueue,
        index: BlockIndex,
        src: &HostBuffer,
        dst: &DeviceBuffer,
    ) -> Result<Event, DeviceError> {
        let event = queue.enqueue_write_rect(src, dst, self.upload)?;
        let bytes = Self::bytes(&self.upload);
        self.stats.h2d_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.stats.h2d_transfers.fetch_add(1, Ordering::Relaxed);
        debug!(block = index, bytes, buffer = dst.id(), "H2D transfer");
        Ok(event)
    }

    /// Device block → device block with identical padded layout.
    pub fn copy(
        &self,
        queue: &CommandQueue,
        index: BlockIndex,
        src: &DeviceBuffer,
        dst: &DeviceBuffer,
    ) -> Result<Event, DeviceError> {
        let event = queue.enqueue_copy_rect(src, dst, self.copy)?;
        let bytes = Self::bytes(&self.copy);
        self.stats.d2d_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.stats.d2d_transfers.fetch_add(1, Ordering::Relaxed);
        debug!(block = index, bytes, from = src.id(), to = dst.id(), "D2D transfer");
        Ok(event)
    }

    pub fn stats(&self) -> TransferSnapshot {
        self.stats.snapshot()
    }
}
