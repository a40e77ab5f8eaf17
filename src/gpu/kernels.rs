//! Transforms applied on the device while a block is uploaded.
//!
//! The device cache runs a configured [`SignalTransform`] from its scratch
//! buffer into the destination slot. Compiling user montage expressions lives
//! outside this crate; anything implementing the trait can be plugged in.

use crate::cache::block::BlockGeometry;
use crate::gpu::device::{DeviceBuffer, DeviceError, Event};
use crate::gpu::queue::CommandQueue;

/// A compiled device transform.
pub trait SignalTransform: Send + Sync {
    /// Enqueue the transform of `src` into `dst` on `queue`.
    fn process(
        &self,
        src: &DeviceBuffer,
        dst: &DeviceBuffer,
        queue: &CommandQueue,
    ) -> Result<Event, DeviceError>;
}

/// Causal FIR filter applied to every channel row.
///
/// The leading `offset` samples of each row are history for the first output
/// samples. Output keeps the input layout; samples whose window would reach
/// before the start of the row are written as zero.
#[derive(Debug, Clone)]
pub struct FirFilter {
    taps: Vec<f32>,
    row_len: usize,
    pitch: usize,
    rows: usize,
}

impl FirFilter {
    pub fn new(taps: Vec<f32>, geometry: &BlockGeometry) -> Self {
        Self {
            taps,
            row_len: geometry.row_len(),
            pitch: geometry.device_row_pitch(),
            rows: geometry.channel_count,
        }
    }

    /// Moving-average filter with `len` equal taps.
    pub fn moving_average(len: usize, geometry: &BlockGeometry) -> Self {
        let len = len.max(1);
        Self::new(vec![1.0 / len as f32; len], geometry)
    }

    pub fn taps(&self) -> &[f32] {
        &self.taps
    }

    fn apply(&self, input: &[f32], output: &mut [f32]) -> Result<(), DeviceError> {
        let needed = self.rows.saturating_sub(1) * self.pitch + self.row_len;
        for len in [input.len(), output.len()] {
            if len < needed {
                return Err(DeviceError::OutOfBounds {
                    op: "fir_filter",
                    needed,
                    len,
                });
            }
        }

        let history = self.taps.len().saturating_sub(1);
        for row in 0..self.rows {
            let base = row * self.pitch;
            let src = &input[base..base + self.row_len];
            let dst = &mut output[base..base + self.row_len];
            for (i, out) in dst.iter_mut().enumerate() {
                *out = if i < history {
                    0.0
                } else {
                    self.taps
                        .iter()
                        .enumerate()
                        .map(|(k, tap)| tap * src[i - k])
                        .sum()
                };
            }
        }
        Ok(())
    }
}

impl SignalTransform for FirFilter {
    fn process(
        &self,
        src: &DeviceBuffer,
        dst: &DeviceBuffer,
        queue: &CommandQueue,
    ) -> Result<Event, DeviceError> {
        if src.same_buffer(dst) {
            return Err(DeviceError::Aliased("fir_filter"));
        }
        let filter = self.clone();
        let (src, dst) = (src.clone(), dst.clone());
        queue.enqueue_kernel("fir_filter", move || {
            let input = src.lock();
            let mut output = dst.lock();
            filter.apply(&input, &mut output)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::{Device, DeviceInfo};

    fn geometry() -> BlockGeometry {
        BlockGeometry {
            block_size: 4,
            offset: 4,
            delay: 0,
            padding: 4,
            channel_count: 2,
        }
    }

    #[test]
    fn test_moving_average() {
        let g = geometry();
        let device = Device::new(DeviceInfo {
            name: "test".into(),
            global_memory: 1 << 16,
            max_allocation: 1 << 16,
        })
        .unwrap();
        let queue = CommandQueue::new(&device, "test").unwrap();

        let src = device.create_buffer(g.device_block_len()).unwrap();
        let dst = device.create_buffer(g.device_block_len()).unwrap();
        {
            let mut data = src.lock();
            for (i, v) in data.iter_mut().enumerate() {
                *v = (i % g.device_row_pitch()) as f32;
            }
        }

        let filter = FirFilter::moving_average(2, &g);
        filter.process(&src, &dst, &queue).unwrap().wait().unwrap();

        let out = dst.read_to_vec();
        // Row 0: inputs 0..8, averaged pairwise.
        assert_eq!(&out[..8], &[0.0, 0.5, 1.5, 2.5, 3.5, 4.5, 5.5, 6.5]);
        // Padding is not written.
        assert_eq!(&out[8..12], &[0.0; 4]);
        assert_eq!(&out[12..20], &out[..8]);
    }
}
