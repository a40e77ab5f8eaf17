//! Block indexing and tier definitions.
//!
//! A block is a fixed window of samples across all channels. Blocks are the
//! unit of movement between tiers: they are read from the source, uploaded to
//! the device and copied into the processing working set as whole units.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, SignalConfig};

/// Logical block number. Negative and past-the-end indices are legal; the
/// samples they cover outside the recording read as silence.
pub type BlockIndex = i64;

/// Position of a physical buffer within a tier's pool.
pub type SlotId = usize;

/// Samples of padding appended to every device row. The filter kernels read
/// past the end of a row, so transfers must keep this stride intact.
pub const DEVICE_PADDING: usize = 4;

/// Identifies one cache level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    /// Tier 1: host RAM, filled from the sample source.
    Host,
    /// Tier 2: device memory, filled from the host tier.
    Device,
    /// Tier 3: per-frame device working set paired with render buffers.
    Processing,
}

impl Tier {
    /// Position in the global lock order (lower locks first).
    pub fn level(&self) -> u8 {
        match self {
            Tier::Host => 0,
            Tier::Device => 1,
            Tier::Processing => 2,
        }
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Tier::Host => "host",
            Tier::Device => "device",
            Tier::Processing => "processing",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Host => write!(f, "HOST"),
            Tier::Device => write!(f, "DEVICE"),
            Tier::Processing => write!(f, "PROCESSING"),
        }
    }
}

/// Shape of a block and its mapping onto absolute sample positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGeometry {
    /// Samples per block that are rendered.
    pub block_size: usize,

    /// Leading overlap read before every block (filter warm-up).
    pub offset: usize,

    /// Shift applied to every read to compensate the filter's group delay.
    pub delay: i64,

    /// Per-row padding on the device.
    pub padding: usize,

    /// Number of channels in the recording.
    pub channel_count: usize,
}

impl BlockGeometry {
    /// Derive the geometry from the signal configuration and the source's shape.
    ///
    /// The filter length defaults to the sampling frequency and the delay to
    /// `filter_length / 2 - 1`. Filter length and block length must both be
    /// multiples of 4 for the vectorized kernels.
    pub fn from_config(
        config: &SignalConfig,
        channel_count: usize,
        sampling_frequency: f64,
    ) -> Result<Self, ConfigError> {
        if channel_count == 0 {
            return Err(ConfigError::NoChannels);
        }

        let filter_length = config
            .filter_length
            .unwrap_or_else(|| sampling_frequency.round().max(0.0) as usize);

        if filter_length % 4 != 0 || config.block_length % 4 != 0 {
            return Err(ConfigError::NotMultipleOfFour {
                filter_length,
                block_length: config.block_length,
            });
        }

        if config.block_length <= filter_length {
            return Err(ConfigError::BlockShorterThanFilter {
                filter_length,
                block_length: config.block_length,
            });
        }

        let delay = config
            .delay
            .unwrap_or(filter_length as i64 / 2 - 1);

        Ok(Self {
            block_size: config.block_length - filter_length,
            offset: filter_length,
            delay,
            padding: DEVICE_PADDING,
            channel_count,
        })
    }

    /// Samples per channel stored in the host tier.
    pub fn row_len(&self) -> usize {
        self.block_size + self.offset
    }

    /// Samples per channel row on the device, padding included.
    pub fn device_row_pitch(&self) -> usize {
        self.row_len() + self.padding
    }

    /// Floats in one host block.
    pub fn host_block_len(&self) -> usize {
        self.row_len() * self.channel_count
    }

    /// Floats in one device block.
    pub fn device_block_len(&self) -> usize {
        self.device_row_pitch() * self.channel_count
    }

    pub fn host_block_bytes(&self) -> usize {
        self.host_block_len() * std::mem::size_of::<f32>()
    }

    pub fn device_block_bytes(&self) -> usize {
        self.device_block_len() * std::mem::size_of::<f32>()
    }

    /// Absolute sample range read from the source for a block:
    /// `[k*block_size - offset + delay, k*block_size + block_size + delay)`.
    pub fn read_range(&self, index: BlockIndex) -> Range<i64> {
        let bounds = self.boundaries(index);
        (bounds.start - self.offset as i64 + self.delay)..(bounds.end + self.delay)
    }

    /// Samples a block renders: `[k*block_size, (k+1)*block_size)`.
    pub fn boundaries(&self, index: BlockIndex) -> Range<i64> {
        let start = index * self.block_size as i64;
        start..start + self.block_size as i64
    }

    /// Block whose boundaries contain `sample`.
    pub fn block_for_sample(&self, sample: i64) -> BlockIndex {
        sample.div_euclid(self.block_size as i64)
    }

    /// Blocks whose boundaries intersect `[from, to)`.
    pub fn blocks_in_range(&self, from: i64, to: i64) -> Range<BlockIndex> {
        if to <= from {
            return 0..0;
        }
        self.block_for_sample(from)..self.block_for_sample(to - 1) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> BlockGeometry {
        BlockGeometry {
            block_size: 256,
            offset: 64,
            delay: 31,
            padding: DEVICE_PADDING,
            channel_count: 4,
        }
    }

    #[test]
    fn test_tier_ordering() {
        assert!(Tier::Host.level() < Tier::Device.level());
        assert!(Tier::Device.level() < Tier::Processing.level());
    }

    #[test]
    fn test_read_range() {
        let g = geometry();
        assert_eq!(g.read_range(0), -33..287);
        assert_eq!(g.read_range(3), (768 - 64 + 31)..(1024 + 31));
        assert_eq!(g.read_range(-1), (-256 - 64 + 31)..31);
        assert_eq!(g.read_range(2).end - g.read_range(2).start, g.row_len() as i64);
    }

    #[test]
    fn test_sizes() {
        let g = geometry();
        assert_eq!(g.row_len(), 320);
        assert_eq!(g.device_row_pitch(), 324);
        assert_eq!(g.host_block_bytes(), 320 * 4 * 4);
        assert_eq!(g.device_block_bytes(), 324 * 4 * 4);
    }

    #[test]
    fn test_blocks_in_range() {
        let g = geometry();
        assert_eq!(g.blocks_in_range(0, 256), 0..1);
        assert_eq!(g.blocks_in_range(100, 700), 0..3);
        assert_eq!(g.blocks_in_range(-10, 10), -1..1);
        assert_eq!(g.blocks_in_range(5, 5), 0..0);
    }

    #[test]
    fn test_from_config_defaults() {
        let config = SignalConfig {
            block_length: 1024,
            filter_length: None,
            delay: None,
        };
        let g = BlockGeometry::from_config(&config, 2, 256.0).unwrap();
        assert_eq!(g.offset, 256);
        assert_eq!(g.block_size, 768);
        assert_eq!(g.delay, 127);
        assert_eq!(g.padding, 4);
    }

    #[test]
    fn test_from_config_rejects_unaligned() {
        let config = SignalConfig {
            block_length: 1024,
            filter_length: None,
            delay: None,
        };
        let err = BlockGeometry::from_config(&config, 2, 250.0).unwrap_err();
        assert!(matches!(err, ConfigError::NotMultipleOfFour { .. }));

        let config = SignalConfig {
            block_length: 1022,
            filter_length: Some(64),
            delay: None,
        };
        assert!(BlockGeometry::from_config(&config, 2, 250.0).is_err());
    }

    #[test]
    fn test_from_config_rejects_short_block() {
        let config = SignalConfig {
            block_length: 64,
            filter_length: Some(64),
            delay: None,
        };
        let err = BlockGeometry::from_config(&config, 1, 64.0).unwrap_err();
        assert!(matches!(err, ConfigError::BlockShorterThanFilter { .. }));
    }
}
