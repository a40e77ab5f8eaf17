//! Prefetching: predicts which blocks will be needed soon so the lower tiers
//! can load them before the consumer asks.
//!
//! Strategy: sliding window. The blocks covering the visible sample range are
//! needed now; a configurable number of blocks after and before it are warmed
//! in the host and device tiers, nearest first.

use std::ops::Range;

use crate::cache::block::{BlockGeometry, BlockIndex};
use crate::config::PrefetchConfig;

/// Blocks needed for one view of the recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchPlan {
    /// Blocks intersecting the visible window, in ascending order.
    pub visible: Vec<BlockIndex>,

    /// Neighbouring blocks to warm, nearest to the window first.
    pub prefetch: Vec<BlockIndex>,
}

/// The prefetcher decides which blocks should be loaded ahead of use.
#[derive(Debug, Clone)]
pub struct Prefetcher {
    config: PrefetchConfig,
}

impl Prefetcher {
    pub fn new(config: PrefetchConfig) -> Self {
        Self { config }
    }

    /// Blocks whose rendered samples intersect `[from, to)`.
    pub fn visible_blocks(&self, geometry: &BlockGeometry, from: i64, to: i64) -> Range<BlockIndex> {
        geometry.blocks_in_range(from, to)
    }

    /// Neighbours of `visible`, alternating ahead and behind by distance.
    ///
    /// Ahead wins ties since views usually scroll forward.
    pub fn prefetch_blocks(&self, visible: Range<BlockIndex>) -> Vec<BlockIndex> {
        if visible.is_empty() {
            return Vec::new();
        }
        let ahead = self.config.ahead_blocks as i64;
        let behind = self.config.behind_blocks as i64;

        let mut blocks = Vec::with_capacity((ahead + behind) as usize);
        for distance in 1..=ahead.max(behind) {
            if distance <= ahead {
                blocks.push(visible.end - 1 + distance);
            }
            if distance <= behind {
                blocks.push(visible.start - distance);
            }
        }
        blocks
    }

    /// Visible blocks and prefetch targets for the sample window `[from, to)`.
    pub fn plan(&self, geometry: &BlockGeometry, from: i64, to: i64) -> PrefetchPlan {
        let visible = self.visible_blocks(geometry, from, to);
        PrefetchPlan {
            prefetch: self.prefetch_blocks(visible.clone()),
            visible: visible.collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::block::DEVICE_PADDING;

    fn geometry() -> BlockGeometry {
        BlockGeometry {
            block_size: 100,
            offset: 20,
            delay: 9,
            padding: DEVICE_PADDING,
            channel_count: 1,
        }
    }

    #[test]
    fn test_sliding_window_prefetch() {
        let prefetcher = Prefetcher::new(PrefetchConfig {
            ahead_blocks: 3,
            behind_blocks: 1,
        });

        let plan = prefetcher.plan(&geometry(), 250, 420);
        assert_eq!(plan.visible, vec![2, 3, 4]);
        assert_eq!(plan.prefetch, vec![5, 1, 6, 7]);
    }

    #[test]
    fn test_window_before_start() {
        let prefetcher = Prefetcher::new(PrefetchConfig {
            ahead_blocks: 1,
            behind_blocks: 2,
        });

        let plan = prefetcher.plan(&geometry(), -50, 50);
        assert_eq!(plan.visible, vec![-1, 0]);
        assert_eq!(plan.prefetch, vec![1, -2, -3]);
    }

    #[test]
    fn test_empty_window() {
        let prefetcher = Prefetcher::new(PrefetchConfig::default());
        let plan = prefetcher.plan(&geometry(), 10, 10);
        assert!(plan.visible.is_empty());
        assert!(plan.prefetch.is_empty());
    }
}
