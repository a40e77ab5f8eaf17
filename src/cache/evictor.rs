//! Eviction policy: decides which slot a new block is bound to.
//!
//! Least-recently-used among unreferenced slots:
//! - Slots with a non-zero reference count are never candidates
//! - Oldest `last_used` stamp goes first (never-bound slots carry stamp 0)
//! - Ties are broken by the lowest slot id

use std::cmp::Ordering;

use crate::cache::block::SlotId;

/// An eviction candidate with its recency stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub slot: SlotId,
    pub last_used: u64,
}

// Smaller (last_used, slot) = evicted first.
impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.last_used
            .cmp(&other.last_used)
            .then(self.slot.cmp(&other.slot))
    }
}

/// View of a slot as seen by the evictor.
#[derive(Debug, Clone, Copy)]
pub struct SlotView {
    pub slot: SlotId,
    pub ref_count: u32,
    pub last_used: u64,
}

/// The eviction policy engine.
#[derive(Debug, Default, Clone)]
pub struct Evictor;

impl Evictor {
    pub fn new() -> Self {
        Self
    }

    /// The single slot to rebind next, or None when every slot is referenced.
    pub fn select_victim(&self, slots: impl Iterator<Item = SlotView>) -> Option<SlotId> {
        slots
            .filter(|s| s.ref_count == 0)
            .map(|s| EvictionCandidate {
                slot: s.slot,
                last_used: s.last_used,
            })
            .min()
            .map(|c| c.slot)
    }
}
