//! Slot allocation shared by every tier.
//!
//! A `SlotAllocator` owns the bookkeeping for a fixed pool of equally sized
//! buffers: which block each slot holds, whether the data has landed, who is
//! still using it, and which blocks are waiting to be filled. It never touches
//! the buffers themselves and never blocks; the owning tier wraps it in a mutex
//! and waits on condition variables when `fill` reports nothing to do.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use crate::cache::block::{BlockIndex, SlotId};
use crate::cache::evictor::{Evictor, SlotView};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlotError {
    #[error("Block {0} is not bound to any slot")]
    NotResident(BlockIndex),

    #[error("Block {0} released without an outstanding reference")]
    NotHeld(BlockIndex),

    #[error("Slot map corrupted: {0}")]
    Corrupted(String),
}

/// Binding metadata of one physical buffer.
#[derive(Debug, Clone, Default)]
struct Slot {
    block: Option<BlockIndex>,
    ready: bool,
    ref_count: u32,
    last_used: u64,
}

/// Result of asking the allocator for the next unit of fill work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// `index` is now bound to `slot` and must be populated by the caller,
    /// who owns the single reference until it calls `release`.
    Fill {
        slot: SlotId,
        index: BlockIndex,
        evicted: Option<BlockIndex>,
    },
    /// Nothing is pending.
    Idle,
    /// Requests are pending but every slot is referenced.
    Saturated,
}

/// Counters for monitoring.
///
/// `hits` and `misses` count lookups: every `read` or `read_any` call adds
/// exactly one to either, whatever the number of candidates.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SlotStats {
    pub hits: u64,
    pub misses: u64,
    pub fills: u64,
    pub evictions: u64,
    pub requests: u64,
    pub deduplicated: u64,
}

/// Fixed-capacity block-to-slot mapping with LRU eviction and a FIFO fill queue.
#[derive(Debug)]
pub struct SlotAllocator {
    slots: Vec<Slot>,

    /// Bound blocks (ready or in flight) to their slot.
    index_map: HashMap<BlockIndex, SlotId>,

    /// Blocks awaiting a fill, in arrival order.
    pending: VecDeque<BlockIndex>,
    pending_set: HashSet<BlockIndex>,

    /// Recency clock; starts at 1 so never-used slots sort first.
    clock: u64,

    evictor: Evictor,
    stats: SlotStats,
}

impl SlotAllocator {
    /// Create an allocator for `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![Slot::default(); capacity],
            index_map: HashMap::with_capacity(capacity),
            pending: VecDeque::new(),
            pending_set: HashSet::new(),
            clock: 0,
            evictor: Evictor::new(),
            stats: SlotStats::default(),
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Enqueue `index` for filling unless it is already bound or pending.
    ///
    /// Returns whether a new request was queued.
    pub fn request_fill(&mut self, index: BlockIndex) -> bool {
        self.stats.requests += 1;
        if self.index_map.contains_key(&index) || self.pending_set.contains(&index) {
            self.stats.deduplicated += 1;
            return false;
        }
        self.pending.push_back(index);
        self.pending_set.insert(index);
        true
    }

    /// Bind the oldest pending request to the least recently used free slot.
    pub fn fill(&mut self) -> FillOutcome {
        let Some(&index) = self.pending.front() else {
            return FillOutcome::Idle;
        };

        let views = self.slots.iter().enumerate().map(|(slot, s)| SlotView {
            slot,
            ref_count: s.ref_count,
            last_used: s.last_used,
        });
        let Some(slot) = self.evictor.select_victim(views) else {
            return FillOutcome::Saturated;
        };

        self.pending.pop_front();
        self.pending_set.remove(&index);

        let stamp = self.tick();
        let entry = &mut self.slots[slot];
        let evicted = entry.block.take();
        entry.block = Some(index);
        entry.ready = false;
        entry.ref_count = 1;
        entry.last_used = stamp;

        if let Some(old) = evicted {
            self.index_map.remove(&old);
            self.stats.evictions += 1;
        }
        self.index_map.insert(index, slot);
        self.stats.fills += 1;

        FillOutcome::Fill {
            slot,
            index,
            evicted,
        }
    }

    /// Take a reference on `index` if it is bound and ready.
    pub fn read(&mut self, index: BlockIndex) -> Option<SlotId> {
        match self.ready_slot(index) {
            Some(slot) => {
                let stamp = self.tick();
                let entry = &mut self.slots[slot];
                entry.ref_count += 1;
                entry.last_used = stamp;
                self.stats.hits += 1;
                Some(slot)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Take a reference on the first ready block among `candidates`.
    ///
    /// Counts as a single lookup in the stats.
    pub fn read_any(&mut self, candidates: &[BlockIndex]) -> Option<(SlotId, BlockIndex)> {
        let hit = candidates
            .iter()
            .find_map(|&index| self.ready_slot(index).map(|_| index));

        match hit {
            Some(index) => self.read(index).map(|slot| (slot, index)),
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Drop one reference on `index`.
    ///
    /// The first release of a freshly filled block is the filler's and marks it ready.
    pub fn release(&mut self, index: BlockIndex) -> Result<(), SlotError> {
        let slot = *self
            .index_map
            .get(&index)
            .ok_or(SlotError::NotResident(index))?;
        let entry = &mut self.slots[slot];
        if entry.ref_count == 0 {
            return Err(SlotError::NotHeld(index));
        }
        entry.ref_count -= 1;
        entry.ready = true;
        Ok(())
    }

    /// Drop all pending requests. Returns how many were dropped.
    pub fn cancel_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.pending_set.clear();
        dropped
    }

    /// Keep only the pending requests matching `keep`.
    pub fn retain_pending(&mut self, mut keep: impl FnMut(BlockIndex) -> bool) -> usize {
        let before = self.pending.len();
        self.pending.retain(|&index| keep(index));
        self.pending_set = self.pending.iter().copied().collect();
        before - self.pending.len()
    }

    fn ready_slot(&self, index: BlockIndex) -> Option<SlotId> {
        self.index_map
            .get(&index)
            .copied()
            .filter(|&slot| self.slots[slot].ready)
    }

    pub fn is_ready(&self, index: BlockIndex) -> bool {
        self.ready_slot(index).is_some()
    }

    /// Bound, ready or not.
    pub fn is_bound(&self, index: BlockIndex) -> bool {
        self.index_map.contains_key(&index)
    }

    pub fn is_pending(&self, index: BlockIndex) -> bool {
        self.pending_set.contains(&index)
    }

    pub fn slot_of(&self, index: BlockIndex) -> Option<SlotId> {
        self.index_map.get(&index).copied()
    }

    pub fn ref_count(&self, index: BlockIndex) -> Option<u32> {
        self.slot_of(index).map(|slot| self.slots[slot].ref_count)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn bound_count(&self) -> usize {
        self.index_map.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Bound blocks, in slot order.
    pub fn bound_blocks(&self) -> Vec<BlockIndex> {
        self.slots.iter().filter_map(|s| s.block).collect()
    }

    /// Total outstanding references across all slots.
    pub fn outstanding_refs(&self) -> u64 {
        self.slots.iter().map(|s| s.ref_count as u64).sum()
    }

    pub fn stats(&self) -> SlotStats {
        self.stats
    }

    /// Verify the block/slot bijection and queue deduplication.
    pub fn check_invariants(&self) -> Result<(), SlotError> {
        if self.index_map.len() > self.slots.len() {
            return Err(SlotError::Corrupted(format!(
                "{} blocks bound to {} slots",
                self.index_map.len(),
                self.slots.len()
            )));
        }
        for (&index, &slot) in &self.index_map {
            if self.slots.get(slot).and_then(|s| s.block) != Some(index) {
                return Err(SlotError::Corrupted(format!(
                    "block {index} maps to slot {slot} which does not hold it"
                )));
            }
        }
        for (slot, s) in self.slots.iter().enumerate() {
            match s.block {
                Some(index) if self.index_map.get(&index) != Some(&slot) => {
                    return Err(SlotError::Corrupted(format!(
                        "slot {slot} holds block {index} missing from the map"
                    )));
                }
                None if s.ref_count != 0 => {
                    return Err(SlotError::Corrupted(format!(
                        "free slot {slot} has {} references",
                        s.ref_count
                    )));
                }
                _ => {}
            }
        }
        if self.pending_set.len() != self.pending.len() {
            return Err(SlotError::Corrupted("duplicate pending request".into()));
        }
        if let Some(index) = self.pending.iter().find(|i| self.index_map.contains_key(i)) {
            return Err(SlotError::Corrupted(format!(
                "block {index} is both pending and bound"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(alloc: &mut SlotAllocator, index: BlockIndex) -> SlotId {
        alloc.request_fill(index);
        match alloc.fill() {
            FillOutcome::Fill { slot, index: i, .. } => {
                assert_eq!(i, index);
                alloc.release(index).unwrap();
                slot
            }
            other => panic!("expected a fill, got {other:?}"),
        }
    }

    #[test]
    fn test_fill_then_read() {
        let mut alloc = SlotAllocator::new(2);
        assert!(alloc.request_fill(7));
        let FillOutcome::Fill { slot, index, evicted } = alloc.fill() else {
            panic!("expected fill");
        };
        assert_eq!((index, evicted), (7, None));
        assert_eq!(alloc.ref_count(7), Some(1));

        // In flight: not readable yet.
        assert_eq!(alloc.read(7), None);

        alloc.release(7).unwrap();
        assert_eq!(alloc.read(7), Some(slot));
        assert_eq!(alloc.ref_count(7), Some(1));
        alloc.check_invariants().unwrap();
    }

    #[test]
    fn test_fill_idle_when_nothing_pending() {
        let mut alloc = SlotAllocator::new(1);
        assert_eq!(alloc.fill(), FillOutcome::Idle);
    }

    #[test]
    fn test_request_deduplicated() {
        let mut alloc = SlotAllocator::new(2);
        assert!(alloc.request_fill(3));
        assert!(!alloc.request_fill(3));
        assert_eq!(alloc.pending_len(), 1);

        assert!(matches!(alloc.fill(), FillOutcome::Fill { index: 3, .. }));
        // In flight counts as bound.
        assert!(!alloc.request_fill(3));
        assert_eq!(alloc.fill(), FillOutcome::Idle);
        assert_eq!(alloc.stats().fills, 1);
        assert_eq!(alloc.stats().deduplicated, 2);
    }

    #[test]
    fn test_read_miss_does_not_mutate() {
        let mut alloc = SlotAllocator::new(2);
        assert_eq!(alloc.read(1), None);
        assert_eq!(alloc.bound_count(), 0);
        assert_eq!(alloc.pending_len(), 0);
    }

    #[test]
    fn test_read_any_matches_read() {
        let mut alloc = SlotAllocator::new(4);
        filled(&mut alloc, 6);
        let (slot, index) = alloc.read_any(&[5, 6, 7]).unwrap();
        assert_eq!(index, 6);
        assert_eq!(alloc.read(6), Some(slot));
        assert_eq!(alloc.ref_count(6), Some(2));
        assert_eq!(alloc.read_any(&[1, 2]), None);
    }

    #[test]
    fn test_double_release_rejected() {
        let mut alloc = SlotAllocator::new(1);
        filled(&mut alloc, 0);
        assert_eq!(alloc.release(0), Err(SlotError::NotHeld(0)));
        assert_eq!(alloc.release(9), Err(SlotError::NotResident(9)));
    }

    #[test]
    fn test_lru_eviction() {
        let mut alloc = SlotAllocator::new(2);
        let a = filled(&mut alloc, 0);
        let b = filled(&mut alloc, 1);

        // Touch block 0 so block 1 becomes the oldest.
        alloc.read(0).unwrap();
        alloc.release(0).unwrap();

        alloc.request_fill(2);
        let FillOutcome::Fill { slot, evicted, .. } = alloc.fill() else {
            panic!("expected fill");
        };
        assert_eq!(slot, b);
        assert_eq!(evicted, Some(1));
        assert_ne!(slot, a);
        assert!(!alloc.is_bound(1));
        alloc.check_invariants().unwrap();
    }

    #[test]
    fn test_referenced_slot_not_evicted() {
        let mut alloc = SlotAllocator::new(1);
        filled(&mut alloc, 0);
        alloc.read(0).unwrap();

        alloc.request_fill(1);
        assert_eq!(alloc.fill(), FillOutcome::Saturated);
        assert!(alloc.is_pending(1));

        alloc.release(0).unwrap();
        assert!(matches!(
            alloc.fill(),
            FillOutcome::Fill { index: 1, evicted: Some(0), .. }
        ));
    }

    #[test]
    fn test_fifo_order() {
        let mut alloc = SlotAllocator::new(4);
        for index in [9, 4, 6] {
            alloc.request_fill(index);
        }
        let order: Vec<_> = (0..3)
            .map(|_| match alloc.fill() {
                FillOutcome::Fill { index, .. } => index,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(order, vec![9, 4, 6]);
    }

    #[test]
    fn test_lookups_count_once_per_call() {
        let mut alloc = SlotAllocator::new(2);
        assert_eq!(alloc.read(0), None);
        assert_eq!(alloc.read_any(&[0, 1, 2]), None);
        assert_eq!(alloc.stats().misses, 2);

        alloc.request_fill(1);
        alloc.request_fill(2);
        for _ in 0..2 {
            if let FillOutcome::Fill { index, .. } = alloc.fill() {
                alloc.release(index).unwrap();
            }
        }
        assert!(alloc.read_any(&[0, 1, 2]).is_some());
        assert!(alloc.read(2).is_some());
        let stats = alloc.stats();
        assert_eq!((stats.hits, stats.misses), (2, 2));
    }

    #[test]
    fn test_retain_pending() {
        let mut alloc = SlotAllocator::new(1);
        for index in 0..5 {
            alloc.request_fill(index);
        }
        assert_eq!(alloc.retain_pending(|i| i % 2 == 0), 2);
        assert!(alloc.is_pending(4));
        assert!(!alloc.is_pending(3));
        assert!(alloc.request_fill(3));
        assert_eq!(alloc.cancel_pending(), 4);
        alloc.check_invariants().unwrap();
    }
}
