//! Integration tests for the eviction policy as seen through a tier.

use signal_cache_tier::cache::block::Tier;
use signal_cache_tier::cache::evictor::{Evictor, SlotView};
use signal_cache_tier::cache::slots::{FillOutcome, SlotAllocator};
use signal_cache_tier::cache::tier::TierState;

fn fill_and_release(alloc: &mut SlotAllocator, index: i64) -> usize {
    alloc.request_fill(index);
    let FillOutcome::Fill { slot, .. } = alloc.fill() else {
        panic!("expected a fill for block {index}");
    };
    alloc.release(index).unwrap();
    slot
}

#[test]
fn test_never_used_slots_go_first() {
    let mut alloc = SlotAllocator::new(3);
    let slots: Vec<_> = (0..3).map(|i| fill_and_release(&mut alloc, i)).collect();
    assert_eq!(slots, vec![0, 1, 2]);
}

#[test]
fn test_eviction_follows_recency() {
    let mut alloc = SlotAllocator::new(3);
    for index in 0..3 {
        fill_and_release(&mut alloc, index);
    }

    // Touch in the order 2, 0, 1: block 2 becomes the oldest.
    for index in [2, 0, 1] {
        alloc.read(index).unwrap();
        alloc.release(index).unwrap();
    }

    alloc.request_fill(10);
    assert!(matches!(
        alloc.fill(),
        FillOutcome::Fill { evicted: Some(2), .. }
    ));
    alloc.request_fill(11);
    assert!(matches!(
        alloc.fill(),
        FillOutcome::Fill { evicted: Some(0), .. }
    ));
}

#[test]
fn test_in_flight_slot_not_evicted() {
    let state = TierState::new(Tier::Device, 1);
    let mut logic = state.lock();
    logic.request_fill(1);
    assert!(matches!(logic.fill(), FillOutcome::Fill { index: 1, .. }));

    // The filler still holds its reference.
    logic.request_fill(2);
    assert_eq!(logic.fill(), FillOutcome::Saturated);
    logic.release(1).unwrap();
    assert!(matches!(
        logic.fill(),
        FillOutcome::Fill { index: 2, evicted: Some(1), .. }
    ));
}

#[test]
fn test_evictor_empty_returns_nothing() {
    let evictor = Evictor::new();
    assert_eq!(evictor.select_victim(std::iter::empty::<SlotView>()), None);
}
