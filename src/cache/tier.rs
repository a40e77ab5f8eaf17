//! Synchronization shell around a tier's slot bookkeeping.
//!
//! Every tier pairs a `SlotAllocator` with one mutex and two condition
//! variables: `work` wakes the tier's filler (new request, or a slot became
//! evictable) and `ready` wakes consumers waiting for a block to land.
//!
//! Completion may come from a worker thread or a device callback; both go
//! through [`settle`], which takes the tier locks in the global order
//! host → device → processing, releases the references and notifies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error};

use crate::cache::block::{BlockIndex, Tier};
use crate::cache::slots::{SlotAllocator, SlotError};

/// One cache level's bookkeeping and wake-up channels.
#[derive(Debug)]
pub struct TierState {
    tier: Tier,
    logic: Mutex<SlotAllocator>,
    work: Condvar,
    ready: Condvar,
}

impl TierState {
    pub fn new(tier: Tier, capacity: usize) -> Self {
        Self {
            tier,
            logic: Mutex::new(SlotAllocator::new(capacity)),
            work: Condvar::new(),
            ready: Condvar::new(),
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn lock(&self) -> MutexGuard<'_, SlotAllocator> {
        self.logic.lock()
    }

    /// Queue a fill and wake the filler. Returns whether a request was queued.
    pub fn request_fill(&self, index: BlockIndex) -> bool {
        let mut logic = self.logic.lock();
        let queued = logic.request_fill(index);
        if queued {
            debug!(tier = %self.tier, block = index, "Fill requested");
            self.work.notify_one();
        }
        queued
    }

    /// Wake the filler; the caller holds the lock.
    pub fn notify_work(&self) {
        self.work.notify_one();
    }

    /// Block the filler until new work or a release arrives.
    pub fn wait_work(&self, guard: &mut MutexGuard<'_, SlotAllocator>) {
        self.work.wait(guard);
    }

    /// Block a consumer until some block of this tier settles.
    pub fn wait_ready(&self, guard: &mut MutexGuard<'_, SlotAllocator>) {
        self.ready.wait(guard);
    }

    /// Drop queued fills and wake everyone waiting on this tier.
    pub fn shut_down(&self) {
        let mut logic = self.logic.lock();
        let dropped = logic.cancel_pending();
        if dropped > 0 {
            debug!(tier = %self.tier, dropped, "Pending fills dropped");
        }
        self.work.notify_all();
        self.ready.notify_all();
    }

    /// Release a single reference and wake waiters.
    pub fn release(&self, index: BlockIndex) -> Result<(), SlotError> {
        settle(&[(self, index)]).map(drop)
    }
}

/// Locks held while settling a completion. Dropping it notifies every
/// settled tier and then unlocks them.
pub struct Settlement<'a> {
    guards: Vec<(&'a TierState, MutexGuard<'a, SlotAllocator>)>,
}

impl<'a> Settlement<'a> {
    /// Bookkeeping of a settled tier, still locked.
    pub fn logic_mut(&mut self, tier: Tier) -> Option<&mut SlotAllocator> {
        self.guards
            .iter_mut()
            .find(|(state, _)| state.tier == tier)
            .map(|(_, guard)| &mut **guard)
    }
}

impl Drop for Settlement<'_> {
    fn drop(&mut self) {
        for (state, _) in &self.guards {
            state.ready.notify_all();
            state.work.notify_all();
        }
    }
}

/// Release one reference per `(tier, block)` pair.
///
/// Locks are taken in ascending tier level regardless of argument order, so
/// worker threads and device callbacks can never deadlock against each other.
/// Every release is attempted even if an earlier one fails; the first error is
/// returned.
pub fn settle<'a>(releases: &[(&'a TierState, BlockIndex)]) -> Result<Settlement<'a>, SlotError> {
    let mut ordered: Vec<_> = releases.to_vec();
    ordered.sort_by_key(|(state, _)| state.tier.level());

    let mut settlement = Settlement {
        guards: Vec::with_capacity(ordered.len()),
    };
    for &(state, _) in &ordered {
        settlement.guards.push((state, state.logic.lock()));
    }

    let mut first_error = None;
    for ((state, guard), (_, index)) in settlement.guards.iter_mut().zip(&ordered) {
        if let Err(e) = guard.release(*index) {
            error!(tier = %state.tier, block = index, error = %e, "Release failed");
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(settlement),
    }
}

/// Invoked with the error that stopped the pipeline.
pub type FatalHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// The default fatal handler: the cache cannot skip or substitute data, so abort.
pub fn abort_on_fatal() -> FatalHandler {
    Arc::new(|_| std::process::abort())
}

/// Shared run state of all tiers: the stop flag and the path to halt them.
pub struct Lifecycle {
    stopped: AtomicBool,
    tiers: Vec<Arc<TierState>>,
    on_fatal: FatalHandler,
}

impl Lifecycle {
    pub fn new(tiers: Vec<Arc<TierState>>, on_fatal: FatalHandler) -> Self {
        Self {
            stopped: AtomicBool::new(false),
            tiers,
            on_fatal,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Set the stop flag, drop queued fills and wake every thread blocked on any tier.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        for tier in &self.tiers {
            tier.shut_down();
        }
    }

    /// Log an unrecoverable error, halt the pipeline and run the fatal handler.
    pub fn fatal(&self, context: &str, err: &dyn std::fmt::Display) {
        let message = format!("{context}: {err}");
        error!(error = %message, "Fatal pipeline error");
        self.stop();
        (self.on_fatal)(&message);
    }
}
