//! Prometheus metrics for the cache tiers.
//!
//! Every processor owns its own registry; nothing is registered globally, so
//! several pipelines can live in one process.

use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::block::Tier;
use crate::cache::slots::SlotStats;
use crate::transfer::gpu_transfer::TransferSnapshot;

/// Current values of one tier's gauges.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TierSnapshot {
    pub hits: i64,
    pub misses: i64,
    pub fills: i64,
    pub evictions: i64,
    pub bound: i64,
    pub capacity: i64,
}

pub struct CacheMetrics {
    registry: Registry,
    hits: IntGaugeVec,
    misses: IntGaugeVec,
    fills: IntGaugeVec,
    evictions: IntGaugeVec,
    bound: IntGaugeVec,
    capacity: IntGaugeVec,
    transfer_bytes: IntGaugeVec,
    transfers: IntGaugeVec,
}

impl CacheMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let tier_gauge = |name: &str, help: &str| -> Result<IntGaugeVec, prometheus::Error> {
            let gauge = IntGaugeVec::new(Opts::new(name, help).namespace("signal_cache"), &["tier"])?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        let hits = tier_gauge("hits", "Reads served from a ready slot")?;
        let misses = tier_gauge("misses", "Reads that found no ready slot")?;
        let fills = tier_gauge("fills", "Blocks bound to a slot for filling")?;
        let evictions = tier_gauge("evictions", "Blocks evicted to make room")?;
        let bound = tier_gauge("bound_slots", "Slots currently bound to a block")?;
        let capacity = tier_gauge("capacity_slots", "Slots in the tier")?;

        let transfer_bytes = IntGaugeVec::new(
            Opts::new("transfer_bytes", "Bytes moved by device transfers").namespace("signal_cache"),
            &["direction"],
        )?;
        let transfers = IntGaugeVec::new(
            Opts::new("transfers", "Device transfers issued").namespace("signal_cache"),
            &["direction"],
        )?;
        registry.register(Box::new(transfer_bytes.clone()))?;
        registry.register(Box::new(transfers.clone()))?;

        Ok(Self {
            registry,
            hits,
            misses,
            fills,
            evictions,
            bound,
            capacity,
            transfer_bytes,
            transfers,
        })
    }

    pub fn record_tier(&self, tier: Tier, stats: &SlotStats, bound: usize, capacity: usize) {
        let label = [tier.label()];
        self.hits.with_label_values(&label).set(stats.hits as i64);
        self.misses.with_label_values(&label).set(stats.misses as i64);
        self.fills.with_label_values(&label).set(stats.fills as i64);
        self.evictions.with_label_values(&label).set(stats.evictions as i64);
        self.bound.with_label_values(&label).set(bound as i64);
        self.capacity.with_label_values(&label).set(capacity as i64);
    }

    pub fn record_transfers(&self, snapshot: &TransferSnapshot) {
        self.transfer_bytes
            .with_label_values(&["h2d"])
            .set(snapshot.h2d_bytes as i64);
        self.transfer_bytes
            .with_label_values(&["d2d"])
            .set(snapshot.d2d_bytes as i64);
        self.transfers
            .with_label_values(&["h2d"])
            .set(snapshot.h2d_transfers as i64);
        self.transfers
            .with_label_values(&["d2d"])
            .set(snapshot.d2d_transfers as i64);
    }

    pub fn tier(&self, tier: Tier) -> TierSnapshot {
        let label = [tier.label()];
        TierSnapshot {
            hits: self.hits.with_label_values(&label).get(),
            misses: self.misses.with_label_values(&label).get(),
            fills: self.fills.with_label_values(&label).get(),
            evictions: self.evictions.with_label_values(&label).get(),
            bound: self.bound.with_label_values(&label).get(),
            capacity: self.capacity.with_label_values(&label).get(),
        }
    }

    /// Render all metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
