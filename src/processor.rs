//! The signal processor: owns the three tiers and their worker threads.
//!
//! Construction validates the configuration, sizes every tier from its memory
//! budget, allocates all buffers and starts the host and device workers.
//! Dropping the processor stops the workers, waits for the device to drain
//! and frees the tiers from the fastest to the slowest.

use std::ops::Range;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{error, info, info_span, Span};
use uuid::Uuid;

use crate::cache::block::{BlockGeometry, BlockIndex, Tier};
use crate::cache::device::DeviceBlockCache;
use crate::cache::host::HostBlockCache;
use crate::cache::prefetcher::{PrefetchPlan, Prefetcher};
use crate::cache::processing::{ProcessingWorkingSet, RenderableBlock};
use crate::cache::slots::SlotError;
use crate::cache::tier::{abort_on_fatal, FatalHandler, Lifecycle, TierState};
use crate::cache::CacheError;
use crate::config::{Config, ConfigError};
use crate::gpu::allocator::{slots_for_budget, AllocatorError};
use crate::gpu::device::{Device, DeviceError, DeviceInfo};
use crate::gpu::kernels::{FirFilter, SignalTransform};
use crate::metrics::CacheMetrics;
use crate::transfer::disk_io::SampleSource;

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Slot error: {0}")]
    Slot(#[from] SlotError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Failed to start worker {name}: {reason}")]
    Spawn { name: String, reason: String },

    #[error("No candidate blocks given")]
    EmptyCandidates,

    #[error("Pipeline halted")]
    Halted,
}

impl From<CacheError> for ProcessorError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::EmptyCandidates => ProcessorError::EmptyCandidates,
            CacheError::Halted => ProcessorError::Halted,
            CacheError::Slot(e) => ProcessorError::Slot(e),
            CacheError::Device(e) => ProcessorError::Device(e),
        }
    }
}

/// Collects everything a [`SignalProcessor`] is built from.
pub struct SignalProcessorBuilder {
    config: Config,
    source: Arc<dyn SampleSource>,
    transform: Option<Arc<dyn SignalTransform>>,
    fir_taps: Option<Vec<f32>>,
    device: Option<Device>,
    on_fatal: FatalHandler,
}

impl SignalProcessorBuilder {
    /// Device transform applied while uploading blocks.
    pub fn transform(mut self, transform: Arc<dyn SignalTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// FIR filter over each channel row, built once the block geometry is known.
    pub fn fir_filter(mut self, taps: Vec<f32>) -> Self {
        self.fir_taps = Some(taps);
        self
    }

    /// Use an existing device instead of bringing one up from the config.
    pub fn device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Called after a fatal error has halted the pipeline. Aborts by default.
    pub fn on_fatal(mut self, handler: FatalHandler) -> Self {
        self.on_fatal = handler;
        self
    }

    pub fn build(self) -> Result<SignalProcessor, ProcessorError> {
        let id = Uuid::new_v4();
        let span = info_span!("signal_processor", id = %id);
        let processor = span.in_scope(|| self.assemble(id, span.clone()))?;
        processor.start_workers()
    }

    fn assemble(self, id: Uuid, span: Span) -> Result<SignalProcessor, ProcessorError> {
        let config = self.config;
        config.validate()?;

        let geometry = BlockGeometry::from_config(
            &config.signal,
            self.source.channel_count(),
            self.source.sampling_frequency(),
        )?;
        let device = match self.device {
            Some(device) => device,
            None => Device::new(DeviceInfo::from(&config.device))?,
        };

        let max = device.info().max_allocation;
        if geometry.device_block_bytes() > max {
            return Err(AllocatorError::BlockTooLarge {
                block_bytes: geometry.device_block_bytes(),
                max,
            }
            .into());
        }

        let host_slots = slots_for_budget(
            Tier::Host,
            config.tiers.host_memory_budget,
            geometry.host_block_bytes(),
        )?;
        let device_slots = slots_for_budget(
            Tier::Device,
            config.tiers.device_memory_budget,
            geometry.device_block_bytes(),
        )?;
        let processing_slots = config.tiers.processing_slots;

        info!(
            block_size = geometry.block_size,
            offset = geometry.offset,
            delay = geometry.delay,
            channels = geometry.channel_count,
            host_slots,
            device_slots,
            processing_slots,
            "Tier capacities"
        );

        let host_state = Arc::new(TierState::new(Tier::Host, host_slots));
        let device_state = Arc::new(TierState::new(Tier::Device, device_slots));
        let processing_state = Arc::new(TierState::new(Tier::Processing, processing_slots));
        let lifecycle = Arc::new(Lifecycle::new(
            vec![host_state.clone(), device_state.clone(), processing_state.clone()],
            self.on_fatal,
        ));

        let transform = match (self.transform, self.fir_taps) {
            (Some(transform), _) => Some(transform),
            (None, Some(taps)) => {
                Some(Arc::new(FirFilter::new(taps, &geometry)) as Arc<dyn SignalTransform>)
            }
            (None, None) => None,
        };

        let host = Arc::new(HostBlockCache::new(
            host_state,
            self.source.clone(),
            geometry,
            lifecycle.clone(),
        ));
        let device_cache = Arc::new(DeviceBlockCache::new(
            &device,
            device_state,
            host.clone(),
            &geometry,
            transform,
            lifecycle.clone(),
        )?);
        let processing = ProcessingWorkingSet::new(
            processing_state,
            device_cache.clone(),
            geometry,
            lifecycle.clone(),
        )?;

        Ok(SignalProcessor {
            id,
            span,
            geometry,
            prefetcher: Prefetcher::new(config.prefetch.clone()),
            source: self.source,
            processing,
            device_cache,
            host,
            lifecycle,
            workers: Vec::new(),
            metrics: CacheMetrics::new()?,
            device,
        })
    }
}

/// Entry point of the cache: hands out processing blocks for display.
///
/// Fields drop in declaration order after `Drop::drop` has stopped the
/// workers: processing, then device, then host.
pub struct SignalProcessor {
    id: Uuid,
    span: Span,
    geometry: BlockGeometry,
    prefetcher: Prefetcher,
    source: Arc<dyn SampleSource>,
    processing: ProcessingWorkingSet,
    device_cache: Arc<DeviceBlockCache>,
    host: Arc<HostBlockCache>,
    lifecycle: Arc<Lifecycle>,
    workers: Vec<JoinHandle<()>>,
    metrics: CacheMetrics,
    device: Device,
}

impl SignalProcessor {
    pub fn builder(config: Config, source: Arc<dyn SampleSource>) -> SignalProcessorBuilder {
        SignalProcessorBuilder {
            config,
            source,
            transform: None,
            fir_taps: None,
            device: None,
            on_fatal: abort_on_fatal(),
        }
    }

    /// Build with defaults for everything but the configuration and source.
    pub fn new(config: Config, source: Arc<dyn SampleSource>) -> Result<Self, ProcessorError> {
        Self::builder(config, source).build()
    }

    fn start_workers(mut self) -> Result<Self, ProcessorError> {
        let host = self.host.clone();
        let host_worker = self.spawn_worker("host-fill", move || host.run_worker())?;
        self.workers.push(host_worker);

        let device_cache = self.device_cache.clone();
        let device_worker = self.spawn_worker("device-fill", move || device_cache.run_worker())?;
        self.workers.push(device_worker);

        info!(parent: &self.span, workers = self.workers.len(), "Signal processor started");
        Ok(self)
    }

    fn spawn_worker(
        &self,
        name: &str,
        work: impl FnOnce() + Send + 'static,
    ) -> Result<JoinHandle<()>, ProcessorError> {
        let span = self.span.clone();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || span.in_scope(work))
            .map_err(|e| ProcessorError::Spawn {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn geometry(&self) -> &BlockGeometry {
        &self.geometry
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn is_halted(&self) -> bool {
        self.lifecycle.is_stopped()
    }

    /// Wait for one of `candidates` to be resident in the working set.
    ///
    /// Returns [`ProcessorError::Halted`] once the pipeline has stopped.
    pub fn get_any_block(&self, candidates: &[BlockIndex]) -> Result<RenderableBlock, ProcessorError> {
        Ok(self.processing.get_any_block(candidates)?)
    }

    /// Hand a block back to the working set.
    pub fn release(&self, block: RenderableBlock) -> Result<(), ProcessorError> {
        Ok(block.release()?)
    }

    /// Warm the host and device tiers without taking processing slots.
    pub fn prefetch(&self, indices: &[BlockIndex]) {
        if self.lifecycle.is_stopped() {
            return;
        }
        for &index in indices {
            self.host.state().request_fill(index);
            self.device_cache.state().request_fill(index);
        }
    }

    /// Prefetch the blocks of the sample window `[from, to)` and their neighbours.
    pub fn prefetch_window(&self, from: i64, to: i64) -> PrefetchPlan {
        let plan = self.prefetcher.plan(&self.geometry, from, to);
        self.prefetch(&plan.visible);
        self.prefetch(&plan.prefetch);
        plan
    }

    /// Blocks whose rendered samples intersect `[from, to)`.
    pub fn blocks_for_range(&self, from: i64, to: i64) -> Range<BlockIndex> {
        self.geometry.blocks_in_range(from, to)
    }

    /// Samples block `index` renders.
    pub fn sample_range(&self, index: BlockIndex) -> Range<i64> {
        self.geometry.boundaries(index)
    }

    /// Blocks covering the whole recording.
    pub fn recording_blocks(&self) -> Range<BlockIndex> {
        self.blocks_for_range(0, self.source.sample_count() as i64)
    }

    /// Bookkeeping of one tier, for inspection.
    pub fn tier_state(&self, tier: Tier) -> &Arc<TierState> {
        match tier {
            Tier::Host => self.host.state(),
            Tier::Device => self.device_cache.state(),
            Tier::Processing => self.processing.state(),
        }
    }

    /// Refresh and return the metrics.
    pub fn metrics(&self) -> &CacheMetrics {
        for tier in [Tier::Host, Tier::Device, Tier::Processing] {
            let state = self.tier_state(tier);
            let logic = state.lock();
            self.metrics
                .record_tier(tier, &logic.stats(), logic.bound_count(), logic.capacity());
        }
        self.metrics.record_transfers(&self.device_cache.transfer_stats());
        &self.metrics
    }
}

impl Drop for SignalProcessor {
    fn drop(&mut self) {
        let _enter = self.span.enter();
        info!("Shutting down signal processor");

        self.lifecycle.stop();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("Worker thread panicked");
            }
        }
        self.device.wait_idle();

        info!("Signal processor stopped");
    }
}
