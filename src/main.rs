//! Demo driver: scrolls a recording through the tiered cache.
//!
//! Blocks are requested in order as a viewer panning forward would, with the
//! next window prefetched while the current one is consumed. Per-block latency
//! is logged and the metrics are printed on exit.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing::{debug, info};

use signal_cache_tier::config::{Cli, Config};
use signal_cache_tier::processor::SignalProcessor;
use signal_cache_tier::transfer::disk_io::{RawFileSource, SampleSource, SyntheticSource};

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "signal_cache_tier=debug"
    } else {
        "signal_cache_tier=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_thread_names(true)
        .init();

    info!("signal-cache-tier v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;

    let source: Arc<dyn SampleSource> = match &cli.input {
        Some(path) => Arc::new(RawFileSource::open(
            path,
            cli.channels,
            cli.sampling_frequency,
            cli.format,
        )?),
        None => {
            let samples = (cli.sampling_frequency * 3600.0) as u64;
            info!(channels = cli.channels, samples, "Using synthetic recording");
            Arc::new(
                SyntheticSource::new(cli.channels, cli.sampling_frequency, samples)
                    .with_base_frequency(cli.base_frequency)
                    .with_amplitude(cli.amplitude),
            )
        }
    };

    let processor = SignalProcessor::new(config, source)?;
    let geometry = *processor.geometry();
    let recording = processor.recording_blocks();
    let end = (recording.start + cli.blocks).min(recording.end);

    info!(
        id = %processor.id(),
        from = recording.start,
        to = end,
        "Scrolling recording"
    );

    let started = Instant::now();
    for index in recording.start..end {
        let window = geometry.boundaries(index);
        let width = window.end - window.start;
        processor.prefetch_window(window.start + width, window.end + width);

        let requested = Instant::now();
        let block = processor.get_any_block(&[index])?;
        debug!(
            block = block.block_index(),
            slot = block.slot(),
            latency_us = requested.elapsed().as_micros() as u64,
            "Block ready"
        );
        processor.release(block)?;
    }

    let elapsed = started.elapsed();
    info!(
        blocks = end - recording.start,
        elapsed_ms = elapsed.as_millis() as u64,
        "Scroll finished"
    );

    println!("{}", processor.metrics().encode()?);
    Ok(())
}
