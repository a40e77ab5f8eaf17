//! Runtime configuration for signal-cache-tier.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Block shape, tier budgets, prefetch distances and the simulated device live here.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transfer::disk_io::SampleFormat;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "signal-cache-tier",
    about = "Stream a multi-channel recording through the tiered block cache"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Raw interleaved recording; a synthetic recording is used when absent.
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Channels in the recording.
    #[arg(long, default_value_t = 32)]
    pub channels: usize,

    /// Sampling frequency in Hz.
    #[arg(long, default_value_t = 256.0)]
    pub sampling_frequency: f64,

    /// Sample encoding of the raw input.
    #[arg(long, value_enum, default_value_t = SampleFormat::F32)]
    pub format: SampleFormat,

    /// Peak amplitude of the synthetic recording.
    #[arg(long, default_value_t = 100.0)]
    pub amplitude: f32,

    /// Frequency of the first synthetic channel in Hz; channel `c` runs at `(c + 1)` times this.
    #[arg(long, default_value_t = 1.0)]
    pub base_frequency: f64,

    /// Number of blocks to scroll through.
    #[arg(short, long, default_value_t = 64)]
    pub blocks: i64,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Recording has no channels")]
    NoChannels,

    #[error("Filter length ({filter_length}) and block length ({block_length}) must be multiples of 4")]
    NotMultipleOfFour {
        filter_length: usize,
        block_length: usize,
    },

    #[error("Block length ({block_length}) must be greater than the filter length ({filter_length})")]
    BlockShorterThanFilter {
        filter_length: usize,
        block_length: usize,
    },

    #[error("The processing tier needs at least one slot")]
    ZeroProcessingSlots,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Block shape.
    pub signal: SignalConfig,

    /// Tier budgets.
    pub tiers: TierConfig,

    /// Prefetch distances.
    pub prefetch: PrefetchConfig,

    /// Simulated compute device.
    pub device: DeviceConfig,
}

/// Block shape settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Samples read per block and channel, filter overlap included.
    pub block_length: usize,

    /// Filter length in samples (defaults to the sampling frequency).
    pub filter_length: Option<usize>,

    /// Group delay compensation in samples (defaults to `filter_length / 2 - 1`).
    pub delay: Option<i64>,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            block_length: 4096,
            filter_length: None,
            delay: None,
        }
    }
}

/// Tier capacities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Host RAM budget for the host tier in bytes.
    pub host_memory_budget: usize,

    /// Device memory budget for the device tier in bytes.
    pub device_memory_budget: usize,

    /// Number of processing working set slots.
    pub processing_slots: usize,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            host_memory_budget: 256 * 1024 * 1024, // 256 MB
            device_memory_budget: 64 * 1024 * 1024, // 64 MB
            processing_slots: 8,
        }
    }
}

/// How far around the visible window to warm the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Blocks after the visible window.
    pub ahead_blocks: usize,

    /// Blocks before the visible window.
    pub behind_blocks: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            ahead_blocks: 4,
            behind_blocks: 1,
        }
    }
}

/// Simulated compute device limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,

    /// Total device memory in bytes.
    pub global_memory: usize,

    /// Largest single allocation in bytes.
    pub max_allocation: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "simulated-device".to_string(),
            global_memory: 512 * 1024 * 1024, // 512 MB
            max_allocation: 128 * 1024 * 1024, // 128 MB
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Checks that do not depend on the recording.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tiers.processing_slots == 0 {
            return Err(ConfigError::ZeroProcessingSlots);
        }
        Ok(())
    }
}
