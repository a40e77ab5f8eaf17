//! Sample sources feeding the host tier.
//!
//! A source hands out windows of samples in channel-major order: channel `c`
//! occupies `dst[c * len..(c + 1) * len]` where `len = to - from`. Samples
//! before the start or past the end of the recording read as zero, so any
//! block index can be requested.

use std::f64::consts::TAU;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use half::f16;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid sample window [{from}, {to})")]
    InvalidRange { from: i64, to: i64 },

    #[error("Destination holds {actual} samples, window needs {expected}")]
    BufferSize { expected: usize, actual: usize },

    #[error("Recording {path} is not a whole number of {channels}-channel frames")]
    Truncated { path: PathBuf, channels: usize },

    #[error("Recording has no channels")]
    NoChannels,

    #[error("Channels have different lengths")]
    RaggedChannels,
}

/// Provider of raw samples. Implementations must be callable from the host
/// tier's worker thread while other threads hold the source.
pub trait SampleSource: Send + Sync {
    fn channel_count(&self) -> usize;

    fn sampling_frequency(&self) -> f64;

    /// Samples per channel.
    fn sample_count(&self) -> u64;

    /// Fill `dst` with samples `[from, to)` of every channel, zero outside the recording.
    fn read_samples(&self, dst: &mut [f32], from: i64, to: i64) -> Result<(), SourceError>;
}

/// Part of a requested window that lies inside the recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Samples per channel in the request.
    pub len: usize,

    /// Zeros before the first recorded sample.
    pub lead: usize,

    /// First recorded sample to read.
    pub start: u64,

    /// Recorded samples to read.
    pub count: usize,
}

/// Validate a request and split it into zero padding and recorded samples.
///
/// Zeroes the whole destination so callers only copy the recorded part.
pub fn padded_window(
    dst: &mut [f32],
    from: i64,
    to: i64,
    channel_count: usize,
    sample_count: u64,
) -> Result<Window, SourceError> {
    if to < from {
        return Err(SourceError::InvalidRange { from, to });
    }
    let len = (to - from) as usize;
    let expected = len * channel_count;
    if dst.len() != expected {
        return Err(SourceError::BufferSize {
            expected,
            actual: dst.len(),
        });
    }
    dst.fill(0.0);

    let end = to.min(sample_count as i64);
    let start = from.max(0);
    if start >= end {
        return Ok(Window {
            len,
            lead: len,
            start: 0,
            count: 0,
        });
    }
    Ok(Window {
        len,
        lead: (start - from) as usize,
        start: start as u64,
        count: (end - start) as usize,
    })
}

/// Recording held in memory, one vector per channel.
#[derive(Debug, Clone)]
pub struct MemorySource {
    channels: Vec<Vec<f32>>,
    sampling_frequency: f64,
}

impl MemorySource {
    pub fn new(channels: Vec<Vec<f32>>, sampling_frequency: f64) -> Result<Self, SourceError> {
        let first = channels.first().ok_or(SourceError::NoChannels)?;
        if channels.iter().any(|c| c.len() != first.len()) {
            return Err(SourceError::RaggedChannels);
        }
        Ok(Self {
            channels,
            sampling_frequency,
        })
    }

    /// Build a recording where sample `s` of channel `c` is `f(c, s)`.
    pub fn from_fn(
        channel_count: usize,
        sample_count: usize,
        sampling_frequency: f64,
        f: impl Fn(usize, usize) -> f32,
    ) -> Result<Self, SourceError> {
        let channels = (0..channel_count)
            .map(|c| (0..sample_count).map(|s| f(c, s)).collect())
            .collect();
        Self::new(channels, sampling_frequency)
    }
}

impl SampleSource for MemorySource {
    fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn sampling_frequency(&self) -> f64 {
        self.sampling_frequency
    }

    fn sample_count(&self) -> u64 {
        self.channels.first().map_or(0, |c| c.len() as u64)
    }

    fn read_samples(&self, dst: &mut [f32], from: i64, to: i64) -> Result<(), SourceError> {
        let w = padded_window(dst, from, to, self.channel_count(), self.sample_count())?;
        let start = w.start as usize;
        for (c, channel) in self.channels.iter().enumerate() {
            let row = c * w.len + w.lead;
            dst[row..row + w.count].copy_from_slice(&channel[start..start + w.count]);
        }
        Ok(())
    }
}

/// Deterministic sine recording; channel `c` oscillates at `base_hz * (c + 1)`.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    channel_count: usize,
    sampling_frequency: f64,
    sample_count: u64,
    base_hz: f64,
    amplitude: f32,
}

impl SyntheticSource {
    pub fn new(channel_count: usize, sampling_frequency: f64, sample_count: u64) -> Self {
        Self {
            channel_count,
            sampling_frequency,
            sample_count,
            base_hz: 1.0,
            amplitude: 100.0,
        }
    }

    pub fn with_base_frequency(mut self, hz: f64) -> Self {
        self.base_hz = hz;
        self
    }

    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = amplitude;
        self
    }

    /// Value of one sample.
    pub fn sample(&self, channel: usize, index: u64) -> f32 {
        let hz = self.base_hz * (channel + 1) as f64;
        let t = index as f64 / self.sampling_frequency;
        self.amplitude * (TAU * hz * t).sin() as f32
    }
}

impl SampleSource for SyntheticSource {
    fn channel_count(&self) -> usize {
        self.channel_count
    }

    fn sampling_frequency(&self) -> f64 {
        self.sampling_frequency
    }

    fn sample_count(&self) -> u64 {
        self.sample_count
    }

    fn read_samples(&self, dst: &mut [f32], from: i64, to: i64) -> Result<(), SourceError> {
        let w = padded_window(dst, from, to, self.channel_count, self.sample_count)?;
        for c in 0..self.channel_count {
            let row = c * w.len + w.lead;
            for (i, out) in dst[row..row + w.count].iter_mut().enumerate() {
                *out = self.sample(c, w.start + i as u64);
            }
        }
        Ok(())
    }
}

/// On-disk encoding of one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    F32,
    F16,
    I16,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::F32 => 4,
            SampleFormat::F16 => 2,
            SampleFormat::I16 => 2,
        }
    }
}

/// Headerless recording of interleaved little-endian frames.
#[derive(Debug)]
pub struct RawFileSource {
    path: PathBuf,
    file: Mutex<File>,
    channel_count: usize,
    sampling_frequency: f64,
    format: SampleFormat,
    sample_count: u64,
}

impl RawFileSource {
    pub fn open(
        path: &Path,
        channel_count: usize,
        sampling_frequency: f64,
        format: SampleFormat,
    ) -> Result<Self, SourceError> {
        if channel_count == 0 {
            return Err(SourceError::NoChannels);
        }
        let file = File::open(path)?;
        let bytes = file.metadata()?.len();
        let frame_bytes = (channel_count * format.bytes_per_sample()) as u64;
        if bytes % frame_bytes != 0 {
            return Err(SourceError::Truncated {
                path: path.to_path_buf(),
                channels: channel_count,
            });
        }

        let sample_count = bytes / frame_bytes;
        info!(
            path = %path.display(),
            channels = channel_count,
            samples = sample_count,
            format = ?format,
            "Opened raw recording"
        );

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            channel_count,
            sampling_frequency,
            format,
            sample_count,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    fn frame_bytes(&self) -> u64 {
        (self.channel_count * self.format.bytes_per_sample()) as u64
    }
}

/// Read `count` raw values straight into a typed buffer.
fn read_values<T: Pod + Zeroable>(file: &mut File, count: usize) -> std::io::Result<Vec<T>> {
    let mut values = vec![T::zeroed(); count];
    file.read_exact(bytemuck::cast_slice_mut(&mut values))?;
    Ok(values)
}

/// Scatter interleaved frames into channel-major rows.
fn deinterleave<T: Copy>(
    values: &[T],
    dst: &mut [f32],
    window: &Window,
    channels: usize,
    decode: impl Fn(T) -> f32,
) {
    for (frame, samples) in values.chunks_exact(channels).enumerate() {
        for (c, &v) in samples.iter().enumerate() {
            dst[c * window.len + window.lead + frame] = decode(v);
        }
    }
}

impl SampleSource for RawFileSource {
    fn channel_count(&self) -> usize {
        self.channel_count
    }

    fn sampling_frequency(&self) -> f64 {
        self.sampling_frequency
    }

    fn sample_count(&self) -> u64 {
        self.sample_count
    }

    fn read_samples(&self, dst: &mut [f32], from: i64, to: i64) -> Result<(), SourceError> {
        let w = padded_window(dst, from, to, self.channel_count, self.sample_count)?;
        if w.count == 0 {
            return Ok(());
        }

        let values = w.count * self.channel_count;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(w.start * self.frame_bytes()))?;

        match self.format {
            SampleFormat::F32 => {
                let raw: Vec<f32> = read_values(&mut file, values)?;
                deinterleave(&raw, dst, &w, self.channel_count, |v| {
                    f32::from_bits(u32::from_le(v.to_bits()))
                });
            }
            SampleFormat::F16 => {
                let raw: Vec<f16> = read_values(&mut file, values)?;
                deinterleave(&raw, dst, &w, self.channel_count, |v| {
                    f16::from_bits(u16::from_le(v.to_bits())).to_f32()
                });
            }
            SampleFormat::I16 => {
                let raw: Vec<i16> = read_values(&mut file, values)?;
                deinterleave(&raw, dst, &w, self.channel_count, |v| i16::from_le(v) as f32);
            }
        }

        debug!(from, to, samples = w.count, "Read raw samples");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_padded_window() {
        let mut dst = vec![9.0; 2 * 10];
        let w = padded_window(&mut dst, -3, 7, 2, 5).unwrap();
        assert_eq!(
            w,
            Window {
                len: 10,
                lead: 3,
                start: 0,
                count: 5
            }
        );
        assert!(dst.iter().all(|&v| v == 0.0));

        let w = padded_window(&mut dst, 20, 30, 2, 5).unwrap();
        assert_eq!(w.count, 0);

        assert!(matches!(
            padded_window(&mut dst, 0, 3, 2, 5),
            Err(SourceError::BufferSize { expected: 6, actual: 20 })
        ));
        assert!(matches!(
            padded_window(&mut dst, 3, 0, 2, 5),
            Err(SourceError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_memory_source_zero_pads() {
        let source = MemorySource::from_fn(2, 4, 100.0, |c, s| (c * 10 + s + 1) as f32).unwrap();
        let mut dst = vec![0.0; 2 * 6];
        source.read_samples(&mut dst, -1, 5).unwrap();
        assert_eq!(
            dst,
            vec![0.0, 1.0, 2.0, 3.0, 4.0, 0.0, 0.0, 11.0, 12.0, 13.0, 14.0, 0.0]
        );
    }

    #[test]
    fn test_memory_source_rejects_ragged() {
        assert!(matches!(
            MemorySource::new(vec![vec![0.0; 3], vec![0.0; 2]], 1.0),
            Err(SourceError::RaggedChannels)
        ));
        assert!(matches!(
            MemorySource::new(Vec::new(), 1.0),
            Err(SourceError::NoChannels)
        ));
    }

    #[test]
    fn test_synthetic_source() {
        let source = SyntheticSource::new(3, 256.0, 1024);
        let mut dst = vec![1.0; 3 * 8];
        source.read_samples(&mut dst, 1020, 1028).unwrap();
        assert_eq!(dst[4..8], [0.0; 4]);
        assert_eq!(dst[0], source.sample(0, 1020));
        assert_eq!(dst[8 + 3], source.sample(1, 1023));
        // Deterministic.
        assert_eq!(source.sample(2, 17), source.sample(2, 17));
    }

    #[test]
    fn test_synthetic_frequency_and_amplitude() {
        let source = SyntheticSource::new(2, 256.0, 1024)
            .with_base_frequency(2.0)
            .with_amplitude(5.0);
        // Quarter period of the 2 Hz channel.
        assert!((source.sample(0, 32) - 5.0).abs() < 1e-4);
        // Channel 1 runs at 4 Hz: half period, back at zero.
        assert!(source.sample(1, 32).abs() < 1e-4);
    }

    fn raw_file(bytes: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_raw_f32_interleaved() {
        // Three frames of two channels.
        let values: [f32; 6] = [1.0, -1.0, 2.0, -2.0, 3.0, -3.0];
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let file = raw_file(&bytes);

        let source = RawFileSource::open(file.path(), 2, 10.0, SampleFormat::F32).unwrap();
        assert_eq!(source.sample_count(), 3);

        let mut dst = vec![0.0; 2 * 4];
        source.read_samples(&mut dst, 1, 5).unwrap();
        assert_eq!(dst, vec![2.0, 3.0, 0.0, 0.0, -2.0, -3.0, 0.0, 0.0]);
    }

    #[test]
    fn test_raw_f16_and_i16() {
        let values = [f16::from_f32(0.5), f16::from_f32(-4.0)];
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let file = raw_file(&bytes);
        let source = RawFileSource::open(file.path(), 1, 1.0, SampleFormat::F16).unwrap();
        let mut dst = vec![0.0; 2];
        source.read_samples(&mut dst, 0, 2).unwrap();
        assert_eq!(dst, vec![0.5, -4.0]);

        let bytes: Vec<u8> = [7i16, -300].iter().flat_map(|v| v.to_le_bytes()).collect();
        let file = raw_file(&bytes);
        let source = RawFileSource::open(file.path(), 2, 1.0, SampleFormat::I16).unwrap();
        let mut dst = vec![0.0; 2];
        source.read_samples(&mut dst, 0, 1).unwrap();
        assert_eq!(dst, vec![7.0, -300.0]);
    }

    #[test]
    fn test_raw_truncated_rejected() {
        let file = raw_file(&[0u8; 6]);
        assert!(matches!(
            RawFileSource::open(file.path(), 2, 1.0, SampleFormat::F32),
            Err(SourceError::Truncated { .. })
        ));
    }
}
