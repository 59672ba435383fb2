//! Stateless PCM sample conversion.
//!
//! Converts mono sample buffers between PCM 16-bit little-endian and 32-bit
//! float at arbitrary sample rates, and between raw byte payloads and
//! in-memory buffers. The destination frame count for a rate change is
//! exactly `ceil(src_frames * dst_rate / src_rate)`.
//!
//! Resampling is linear interpolation. FIFO resamplers carry filter latency
//! and a fixed chunk discipline, which breaks both the exact frame-count
//! contract and identity-config sample preservation.
//!
//! All functions are pure; callers treat a conversion failure as a dropped
//! frame, never as a session-fatal error.

use thiserror::Error;

/// Errors produced by sample conversion.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// Only mono is supported
    #[error("unsupported channel count: {0} (only mono is supported)")]
    UnsupportedChannels(u16),

    /// Sample rate must be non-zero
    #[error("invalid sample rate: 0")]
    InvalidSampleRate,

    /// Raw payload length does not divide into whole samples
    #[error("payload length {len} is not a multiple of the {bytes_per_sample}-byte sample size")]
    TruncatedPayload {
        /// Payload length in bytes
        len: usize,
        /// Size of one sample in bytes
        bytes_per_sample: usize,
    },
}

/// In-memory sample encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    /// 16-bit signed little-endian integer PCM
    Pcm16,
    /// 32-bit float PCM, nominal range [-1.0, 1.0]
    F32,
}

impl SampleKind {
    /// Size of one sample in bytes.
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleKind::Pcm16 => 2,
            SampleKind::F32 => 4,
        }
    }
}

/// An audio format configuration: rate, channel count, sample encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count (only 1 is supported)
    pub channels: u16,
    /// Sample encoding
    pub kind: SampleKind,
}

impl AudioFormat {
    /// Mono PCM16 at the given rate.
    pub fn pcm16(sample_rate: u32) -> Self {
        Self { sample_rate, channels: 1, kind: SampleKind::Pcm16 }
    }

    /// Mono f32 at the given rate.
    pub fn f32(sample_rate: u32) -> Self {
        Self { sample_rate, channels: 1, kind: SampleKind::F32 }
    }

    fn validate(&self) -> Result<(), ConversionError> {
        if self.channels != 1 {
            return Err(ConversionError::UnsupportedChannels(self.channels));
        }
        if self.sample_rate == 0 {
            return Err(ConversionError::InvalidSampleRate);
        }
        Ok(())
    }
}

/// A buffer of mono samples.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleBuffer {
    /// 16-bit integer samples
    Pcm16(Vec<i16>),
    /// 32-bit float samples
    F32(Vec<f32>),
}

impl SampleBuffer {
    /// Number of frames (samples, since mono) in the buffer.
    pub fn frame_count(&self) -> usize {
        match self {
            SampleBuffer::Pcm16(s) => s.len(),
            SampleBuffer::F32(s) => s.len(),
        }
    }

    /// The sample encoding of this buffer.
    pub fn kind(&self) -> SampleKind {
        match self {
            SampleBuffer::Pcm16(_) => SampleKind::Pcm16,
            SampleBuffer::F32(_) => SampleKind::F32,
        }
    }
}

/// Convert a buffer from one format configuration to another.
///
/// The returned buffer has exactly
/// `ceil(frames * destination.sample_rate / source.sample_rate)` frames and
/// the destination's sample encoding. Identity configurations preserve frame
/// count and sample values exactly.
pub fn convert(
    buffer: &SampleBuffer,
    source: &AudioFormat,
    destination: &AudioFormat,
) -> Result<SampleBuffer, ConversionError> {
    source.validate()?;
    destination.validate()?;

    // Fast path: nothing to do.
    if source.sample_rate == destination.sample_rate && buffer.kind() == destination.kind {
        return Ok(buffer.clone());
    }

    let samples = to_f32(buffer);
    let resampled = if source.sample_rate == destination.sample_rate {
        samples
    } else {
        resample(&samples, source.sample_rate, destination.sample_rate)
    };

    Ok(match destination.kind {
        SampleKind::F32 => SampleBuffer::F32(resampled),
        SampleKind::Pcm16 => SampleBuffer::Pcm16(resampled.iter().map(|&s| f32_to_i16(s)).collect()),
    })
}

/// Interpret a raw byte payload as a sample buffer in the given format.
pub fn bytes_to_buffer(bytes: &[u8], config: &AudioFormat) -> Result<SampleBuffer, ConversionError> {
    config.validate()?;
    let bps = config.kind.bytes_per_sample();
    if bytes.len() % bps != 0 {
        return Err(ConversionError::TruncatedPayload { len: bytes.len(), bytes_per_sample: bps });
    }
    Ok(match config.kind {
        SampleKind::Pcm16 => SampleBuffer::Pcm16(
            bytes.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect(),
        ),
        SampleKind::F32 => SampleBuffer::F32(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
    })
}

/// Serialize a sample buffer to its little-endian byte payload.
pub fn buffer_to_bytes(buffer: &SampleBuffer) -> Vec<u8> {
    match buffer {
        SampleBuffer::Pcm16(samples) => {
            samples.iter().flat_map(|s| s.to_le_bytes()).collect()
        }
        SampleBuffer::F32(samples) => samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
    }
}

fn to_f32(buffer: &SampleBuffer) -> Vec<f32> {
    match buffer {
        SampleBuffer::F32(s) => s.clone(),
        SampleBuffer::Pcm16(s) => s.iter().map(|&v| v as f32 / 32768.0).collect(),
    }
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Linear-interpolation resampler.
///
/// Output length is `ceil(n * dst_rate / src_rate)`; positions past the last
/// input frame hold the last input value.
fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }
    let out_len = (samples.len() as u64 * dst_rate as u64).div_ceil(src_rate as u64) as usize;
    let step = src_rate as f64 / dst_rate as f64;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let i0 = (pos.floor() as usize).min(last);
            let i1 = (i0 + 1).min(last);
            let frac = (pos - i0 as f64) as f32;
            samples[i0] + (samples[i1] - samples[i0]) * frac.clamp(0.0, 1.0)
        })
        .collect()
}
