//! Raw PCM layouts delivered by the capture device.
//!
//! Capture buffers are little-endian, mono, and packed at the declared sample
//! width. Integer formats are mapped to unit-range floats by dividing by the
//! format's divisor.

use anyhow::{bail, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Sample encoding of the capture stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
pub enum SampleFormat {
    #[serde(rename = "paInt16", alias = "int16", alias = "Int16")]
    Int16,
    #[serde(rename = "paInt24", alias = "int24", alias = "Int24")]
    Int24,
    #[serde(rename = "paFloat32", alias = "float32", alias = "Float32")]
    Float32,
}

impl SampleFormat {
    /// Label reported to clients in the stream status.
    pub fn label(self) -> &'static str {
        match self {
            SampleFormat::Int16 => "paInt16",
            SampleFormat::Int24 => "paInt24",
            SampleFormat::Float32 => "paFloat32",
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::Int16 => 2,
            SampleFormat::Int24 => 3,
            SampleFormat::Float32 => 4,
        }
    }

    /// Normalization constant mapping the format onto `[-1, 1]`.
    pub fn divisor(self) -> f32 {
        match self {
            SampleFormat::Int16 => 32_768.0,
            SampleFormat::Int24 => 8_388_608.0,
            SampleFormat::Float32 => 1.0,
        }
    }
}

/// Decode a packed buffer into unit-range samples.
///
/// Fails when the buffer is not a whole number of samples or disagrees with the
/// declared frame count, so a truncated driver buffer never turns into noise.
pub fn normalize(
    raw: &[u8],
    frame_count: usize,
    format: SampleFormat,
    divisor: f32,
) -> Result<Vec<f32>> {
    let width = format.bytes_per_sample();
    if raw.len() % width != 0 {
        bail!(
            "{} bytes is not a whole number of {} samples",
            raw.len(),
            format.label()
        );
    }
    let samples = raw.len() / width;
    if samples != frame_count {
        bail!(
            "buffer holds {samples} {} samples but {frame_count} frames were declared",
            format.label()
        );
    }
    if !divisor.is_finite() || divisor == 0.0 {
        bail!("invalid divisor {divisor} for {}", format.label());
    }

    let mut out = Vec::with_capacity(samples);
    match format {
        SampleFormat::Int16 => {
            for chunk in raw.chunks_exact(2) {
                let value = i16::from_le_bytes([chunk[0], chunk[1]]);
                out.push(value as f32 / divisor);
            }
        }
        SampleFormat::Int24 => {
            for chunk in raw.chunks_exact(3) {
                // Shift into the top of an i32 so the arithmetic shift sign-extends.
                let value = i32::from_le_bytes([0, chunk[0], chunk[1], chunk[2]]) >> 8;
                out.push(value as f32 / divisor);
            }
        }
        SampleFormat::Float32 => {
            for chunk in raw.chunks_exact(4) {
                let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                out.push(value / divisor);
            }
        }
    }
    Ok(out)
}

/// Append unit-range samples to `buf` in the packed layout of `format`.
pub fn encode_into(buf: &mut Vec<u8>, samples: &[f32], format: SampleFormat) {
    match format {
        SampleFormat::Int16 => {
            for &sample in samples {
                let value = (sample * 32_768.0).round().clamp(-32_768.0, 32_767.0) as i16;
                buf.extend_from_slice(&value.to_le_bytes());
            }
        }
        SampleFormat::Int24 => {
            for &sample in samples {
                let value =
                    (sample * 8_388_608.0).round().clamp(-8_388_608.0, 8_388_607.0) as i32;
                buf.extend_from_slice(&value.to_le_bytes()[..3]);
            }
        }
        SampleFormat::Float32 => {
            for &sample in samples {
                buf.extend_from_slice(&sample.to_le_bytes());
            }
        }
    }
}

/// Encode unit-range samples into a fresh packed buffer.
pub fn encode_samples(samples: &[f32], format: SampleFormat) -> Vec<u8> {
    let mut buf = Vec::with_capacity(samples.len() * format.bytes_per_sample());
    encode_into(&mut buf, samples, format);
    buf
}
