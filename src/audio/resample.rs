//! Decimation engine: normalize a capture batch and resample it to the target rate.
//!
//! The Kaiser filters are band-limited interpolation tables in the style of
//! Smith's resampling algorithm: a windowed sinc sampled at `2^9` points per
//! zero crossing, evaluated at the exact fractional input position of every
//! output sample. The tables are built once per [`Decimator`] and shared by
//! every batch, so output is a pure function of the input bytes and the rates.

use super::batch::{DecimatedBatch, SampleBatch};
use super::pcm::normalize;
use anyhow::{bail, Context, Result};
use clap::ValueEnum;
#[cfg(feature = "high-quality-audio")]
use rubato::{InterpolationParameters, InterpolationType, Resampler, SincFixedIn, WindowFunction};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::f64::consts::PI;
#[cfg(test)]
use std::sync::atomic::AtomicUsize;
#[cfg(any(test, feature = "high-quality-audio"))]
use std::sync::atomic::{AtomicBool, Ordering};

pub const MIN_DEVICE_RATE: u32 = 2_000;
pub const MAX_DEVICE_RATE: u32 = 1_600_000;

/// Lowest target rate the Kaiser tables can reach from `capture_rate`:
/// below it the table stride rounds down to zero.
pub fn min_target_rate(capture_rate: u32) -> u32 {
    capture_rate.div_ceil(1 << TABLE_PRECISION_BITS)
}

const TABLE_PRECISION_BITS: u32 = 9;

#[cfg(feature = "high-quality-audio")]
const RUBATO_SINC_LEN: usize = 128;
#[cfg(feature = "high-quality-audio")]
const RUBATO_CHUNK: usize = 256;

#[cfg(feature = "high-quality-audio")]
pub(super) static RESAMPLER_WARNING_SHOWN: AtomicBool = AtomicBool::new(false);
#[cfg(test)]
pub(super) static RESAMPLE_FALLBACK_COUNT: AtomicUsize = AtomicUsize::new(0);
#[cfg(test)]
pub(super) static FORCE_RUBATO_ERROR: AtomicBool = AtomicBool::new(false);

/// Anti-aliasing filter used by the decimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterKind {
    /// 16 zero crossings, rolloff 0.85: cheap, ~80 dB stopband.
    KaiserFast,
    /// 64 zero crossings, rolloff ~0.95: slower, sharper transition.
    KaiserBest,
    /// rubato's sinc resampler, falling back to `kaiser-best`.
    Sinc,
}

impl FilterKind {
    pub fn label(self) -> &'static str {
        match self {
            FilterKind::KaiserFast => "kaiser-fast",
            FilterKind::KaiserBest => "kaiser-best",
            FilterKind::Sinc => "sinc",
        }
    }
}

/// Half of a symmetric Kaiser-windowed sinc, sampled `precision` times per zero crossing.
pub(super) struct KaiserTable {
    window: Vec<f64>,
    delta: Vec<f64>,
    precision: usize,
}

impl KaiserTable {
    pub(super) fn fast() -> Self {
        Self::design(16, TABLE_PRECISION_BITS, 0.85, 8.555_504_641_634_386)
    }

    pub(super) fn best() -> Self {
        Self::design(
            64,
            TABLE_PRECISION_BITS,
            0.947_593_716_739_959_6,
            14.769_656_459_379_492,
        )
    }

    pub(super) fn design(num_zeros: usize, precision_bits: u32, rolloff: f64, beta: f64) -> Self {
        let precision = 1usize << precision_bits;
        let n = precision * num_zeros;
        let i0_beta = bessel_i0(beta);
        let mut window = Vec::with_capacity(n + 1);
        for i in 0..=n {
            let zero_crossings = i as f64 / precision as f64;
            let x = i as f64 / n as f64;
            let taper = bessel_i0(beta * (1.0 - x * x).max(0.0).sqrt()) / i0_beta;
            window.push(rolloff * sinc(rolloff * zero_crossings) * taper);
        }
        let mut delta: Vec<f64> = window.windows(2).map(|pair| pair[1] - pair[0]).collect();
        delta.push(0.0);
        Self {
            window,
            delta,
            precision,
        }
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.window.len()
    }

    #[inline]
    pub(super) fn tap(&self, idx: usize, eta: f64) -> f64 {
        self.window[idx] + eta * self.delta[idx]
    }

    /// Interpolate `input` at `n_out` output instants spaced `capture/target` input samples apart.
    pub(super) fn resample(
        &self,
        input: &[f32],
        capture_rate: u32,
        target_rate: u32,
        n_out: usize,
    ) -> Result<Vec<f32>> {
        let step = (u64::from(target_rate) * self.precision as u64 / u64::from(capture_rate))
            .min(self.precision as u64) as usize;
        if step == 0 {
            bail!(
                "decimation ratio {capture_rate}:{target_rate} exceeds the filter table resolution"
            );
        }
        // Offsets and gain follow the integer table stride so the kernel sums to one.
        let scale = step as f64 / self.precision as f64;
        let increment = capture_rate as f64 / target_rate as f64;
        let table_len = self.window.len();
        let n_in = input.len();
        let mut out = Vec::with_capacity(n_out);

        for t in 0..n_out {
            let time = t as f64 * increment;
            let n = time as usize;
            if n >= n_in {
                break;
            }
            let mut acc = 0.0f64;

            // Left wing: input samples at or before the output instant.
            let frac = scale * (time - n as f64);
            let index_frac = frac * self.precision as f64;
            let offset = index_frac as usize;
            let eta = index_frac - offset as f64;
            let i_max = (n + 1).min((table_len - offset) / step);
            for i in 0..i_max {
                acc += self.tap(offset + i * step, eta) * input[n - i] as f64;
            }

            // Right wing: input samples after the output instant.
            let frac = scale - frac;
            let index_frac = frac * self.precision as f64;
            let offset = index_frac as usize;
            let eta = index_frac - offset as f64;
            let k_max = (n_in - n - 1).min((table_len - offset) / step);
            for k in 0..k_max {
                acc += self.tap(offset + k * step, eta) * input[n + k + 1] as f64;
            }

            // Downsampling widens the kernel by 1/scale; rescale for unity gain.
            out.push((acc * scale) as f32);
        }
        Ok(adjust_frame_length(out, n_out))
    }
}

fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

/// Zeroth-order modified Bessel function of the first kind (power series).
pub(super) fn bessel_i0(x: f64) -> f64 {
    let half = x / 2.0;
    let mut term = 1.0f64;
    let mut sum = 1.0f64;
    let mut k = 1.0f64;
    loop {
        term *= (half / k) * (half / k);
        sum += term;
        if term < sum * 1e-17 {
            break;
        }
        k += 1.0;
    }
    sum
}

/// Number of target-rate samples produced from `frames` capture-rate frames.
pub fn output_len(frames: usize, capture_rate: u32, target_rate: u32) -> usize {
    if capture_rate == 0 {
        return 0;
    }
    let numerator = frames as u64 * u64::from(target_rate) + u64::from(capture_rate) - 1;
    (numerator / u64::from(capture_rate)) as usize
}

pub(super) fn adjust_frame_length(mut data: Vec<f32>, desired: usize) -> Vec<f32> {
    match data.len().cmp(&desired) {
        CmpOrdering::Greater => {
            data.truncate(desired);
        }
        CmpOrdering::Less => {
            let pad = *data.last().unwrap_or(&0.0);
            data.resize(desired, pad);
        }
        CmpOrdering::Equal => {}
    }
    data
}

/// Converts capture batches to the target rate with a filter loaded once at startup.
pub struct Decimator {
    #[cfg_attr(not(feature = "high-quality-audio"), allow(dead_code))]
    kind: FilterKind,
    table: KaiserTable,
}

impl Decimator {
    pub fn new(kind: FilterKind) -> Self {
        let table = match kind {
            FilterKind::KaiserFast => KaiserTable::fast(),
            FilterKind::KaiserBest | FilterKind::Sinc => KaiserTable::best(),
        };
        Self { kind, table }
    }

    /// Normalize and resample one batch.
    ///
    /// Errors name the batch's declared format so a bad buffer can be traced
    /// back to the stream configuration that produced it.
    pub fn decimate(&self, batch: &SampleBatch) -> Result<DecimatedBatch> {
        let decoded = normalize(
            &batch.raw_bytes,
            batch.frame_count,
            batch.format,
            batch.divisor,
        )
        .with_context(|| {
            format!(
                "unserialisable {} batch ({} bytes)",
                batch.format.label(),
                batch.raw_bytes.len()
            )
        })?;
        self.resample(&decoded, batch.capture_rate, batch.target_rate)
            .with_context(|| {
                format!(
                    "failed to decimate {} batch {}Hz -> {}Hz",
                    batch.format.label(),
                    batch.capture_rate,
                    batch.target_rate
                )
            })
    }

    /// Resample unit-range samples from `capture_rate` to `target_rate`.
    pub fn resample(&self, input: &[f32], capture_rate: u32, target_rate: u32) -> Result<Vec<f32>> {
        if !(MIN_DEVICE_RATE..=MAX_DEVICE_RATE).contains(&capture_rate) {
            bail!("unsupported capture rate {capture_rate}Hz");
        }
        if target_rate == 0 {
            bail!("target rate must be positive");
        }
        if input.is_empty() {
            return Ok(Vec::new());
        }
        if capture_rate == target_rate {
            return Ok(input.to_vec());
        }
        let n_out = output_len(input.len(), capture_rate, target_rate);

        #[cfg(feature = "high-quality-audio")]
        if self.kind == FilterKind::Sinc {
            match resample_with_rubato(input, capture_rate, target_rate, n_out) {
                Ok(output) => return Ok(output),
                Err(err) => {
                    #[cfg(test)]
                    RESAMPLE_FALLBACK_COUNT.fetch_add(1, Ordering::Relaxed);
                    if !RESAMPLER_WARNING_SHOWN.swap(true, Ordering::AcqRel) {
                        tracing::warn!(
                            "sinc resampler failed ({err:#}); falling back to kaiser-best"
                        );
                    }
                }
            }
        }

        self.table.resample(input, capture_rate, target_rate, n_out)
    }
}

#[cfg(feature = "high-quality-audio")]
pub(super) fn resample_with_rubato(
    input: &[f32],
    capture_rate: u32,
    target_rate: u32,
    n_out: usize,
) -> Result<Vec<f32>> {
    #[cfg(test)]
    if FORCE_RUBATO_ERROR.swap(false, Ordering::Relaxed) {
        return Err(anyhow::anyhow!("forced rubato error"));
    }

    let ratio = target_rate as f64 / capture_rate as f64;
    let params = InterpolationParameters {
        sinc_len: RUBATO_SINC_LEN,
        f_cutoff: 0.95,
        interpolation: InterpolationType::Cubic,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    //           ratio,  drift, params, chunk_size, channels
    let mut rs = SincFixedIn::<f32>::new(ratio, 1.0, params, RUBATO_CHUNK, 1)
        .map_err(|e| anyhow::anyhow!("failed to construct sinc resampler: {e:?}"))?;

    // The sinc kernel delays output by half its length; feed trailing zeros
    // until the delayed tail is out, then drop the lead-in.
    let delay = ((RUBATO_SINC_LEN / 2) as f64 * ratio).round() as usize;
    let wanted = n_out + delay;
    let mut out = Vec::with_capacity(wanted + RUBATO_CHUNK);

    let mut idx = 0usize;
    let mut seg = vec![0.0f32; RUBATO_CHUNK];
    let mut flush_rounds = 0usize;
    while out.len() < wanted {
        seg.fill(0.0);
        if idx < input.len() {
            let end = (idx + RUBATO_CHUNK).min(input.len());
            seg[..end - idx].copy_from_slice(&input[idx..end]);
            idx = end;
        } else {
            flush_rounds += 1;
            if flush_rounds > RUBATO_SINC_LEN {
                bail!("resampler made no progress");
            }
        }
        let produced = rs
            .process(std::slice::from_ref(&seg), None)
            .map_err(|e| anyhow::anyhow!("resampler process failed: {e:?}"))?;
        out.extend_from_slice(&produced[0]);
    }

    let out = out.split_off(delay.min(out.len()));
    Ok(adjust_frame_length(out, n_out))
}
