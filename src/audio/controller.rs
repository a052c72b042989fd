//! Stream controller: owns the capture device and the dispatch queue.
//!
//! Every device-level operation goes through here, serialized by the device
//! mutex, so a stop always completes before the next open reuses the handle.

use super::batch::SampleBatch;
use super::device::{CaptureCallback, CaptureDevice, OpenRequest};
use super::dispatch::{BatchProducer, DispatchQueue, QueueSnapshot};
use super::pcm::SampleFormat;
use super::resample::min_target_rate;
use crate::lock_or_recover;
use crate::sink::DataHandler;
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::sync::Mutex;

/// Longest capture a single callback may cover.
pub const MAX_CALLBACK_SECONDS: u64 = 10;

/// Fixed capture settings chosen at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub capture_rate: u32,
    pub sample_format: SampleFormat,
    /// `None` selects the host's default input device.
    pub device_index: Option<usize>,
}

/// Client-requested output cadence, replaced wholesale by each `SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenParameters {
    pub target_rate: u32,
    pub batch_size: u32,
    pub frames_per_callback: usize,
}

impl OpenParameters {
    /// Derive `frames_per_callback = floor(capture_rate * batch_size / target_rate)`.
    ///
    /// Rejects target rates the decimator cannot reach and batches longer
    /// than [`MAX_CALLBACK_SECONDS`] of capture.
    pub fn new(capture_rate: u32, target_rate: u32, batch_size: u32) -> Result<Self> {
        if target_rate == 0 {
            bail!("target rate must be positive");
        }
        if batch_size == 0 {
            bail!("batch size must be positive");
        }
        let lowest = min_target_rate(capture_rate);
        if target_rate < lowest {
            bail!("target rate {target_rate}Hz is below {lowest}Hz, the lowest reachable from {capture_rate}Hz");
        }
        let frames = u64::from(capture_rate) * u64::from(batch_size) / u64::from(target_rate);
        if frames == 0 {
            bail!(
                "target rate {target_rate}Hz with batch size {batch_size} yields no frames at {capture_rate}Hz"
            );
        }
        let max_frames = u64::from(capture_rate) * MAX_CALLBACK_SECONDS;
        if frames > max_frames {
            bail!(
                "batch size {batch_size} at {target_rate}Hz needs {frames} frames per callback; the limit is {max_frames} ({MAX_CALLBACK_SECONDS}s of capture)"
            );
        }
        let frames_per_callback = usize::try_from(frames)
            .map_err(|_| anyhow!("frames per callback {frames} does not fit in memory"))?;
        Ok(Self {
            target_rate,
            batch_size,
            frames_per_callback,
        })
    }
}

/// Parse a `<target_rate>#<batch_size>` token.
pub fn parse_start_token(token: &str) -> Result<(u32, u32)> {
    let fields: Vec<&str> = token.split('#').collect();
    let [rate, batch] = fields.as_slice() else {
        bail!("expected <target_rate>#<batch_size>, got {} field(s)", fields.len());
    };
    let target_rate = rate
        .trim()
        .parse::<u32>()
        .with_context(|| format!("invalid target rate {rate:?}"))?;
    let batch_size = batch
        .trim()
        .parse::<u32>()
        .with_context(|| format!("invalid batch size {batch:?}"))?;
    Ok((target_rate, batch_size))
}

/// Snapshot answered to `GET`/`SET`; built on demand from the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamState {
    pub active: bool,
    #[serde(rename = "fs")]
    pub capture_rate: u32,
    #[serde(rename = "format")]
    pub sample_format: SampleFormat,
    #[serde(rename = "device_idx")]
    pub device_index: Option<usize>,
}

pub struct StreamController {
    config: StreamConfig,
    device: Mutex<Box<dyn CaptureDevice>>,
    params: Mutex<Option<OpenParameters>>,
    queue: DispatchQueue,
}

impl StreamController {
    pub fn new(config: StreamConfig, device: Box<dyn CaptureDevice>, queue: DispatchQueue) -> Self {
        Self {
            config,
            device: Mutex::new(device),
            params: Mutex::new(None),
            queue,
        }
    }

    pub fn report(&self) -> StreamState {
        let active = lock_or_recover(&self.device, "capture device").is_active();
        StreamState {
            active,
            capture_rate: self.config.capture_rate,
            sample_format: self.config.sample_format,
            device_index: self.config.device_index,
        }
    }

    /// Parameters of the stream most recently opened successfully.
    pub fn parameters(&self) -> Option<OpenParameters> {
        *lock_or_recover(&self.params, "open parameters")
    }

    /// Close any existing stream and open a new one at the requested cadence.
    ///
    /// Parameters are validated before the device is touched, so a rejected
    /// request leaves a running stream alone.
    pub fn open(&self, target_rate: u32, batch_size: u32) -> Result<OpenParameters> {
        let params = OpenParameters::new(self.config.capture_rate, target_rate, batch_size)?;
        let mut device = lock_or_recover(&self.device, "capture device");
        if device.is_active() {
            if let Err(err) = device.stop() {
                tracing::warn!("failed to stop previous stream: {err:#}");
            }
        }
        device.close();

        let request = OpenRequest {
            capture_rate: self.config.capture_rate,
            format: self.config.sample_format,
            frames_per_callback: params.frames_per_callback,
            device_index: self.config.device_index,
        };
        let callback = capture_callback(self.queue.producer(), self.config, target_rate);
        if let Err(err) = device.open(request, callback) {
            self.queue.notify_init_fail(&format!("{err:#}"));
            return Err(err.context("failed to open input stream"));
        }
        *lock_or_recover(&self.params, "open parameters") = Some(params);
        tracing::info!(
            "opened input stream: {}Hz {} -> {}Hz, {} frames per callback",
            self.config.capture_rate,
            self.config.sample_format.label(),
            target_rate,
            params.frames_per_callback
        );
        Ok(params)
    }

    /// Open with `(target_rate, batch_size)` and start capturing.
    pub fn reconfigure(&self, target_rate: u32, batch_size: u32) -> Result<OpenParameters> {
        let params = self.open(target_rate, batch_size)?;
        let mut device = lock_or_recover(&self.device, "capture device");
        if let Err(err) = device.start() {
            self.queue.notify_init_fail(&format!("{err:#}"));
            return Err(err.context("failed to start input stream"));
        }
        Ok(params)
    }

    /// Apply a `SET` token. Malformed tokens and device failures are logged
    /// and leave the previous configuration in effect.
    pub fn start(&self, token: &str) -> Option<OpenParameters> {
        let (target_rate, batch_size) = match parse_start_token(token) {
            Ok(fields) => fields,
            Err(err) => {
                tracing::warn!("ignoring start request {token:?}: {err:#}");
                return None;
            }
        };
        match self.reconfigure(target_rate, batch_size) {
            Ok(params) => Some(params),
            Err(err) => {
                tracing::warn!("start request {token:?} failed: {err:#}");
                None
            }
        }
    }

    /// Stop capturing (if running) and detach the current sink. Idempotent.
    pub fn stop(&self) {
        {
            let mut device = lock_or_recover(&self.device, "capture device");
            if device.is_active() {
                match device.stop() {
                    Ok(()) => tracing::info!("input stream stopped"),
                    Err(err) => tracing::warn!("failed to stop input stream: {err:#}"),
                }
            }
        }
        self.queue.accept(DataHandler::Discard);
    }

    /// Make `handler` the current sink, evicting any previous one.
    pub fn attach_sink(&self, handler: DataHandler) {
        tracing::debug!("attaching sink {}", handler.describe());
        self.queue.accept(handler);
    }

    pub fn detach_sink(&self) {
        self.queue.accept(DataHandler::Discard);
    }

    pub fn has_sink(&self) -> bool {
        self.queue.is_attached()
    }

    pub fn queue_stats(&self) -> QueueSnapshot {
        self.queue.stats()
    }

    /// Stop and release the device; used at process shutdown.
    pub fn close(&self) {
        self.stop();
        lock_or_recover(&self.device, "capture device").close();
    }
}

/// Build the driver callback: one batch per invocation, never blocking.
fn capture_callback(
    producer: BatchProducer,
    config: StreamConfig,
    target_rate: u32,
) -> CaptureCallback {
    Box::new(move |raw, frame_count, info| {
        producer.submit_with(|| {
            let mut batch = SampleBatch::new(
                raw.to_vec(),
                frame_count,
                config.sample_format,
                config.capture_rate,
                target_rate,
            );
            batch.timestamp = info.timestamp;
            batch.status = info.status;
            batch
        });
    })
}
