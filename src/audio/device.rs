//! Capture device capability and its cpal-backed implementation.
//!
//! The stream controller only talks to [`CaptureDevice`]; the driver binding
//! lives behind it so tests can substitute a scripted device. cpal streams are
//! not `Send`, so [`CpalDevice`] owns its stream on a dedicated thread and
//! serializes open/start/stop/close through a command channel. A command
//! returns only after the driver call completes, so a stop always finishes
//! before the next open touches the device.

use super::pcm::{encode_into, SampleFormat};
use crate::lock_or_recover;
use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use crossbeam_channel::{bounded, unbounded, Sender};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Status bit raised when the driver reported a stream error since the last callback.
pub const STATUS_STREAM_ERROR: u32 = 0x1;

/// Per-invocation metadata handed to the capture callback.
#[derive(Debug, Clone, Copy)]
pub struct CallbackInfo {
    pub timestamp: Instant,
    pub status: u32,
}

impl CallbackInfo {
    pub fn now(status: u32) -> Self {
        Self {
            timestamp: Instant::now(),
            status,
        }
    }
}

/// Invoked on the driver's real-time context with one packed buffer of
/// `frame_count` mono frames. Streaming always continues after it returns.
pub type CaptureCallback = Box<dyn FnMut(&[u8], usize, CallbackInfo) + Send + 'static>;

/// Everything the driver needs to open an input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenRequest {
    pub capture_rate: u32,
    pub format: SampleFormat,
    pub frames_per_callback: usize,
    pub device_index: Option<usize>,
}

/// Capability surface of an audio input device.
pub trait CaptureDevice: Send {
    /// Open an input stream that delivers buffers to `callback`. Any stream
    /// previously opened on this device is closed first.
    fn open(&mut self, request: OpenRequest, callback: CaptureCallback) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn close(&mut self);
    fn is_active(&self) -> bool;
}

/// Enumerate cpal input devices as `(index, name)` pairs.
pub fn list_input_devices() -> Result<Vec<(usize, String)>> {
    let host = cpal::default_host();
    let devices = host.input_devices().context("no input devices available")?;
    let mut names = Vec::new();
    for (index, device) in devices.enumerate() {
        let name = device
            .name()
            .unwrap_or_else(|_| "Unknown Device".to_string());
        names.push((index, name));
    }
    Ok(names)
}

enum DeviceCommand {
    Open {
        request: OpenRequest,
        callback: CaptureCallback,
        reply: Sender<Result<()>>,
    },
    Start {
        reply: Sender<Result<()>>,
    },
    Stop {
        reply: Sender<Result<()>>,
    },
    Close {
        reply: Sender<Result<()>>,
    },
}

/// Input device bound through cpal's default host.
pub struct CpalDevice {
    commands: Option<Sender<DeviceCommand>>,
    active: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CpalDevice {
    pub fn new() -> Result<Self> {
        let (commands, rx) = unbounded::<DeviceCommand>();
        let active = Arc::new(AtomicBool::new(false));
        let thread_active = active.clone();
        let worker = thread::Builder::new()
            .name("cpal-device".to_string())
            .spawn(move || {
                let mut owner = StreamOwner {
                    stream: None,
                    active: thread_active,
                };
                for command in rx.iter() {
                    owner.handle(command);
                }
                owner.close();
            })
            .context("failed to spawn device thread")?;
        Ok(Self {
            commands: Some(commands),
            active,
            worker: Some(worker),
        })
    }

    fn call(&self, make: impl FnOnce(Sender<Result<()>>) -> DeviceCommand) -> Result<()> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| anyhow!("device thread already shut down"))?;
        let (reply, response) = bounded(1);
        commands
            .send(make(reply))
            .map_err(|_| anyhow!("device thread is gone"))?;
        response
            .recv()
            .map_err(|_| anyhow!("device thread dropped the reply"))?
    }
}

impl CaptureDevice for CpalDevice {
    fn open(&mut self, request: OpenRequest, callback: CaptureCallback) -> Result<()> {
        self.call(|reply| DeviceCommand::Open {
            request,
            callback,
            reply,
        })
    }

    fn start(&mut self) -> Result<()> {
        self.call(|reply| DeviceCommand::Start { reply })
    }

    fn stop(&mut self) -> Result<()> {
        self.call(|reply| DeviceCommand::Stop { reply })
    }

    fn close(&mut self) {
        if let Err(err) = self.call(|reply| DeviceCommand::Close { reply }) {
            tracing::warn!("failed to close input stream: {err:#}");
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        // Dropping the sender ends the device thread's command loop.
        self.commands.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Lives on the device thread and owns the (non-`Send`) cpal stream.
struct StreamOwner {
    stream: Option<cpal::Stream>,
    active: Arc<AtomicBool>,
}

impl StreamOwner {
    fn handle(&mut self, command: DeviceCommand) {
        match command {
            DeviceCommand::Open {
                request,
                callback,
                reply,
            } => {
                self.close();
                let result = build_stream(request, callback).map(|stream| {
                    self.stream = Some(stream);
                });
                let _ = reply.send(result);
            }
            DeviceCommand::Start { reply } => {
                let result = match self.stream.as_ref() {
                    Some(stream) => stream
                        .play()
                        .map(|_| self.active.store(true, Ordering::Release))
                        .map_err(|err| anyhow!("failed to start input stream: {err}")),
                    None => Err(anyhow!("no input stream is open")),
                };
                let _ = reply.send(result);
            }
            DeviceCommand::Stop { reply } => {
                let result = match self.stream.as_ref() {
                    Some(stream) => stream
                        .pause()
                        .map_err(|err| anyhow!("failed to pause input stream: {err}")),
                    None => Ok(()),
                };
                self.active.store(false, Ordering::Release);
                let _ = reply.send(result);
            }
            DeviceCommand::Close { reply } => {
                self.close();
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn close(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(stream) = self.stream.take() {
            if let Err(err) = stream.pause() {
                tracing::debug!("failed to pause input stream before close: {err}");
            }
            drop(stream);
        }
    }
}

/// Re-chunks driver buffers into packed buffers of exactly `frames` mono frames.
pub(super) struct CallbackPump {
    frames: usize,
    format: SampleFormat,
    channels: usize,
    pending: Vec<u8>,
    scratch: Vec<f32>,
    status: Arc<AtomicU32>,
    callback: CaptureCallback,
}

impl CallbackPump {
    pub(super) fn new(
        frames: usize,
        format: SampleFormat,
        status: Arc<AtomicU32>,
        callback: CaptureCallback,
    ) -> Self {
        let frames = frames.max(1);
        Self {
            frames,
            format,
            channels: 1,
            pending: Vec::with_capacity(frames * format.bytes_per_sample() * 2),
            scratch: Vec::new(),
            status,
            callback,
        }
    }

    pub(super) fn set_channels(&mut self, channels: usize) {
        self.channels = channels.max(1);
        self.pending.clear();
    }

    /// Pack mono samples directly, or downmix to mono first.
    pub(super) fn push<T, C, P>(&mut self, data: &[T], mut to_unit: C, mut pack: P)
    where
        T: Copy,
        C: FnMut(T) -> f32,
        P: FnMut(&mut Vec<u8>, T),
    {
        if self.channels == 1 {
            for sample in data.iter().copied() {
                pack(&mut self.pending, sample);
            }
        } else {
            self.scratch.clear();
            // Average each interleaved frame; a short trailing frame averages what it has.
            self.scratch.extend(data.chunks(self.channels).map(|frame| {
                frame.iter().copied().map(&mut to_unit).sum::<f32>() / frame.len() as f32
            }));
            encode_into(&mut self.pending, &self.scratch, self.format);
        }
        self.flush();
    }

    fn flush(&mut self) {
        let chunk_bytes = self.frames * self.format.bytes_per_sample();
        while self.pending.len() >= chunk_bytes {
            let status = self.status.swap(0, Ordering::AcqRel);
            (self.callback)(
                &self.pending[..chunk_bytes],
                self.frames,
                CallbackInfo::now(status),
            );
            self.pending.drain(..chunk_bytes);
        }
    }
}

fn resolve_device(index: Option<usize>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match index {
        Some(index) => {
            let mut devices = host.input_devices().context("no input devices available")?;
            devices
                .nth(index)
                .ok_or_else(|| anyhow!("input device {index} not found"))
        }
        None => host
            .default_input_device()
            .context("no default input device available"),
    }
}

fn build_stream(request: OpenRequest, callback: CaptureCallback) -> Result<cpal::Stream> {
    let device = resolve_device(request.device_index)?;
    let native_channels = device
        .default_input_config()
        .map(|cfg| cfg.channels().max(1))
        .unwrap_or(1);
    let status = Arc::new(AtomicU32::new(0));
    let pump = Arc::new(Mutex::new(CallbackPump::new(
        request.frames_per_callback,
        request.format,
        status.clone(),
        callback,
    )));

    let fixed = u32::try_from(request.frames_per_callback).unwrap_or(u32::MAX);
    let mut attempts = vec![
        (1u16, BufferSize::Fixed(fixed)),
        (1u16, BufferSize::Default),
    ];
    if native_channels > 1 {
        attempts.push((native_channels, BufferSize::Default));
    }

    let mut last_err = None;
    for (channels, buffer_size) in attempts {
        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(request.capture_rate),
            buffer_size,
        };
        lock_or_recover(&pump, "capture pump").set_channels(usize::from(channels));
        match build_typed_stream(&device, &config, request.format, pump.clone(), status.clone()) {
            Ok(stream) => {
                tracing::info!(
                    "Input stream built [channels: {channels}, buffer: {buffer_size:?}, rate: {}Hz, format: {}]",
                    request.capture_rate,
                    request.format.label()
                );
                return Ok(stream);
            }
            Err(err) => {
                tracing::debug!(
                    "input stream rejected [channels: {channels}, buffer: {buffer_size:?}]: {err:#}"
                );
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("no stream configuration attempted")))
}

fn build_typed_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    format: SampleFormat,
    pump: Arc<Mutex<CallbackPump>>,
    status: Arc<AtomicU32>,
) -> Result<cpal::Stream> {
    let err_fn = move |err| {
        status.fetch_or(STATUS_STREAM_ERROR, Ordering::AcqRel);
        tracing::warn!("audio_stream_error: {err}");
    };

    // try_lock keeps the driver thread from ever waiting on the pump; a
    // contended callback can only happen while the stream is being rebuilt.
    let stream = match format {
        SampleFormat::Int16 => device.build_input_stream(
            config,
            move |data: &[i16], _| {
                if let Ok(mut pump) = pump.try_lock() {
                    pump.push(
                        data,
                        |sample| sample as f32 / 32_768.0,
                        |buf, sample| buf.extend_from_slice(&sample.to_le_bytes()),
                    );
                }
            },
            err_fn,
            None,
        )?,
        // 24-bit capture is opened as i32 and packed down to three bytes.
        SampleFormat::Int24 => device.build_input_stream(
            config,
            move |data: &[i32], _| {
                if let Ok(mut pump) = pump.try_lock() {
                    pump.push(
                        data,
                        |sample| sample as f32 / 2_147_483_648.0,
                        |buf, sample| buf.extend_from_slice(&(sample >> 8).to_le_bytes()[..3]),
                    );
                }
            },
            err_fn,
            None,
        )?,
        SampleFormat::Float32 => device.build_input_stream(
            config,
            move |data: &[f32], _| {
                if let Ok(mut pump) = pump.try_lock() {
                    pump.push(
                        data,
                        |sample| sample,
                        |buf, sample| buf.extend_from_slice(&sample.to_le_bytes()),
                    );
                }
            },
            err_fn,
            None,
        )?,
    };
    Ok(stream)
}
