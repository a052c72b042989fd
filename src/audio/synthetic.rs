//! Hardware-free capture device.
//!
//! Either driven by hand through [`SyntheticHandle::emit`] (the caller plays
//! the driver thread), or left to generate a sine tone paced at the capture
//! rate so the bridge can run on a machine without a microphone.

use super::device::{CallbackInfo, CaptureCallback, CaptureDevice, OpenRequest};
use super::pcm::{encode_into, SampleFormat};
use crate::lock_or_recover;
use anyhow::{bail, Context, Result};
use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Default)]
struct SyntheticShared {
    callback: Mutex<Option<CaptureCallback>>,
    request: Mutex<Option<OpenRequest>>,
    active: AtomicBool,
    opens: AtomicUsize,
    emitted: AtomicU64,
}

/// Test/driver-side view of a [`SyntheticDevice`].
#[derive(Clone)]
pub struct SyntheticHandle {
    shared: Arc<SyntheticShared>,
}

impl SyntheticHandle {
    /// Deliver one buffer to the registered callback as the driver would.
    /// Returns `false` when the stream is not running.
    pub fn emit(&self, raw: &[u8], frame_count: usize) -> bool {
        self.emit_with_status(raw, frame_count, 0)
    }

    pub fn emit_with_status(&self, raw: &[u8], frame_count: usize, status: u32) -> bool {
        if !self.shared.active.load(Ordering::Acquire) {
            return false;
        }
        let mut callback = lock_or_recover(&self.shared.callback, "synthetic callback");
        match callback.as_mut() {
            Some(callback) => {
                callback(raw, frame_count, CallbackInfo::now(status));
                self.shared.emitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Parameters of the most recent successful open.
    pub fn last_request(&self) -> Option<OpenRequest> {
        *lock_or_recover(&self.shared.request, "synthetic request")
    }

    pub fn frames_per_callback(&self) -> Option<usize> {
        self.last_request().map(|request| request.frames_per_callback)
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::Relaxed)
    }

    pub fn emitted(&self) -> u64 {
        self.shared.emitted.load(Ordering::Relaxed)
    }
}

/// Capture device backed by a script or a generated tone.
pub struct SyntheticDevice {
    shared: Arc<SyntheticShared>,
    tone_hz: Option<f32>,
    tone_thread: Option<JoinHandle<()>>,
}

impl SyntheticDevice {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SyntheticShared::default()),
            tone_hz: None,
            tone_thread: None,
        }
    }

    /// Generate a continuous sine at `hz` (half scale) whenever the stream runs.
    pub fn with_tone(mut self, hz: f32) -> Self {
        self.tone_hz = Some(hz);
        self
    }

    pub fn handle(&self) -> SyntheticHandle {
        SyntheticHandle {
            shared: self.shared.clone(),
        }
    }

    fn join_tone(&mut self) {
        if let Some(thread) = self.tone_thread.take() {
            let _ = thread.join();
        }
    }

    fn spawn_tone(&mut self, hz: f32, request: OpenRequest) -> Result<()> {
        let handle = self.handle();
        let thread = thread::Builder::new()
            .name("synthetic-tone".to_string())
            .spawn(move || run_tone(handle, hz, request))
            .context("failed to spawn tone thread")?;
        self.tone_thread = Some(thread);
        Ok(())
    }
}

impl Default for SyntheticDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureDevice for SyntheticDevice {
    fn open(&mut self, request: OpenRequest, callback: CaptureCallback) -> Result<()> {
        self.close();
        if request.frames_per_callback == 0 {
            bail!("cannot open a stream with zero frames per callback");
        }
        *lock_or_recover(&self.shared.callback, "synthetic callback") = Some(callback);
        *lock_or_recover(&self.shared.request, "synthetic request") = Some(request);
        self.shared.opens.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let Some(request) = self.handle().last_request() else {
            bail!("no input stream is open");
        };
        if lock_or_recover(&self.shared.callback, "synthetic callback").is_none() {
            bail!("no input stream is open");
        }
        if self.shared.active.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(hz) = self.tone_hz {
            self.join_tone();
            self.spawn_tone(hz, request)?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.shared.active.store(false, Ordering::Release);
        self.join_tone();
        Ok(())
    }

    fn close(&mut self) {
        self.shared.active.store(false, Ordering::Release);
        self.join_tone();
        lock_or_recover(&self.shared.callback, "synthetic callback").take();
    }

    fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_tone(handle: SyntheticHandle, hz: f32, request: OpenRequest) {
    let frames = request.frames_per_callback.max(1);
    let rate = request.capture_rate.max(1);
    let period = Duration::from_secs_f64(frames as f64 / f64::from(rate));
    let step = 2.0 * PI * hz / rate as f32;
    let mut phase = 0.0f32;
    let mut samples = Vec::with_capacity(frames);
    let mut raw = Vec::with_capacity(frames * request.format.bytes_per_sample());

    while handle.is_active() {
        samples.clear();
        for _ in 0..frames {
            samples.push(0.5 * phase.sin());
            phase = (phase + step) % (2.0 * PI);
        }
        raw.clear();
        encode_into(&mut raw, &samples, request.format);
        handle.emit(&raw, frames);
        thread::sleep(period);
    }
}

/// Build a packed buffer of `frames` samples of a sine wave, for scripted emits.
pub fn tone_buffer(
    hz: f32,
    capture_rate: u32,
    frames: usize,
    amplitude: f32,
    format: SampleFormat,
) -> Vec<u8> {
    let samples: Vec<f32> = (0..frames)
        .map(|i| amplitude * (2.0 * PI * hz * i as f32 / capture_rate as f32).sin())
        .collect();
    let mut raw = Vec::with_capacity(frames * format.bytes_per_sample());
    encode_into(&mut raw, &samples, format);
    raw
}
