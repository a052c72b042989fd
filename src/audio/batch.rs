use super::pcm::SampleFormat;
use std::time::Instant;

/// One capture callback's worth of raw PCM.
///
/// Built in the capture context and consumed exactly once by the dispatch
/// worker. It carries the rates it was captured for, so a reconfiguration that
/// races with in-flight batches never decimates them with the wrong ratio.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    pub raw_bytes: Vec<u8>,
    pub frame_count: usize,
    pub timestamp: Instant,
    /// Driver status bits observed since the previous callback (0 = clean).
    pub status: u32,
    pub divisor: f32,
    pub format: SampleFormat,
    pub capture_rate: u32,
    pub target_rate: u32,
}

impl SampleBatch {
    pub fn new(
        raw_bytes: Vec<u8>,
        frame_count: usize,
        format: SampleFormat,
        capture_rate: u32,
        target_rate: u32,
    ) -> Self {
        Self {
            raw_bytes,
            frame_count,
            timestamp: Instant::now(),
            status: 0,
            divisor: format.divisor(),
            format,
            capture_rate,
            target_rate,
        }
    }
}

/// Samples at the target rate produced from one [`SampleBatch`].
pub type DecimatedBatch = Vec<f32>;
