//! Capture pipeline: device, hand-off queue, and decimation.
//!
//! The device driver calls back on its own thread with raw PCM. The callback
//! only copies the buffer into a [`SampleBatch`] and offers it to the
//! [`DispatchQueue`]; normalisation and resampling happen later on the
//! dispatch worker, inside whichever data handler is attached.

mod batch;
mod controller;
mod device;
mod dispatch;
mod pcm;
mod resample;
mod synthetic;

pub use batch::{DecimatedBatch, SampleBatch};
pub use controller::{
    parse_start_token, OpenParameters, StreamConfig, StreamController, StreamState,
    MAX_CALLBACK_SECONDS,
};
pub use device::{
    list_input_devices, CallbackInfo, CaptureCallback, CaptureDevice, CpalDevice, OpenRequest,
    STATUS_STREAM_ERROR,
};
pub use dispatch::{BatchProducer, DispatchQueue, QueueSnapshot};
pub use pcm::{encode_samples, normalize, SampleFormat};
pub use resample::{
    min_target_rate, output_len, Decimator, FilterKind, MAX_DEVICE_RATE, MIN_DEVICE_RATE,
};
pub use synthetic::{tone_buffer, SyntheticDevice, SyntheticHandle};
