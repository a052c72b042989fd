//! Bridge entrypoint: capture from an input device, decimate, and serve one
//! TCP client at a time.
//!
//! # Threads
//!
//! - Device driver callback: copies each buffer into the dispatch queue
//! - Dispatch worker: decimates batches for the attached client
//! - Listener: accepts clients; each gets a reader and a writer thread

mod cli_utils;

use anyhow::Result;
use clap::Parser;
use pcm_bridge::audio::{
    CaptureDevice, CpalDevice, Decimator, DispatchQueue, StreamController, SyntheticDevice,
};
use pcm_bridge::config::{AppConfig, BridgeConfig};
use pcm_bridge::server::Server;
use pcm_bridge::telemetry::{init_tracing, install_panic_hook};
use std::sync::Arc;

use crate::cli_utils::list_input_devices;

fn main() -> Result<()> {
    let mut config = AppConfig::parse();
    if config.list_input_devices {
        list_input_devices()?;
        return Ok(());
    }

    config.validate()?;
    init_tracing(&config)?;
    install_panic_hook();
    let bridge = config.resolve()?;
    tracing::info!(
        "pcm-bridge v{} starting: {}Hz {} on device {}, filter {}, log format {}",
        env!("CARGO_PKG_VERSION"),
        bridge.stream.capture_rate,
        bridge.stream.sample_format.label(),
        bridge
            .stream
            .device_index
            .map(|index| index.to_string())
            .unwrap_or_else(|| "default".to_string()),
        bridge.filter.label(),
        config.log_format.label()
    );
    run(bridge)
}

fn run(bridge: BridgeConfig) -> Result<()> {
    let decimator = Arc::new(Decimator::new(bridge.filter));
    let queue = DispatchQueue::spawn(bridge.queue_capacity)?;
    let device: Box<dyn CaptureDevice> = match bridge.synthetic_tone_hz {
        Some(hz) => {
            tracing::info!("using synthetic {hz}Hz tone instead of an input device");
            Box::new(SyntheticDevice::new().with_tone(hz))
        }
        None => Box::new(CpalDevice::new()?),
    };
    let controller = Arc::new(StreamController::new(bridge.stream, device, queue));
    let server = Server::bind(bridge.listen, controller.clone(), decimator)?;
    let result = server.serve();
    controller.close();
    result
}
