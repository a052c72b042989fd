//! Command-line parsing, the optional YAML file, and validation helpers.

mod defaults;
mod validation;

use crate::audio::{FilterKind, SampleFormat, StreamConfig};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

pub use defaults::{DEFAULT_BIND_ADDR, DEFAULT_CAPTURE_RATE, DEFAULT_PORT, DEFAULT_QUEUE_CAPACITY};

/// CLI options for the bridge. Unset stream options fall back to the config
/// file, then to built-in defaults.
#[derive(Debug, Parser, Clone)]
#[command(
    name = "pcm-bridge",
    about = "Stream decimated audio input to a TCP client",
    author,
    version
)]
pub struct AppConfig {
    /// YAML config file (`port`, `interface.fs`, `interface.format`, `interface.device_idx`)
    #[arg(long = "config", env = "PCM_BRIDGE_CONFIG", value_name = "PATH")]
    pub config_path: Option<PathBuf>,

    /// TCP port to listen on [default: 19091]
    #[arg(long)]
    pub port: Option<u16>,

    /// Address to bind the listener to
    #[arg(long = "bind", default_value_t = DEFAULT_BIND_ADDR)]
    pub bind_addr: IpAddr,

    /// Native capture rate of the input device (Hz) [default: 48000]
    #[arg(long = "capture-rate")]
    pub capture_rate: Option<u32>,

    /// Capture sample format [default: int16]
    #[arg(long = "format", value_enum)]
    pub sample_format: Option<SampleFormat>,

    /// Input device index (see --list-input-devices); default device when unset
    #[arg(long = "device-index")]
    pub device_index: Option<usize>,

    /// Anti-aliasing filter used for decimation
    #[arg(long, value_enum, default_value_t = FilterKind::KaiserFast)]
    pub filter: FilterKind,

    /// Capacity of the capture -> worker hand-off queue (batches)
    #[arg(long = "queue-capacity", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Replace the input device with a generated sine tone at this frequency (Hz)
    #[arg(long = "synthetic-tone-hz", value_name = "HZ")]
    pub synthetic_tone_hz: Option<f32>,

    /// Print detected audio input devices and exit
    #[arg(long = "list-input-devices", default_value_t = false)]
    pub list_input_devices: bool,

    /// Maximum log level
    #[arg(
        long = "log-level",
        env = "PCM_BRIDGE_LOG_LEVEL",
        value_enum,
        default_value_t = LogLevel::Info
    )]
    pub log_level: LogLevel,

    /// Log line format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Append logs to this file instead of stderr
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Disable all logging (overrides --log-file and --log-level)
    #[arg(long = "no-logs", env = "PCM_BRIDGE_NO_LOGS", default_value_t = false)]
    pub no_logs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn label(self) -> &'static str {
        match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
        }
    }
}

/// On-disk configuration. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub port: Option<u16>,
    #[serde(default)]
    pub interface: InterfaceSection,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceSection {
    pub fs: Option<u32>,
    pub format: Option<SampleFormat>,
    pub device_idx: Option<usize>,
}

/// Fully resolved settings the bridge runs with.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub listen: SocketAddr,
    pub stream: StreamConfig,
    pub filter: FilterKind,
    pub queue_capacity: usize,
    pub synthetic_tone_hz: Option<f32>,
}
