use super::defaults::{
    DEFAULT_CAPTURE_RATE, DEFAULT_PORT, MAX_CONFIG_FILE_BYTES, MAX_QUEUE_CAPACITY,
    MIN_QUEUE_CAPACITY,
};
use super::{AppConfig, BridgeConfig, FileConfig};
use crate::audio::{SampleFormat, StreamConfig, MAX_DEVICE_RATE, MIN_DEVICE_RATE};
use anyhow::{bail, Context, Result};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

impl AppConfig {
    /// Range-check CLI values that do not depend on the config file.
    pub fn validate(&mut self) -> Result<()> {
        if !(MIN_QUEUE_CAPACITY..=MAX_QUEUE_CAPACITY).contains(&self.queue_capacity) {
            bail!(
                "--queue-capacity must be between {MIN_QUEUE_CAPACITY} and {MAX_QUEUE_CAPACITY}, got {}",
                self.queue_capacity
            );
        }
        if let Some(rate) = self.capture_rate {
            check_capture_rate(rate).context("invalid --capture-rate")?;
        }
        if let Some(hz) = self.synthetic_tone_hz {
            if !hz.is_finite() || hz <= 0.0 {
                bail!("--synthetic-tone-hz must be a positive frequency, got {hz}");
            }
        }
        if let Some(path) = &self.log_file {
            if path.as_os_str().is_empty() {
                bail!("--log-file must not be empty");
            }
        }
        Ok(())
    }

    /// Merge CLI values over the config file (if any) and built-in defaults.
    pub fn resolve(&self) -> Result<BridgeConfig> {
        let file = match &self.config_path {
            Some(path) => load_config_file(path)?,
            None => FileConfig::default(),
        };
        self.resolve_with(&file)
    }

    pub(super) fn resolve_with(&self, file: &FileConfig) -> Result<BridgeConfig> {
        let port = self.port.or(file.port).unwrap_or(DEFAULT_PORT);
        let capture_rate = self
            .capture_rate
            .or(file.interface.fs)
            .unwrap_or(DEFAULT_CAPTURE_RATE);
        check_capture_rate(capture_rate)?;
        let sample_format = self
            .sample_format
            .or(file.interface.format)
            .unwrap_or(SampleFormat::Int16);
        let device_index = self.device_index.or(file.interface.device_idx);

        Ok(BridgeConfig {
            listen: SocketAddr::new(self.bind_addr, port),
            stream: StreamConfig {
                capture_rate,
                sample_format,
                device_index,
            },
            filter: self.filter,
            queue_capacity: self.queue_capacity,
            synthetic_tone_hz: self.synthetic_tone_hz,
        })
    }
}

fn check_capture_rate(rate: u32) -> Result<()> {
    if !(MIN_DEVICE_RATE..=MAX_DEVICE_RATE).contains(&rate) {
        bail!("capture rate must be between {MIN_DEVICE_RATE} and {MAX_DEVICE_RATE} Hz, got {rate}");
    }
    Ok(())
}

/// Read and parse a YAML config file.
pub(super) fn load_config_file(path: &Path) -> Result<FileConfig> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("config file {} is not readable", path.display()))?;
    if !metadata.is_file() {
        bail!("config path {} is not a file", path.display());
    }
    if metadata.len() > MAX_CONFIG_FILE_BYTES {
        bail!(
            "config file {} exceeds {MAX_CONFIG_FILE_BYTES} bytes",
            path.display()
        );
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse_config(&text).with_context(|| format!("invalid config file {}", path.display()))
}

pub(super) fn parse_config(text: &str) -> Result<FileConfig> {
    if text.trim().is_empty() {
        return Ok(FileConfig::default());
    }
    let config: FileConfig = serde_yaml::from_str(text)?;
    Ok(config)
}
