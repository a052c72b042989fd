//! Live audio capture bridged to a TCP client as decimated text frames.
//!
//! The [`audio`] pipeline captures PCM from an input device and hands each
//! driver buffer to a single dispatch worker. The [`server`] accepts clients,
//! attaches the newest one as the data [`sink`], and lets it reconfigure the
//! stream with `SET` and query it with `GET`.

pub mod audio;
pub mod config;
mod lock;
pub mod server;
pub mod sink;
pub mod telemetry;

pub(crate) use lock::lock_or_recover;
