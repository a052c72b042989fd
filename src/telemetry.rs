use crate::config::{AppConfig, LogFormat};
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::panic;
use std::sync::{Mutex, OnceLock};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Install the global subscriber once. Later calls are no-ops.
pub fn init_tracing(config: &AppConfig) -> Result<()> {
    if config.no_logs || TRACING_INIT.get().is_some() {
        return Ok(());
    }

    let writer = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_max_level(config.log_level.as_level())
        .with_timer(UtcTime::rfc_3339())
        .with_thread_names(true)
        .with_ansi(false)
        .with_writer(writer);
    let installed = match config.log_format {
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish()),
        LogFormat::Json => tracing::subscriber::set_global_default(
            builder
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .finish(),
        ),
    };
    if installed.is_ok() {
        let _ = TRACING_INIT.set(());
    }
    Ok(())
}

/// Route panics through tracing before the default hook prints them.
pub fn install_panic_hook() {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        log_panic(info);
        previous(info);
    }));
}

fn log_panic(info: &panic::PanicHookInfo<'_>) {
    let location = info
        .location()
        .map(|loc| format!("{}:{}", loc.file(), loc.line()))
        .unwrap_or_else(|| "unknown".to_string());
    let payload = if let Some(text) = info.payload().downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = info.payload().downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    };
    let thread = std::thread::current();
    tracing::error!(
        "panic in thread {} at {location}: {payload} (v{})",
        thread.name().unwrap_or("unnamed"),
        env!("CARGO_PKG_VERSION")
    );
}
