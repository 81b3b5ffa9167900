//! Installing a `tracing` subscriber for programs that use the logger.
//!
//! Library code only emits events; binaries and worker scripts call
//! [`init`] once at startup.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::error::{Result, RunLoggerError};

#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    /// Filter used when `RUST_LOG` is unset (default: "info")
    pub default_filter: String,
    /// Also write events to this file, appending
    pub file: Option<PathBuf>,
    /// Write the file as JSON objects rather than text
    pub json_file: bool,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            file: None,
            json_file: false,
        }
    }
}

impl DiagnosticsConfig {
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn with_json_file(mut self, json: bool) -> Self {
        self.json_file = json;
        self
    }
}

/// Install the global subscriber: compact events on stderr, plus the
/// optional file. Keep the returned guard alive until exit or buffered
/// file output is lost.
pub fn init(config: &DiagnosticsConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_filter))
        .map_err(|e| {
            RunLoggerError::Configuration(format!(
                "invalid log filter '{}': {e}",
                config.default_filter
            ))
        })?;

    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path.file_name().ok_or_else(|| {
                RunLoggerError::Configuration(format!("{} is not a file path", path.display()))
            })?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            let layer = if config.json_file {
                layer.json().boxed()
            } else {
                layer.boxed()
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file_layer)
        .try_init()
        .map_err(|e| RunLoggerError::Configuration(format!("tracing already initialised: {e}")))?;
    Ok(guard)
}
