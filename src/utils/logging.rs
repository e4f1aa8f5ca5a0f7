//! # Logging Setup
//!
//! Installs a `tracing-subscriber` stack from [`LoggingConfig`]: plain or
//! JSON formatting, to stderr and/or a file. `RUST_LOG` overrides the
//! configured level when set.
//!
//! File output goes through a `tracing-appender` background writer, so the
//! scheduler workers never block on disk. Keep the returned guard alive for
//! as long as the process logs; dropping it flushes what is still queued.

use std::path::Path;

use tracing::{info, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn level_directive(level: Level) -> &'static str {
    match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
}

fn output_layer<W>(json: bool, ansi: bool, writer: W) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_ansi(ansi);
    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

/// Open the non-blocking writer for `path`, creating parent directories.
fn file_writer(path: &str) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let path = Path::new(path);
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| ProtocolError::ConfigError(format!("log_file_path '{}' names no file", path.display())))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .map_err(|e| ProtocolError::ConfigError(format!("Failed to create log directory: {e}")))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(dir)
        .map_err(|e| ProtocolError::ConfigError(format!("Failed to open log file: {e}")))?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Install the global subscriber.
///
/// Returns the file writer's guard when file logging is on.
///
/// # Errors
/// `ConfigError` when the log file cannot be opened or a global subscriber
/// is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(config.log_level)));

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if config.log_to_console {
        layers.push(output_layer(config.json_format, true, std::io::stderr));
    }
    let mut guard = None;
    if config.log_to_file {
        let path = config.log_file_path.as_deref().ok_or_else(|| {
            ProtocolError::ConfigError("log_file_path must be set for file logging".into())
        })?;
        let (writer, file_guard) = file_writer(path)?;
        layers.push(output_layer(config.json_format, false, writer));
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| ProtocolError::ConfigError(format!("Failed to install subscriber: {e}")))?;

    info!(app = %config.app_name, level = level_directive(config.log_level), "Logging initialized");
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_path_rejected() {
        let config = LoggingConfig {
            log_to_file: true,
            log_file_path: None,
            ..LoggingConfig::default()
        };
        assert!(matches!(
            init_logging(&config),
            Err(ProtocolError::ConfigError(_))
        ));
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn test_file_writer_creates_log_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("nested").join("peer.log");
        let path = path.to_str().expect("utf-8 path");

        let (_writer, guard) = file_writer(path).expect("writer");
        assert!(Path::new(path).exists());
        drop(guard);
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn test_file_logging_returns_guard() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("logs").join("peer.log");
        let config = LoggingConfig {
            log_to_console: false,
            log_to_file: true,
            log_file_path: Some(path.to_string_lossy().into_owned()),
            ..LoggingConfig::default()
        };

        // Another test in this process may already own the global subscriber.
        match init_logging(&config) {
            Ok(guard) => assert!(guard.is_some()),
            Err(ProtocolError::ConfigError(msg)) => assert!(msg.contains("subscriber"), "{msg}"),
            Err(other) => panic!("unexpected error {other:?}"),
        }
        assert!(path.exists());
    }

    #[test]
    fn test_path_without_file_name_rejected() {
        assert!(matches!(
            file_writer(".."),
            Err(ProtocolError::ConfigError(_))
        ));
    }
}
