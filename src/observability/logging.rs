use etl_core::{EtlError, Result};
use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::EngineSettings;

/// Initializes the logging system with both console and file output.
///
/// The returned guard must be held until exit so buffered file logs flush.
pub fn init_logging(settings: &EngineSettings) -> Result<WorkerGuard> {
    fs::create_dir_all(&settings.log_dir)?;

    // Non-blocking file appender with daily rotation
    let file_appender = tracing_appender::rolling::daily(&settings.log_dir, &settings.log_file);
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    // JSON layer for the log file
    let file_layer = fmt::layer().json().with_writer(non_blocking_writer);

    // Formatted layer for the console
    let console_layer = fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stdout);

    // Respect RUST_LOG if set; otherwise use the configured filter
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_filter))
        .map_err(|e| EtlError::Config(format!("Invalid log filter '{}': {}", settings.log_filter, e)))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| EtlError::Config(format!("Logging already initialized: {}", e)))?;

    Ok(guard)
}
