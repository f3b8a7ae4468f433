//! Process-wide log sinks: console plus a daily rolling file.

use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::LogConfig;
use crate::error::{Error, Result};

/// Install the global subscriber.
///
/// The console honors `RUST_LOG`, falling back to `console_level`. The file
/// only receives events at `file_level` or above. Keep the returned guard
/// alive for the process lifetime so buffered lines are flushed.
pub fn init(config: &LogConfig) -> Result<WorkerGuard> {
    let file_level: LevelFilter = config
        .file_level
        .parse()
        .map_err(|_| Error::config(format!("invalid file_level {:?}", config.file_level)))?;

    let console_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.console_level))
        .map_err(|e| Error::config(format!("invalid console_level: {}", e)))?;

    let appender = tracing_appender::rolling::daily(&config.directory, &config.file_prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_filter(console_filter),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(file_level),
        )
        .try_init()
        .map_err(|e| Error::config(format!("logging already initialized: {}", e)))?;

    Ok(guard)
}
