//! Logging setup: console output plus an optional daily rolling log file.

use chrono::Local;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "streamer=info,streamer_cli=info,process_utils=info";

/// File name prefix of the rolling log file.
pub const LOG_FILE_PREFIX: &str = "streamer.log";

/// Formats timestamps in the local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    /// Everything at `debug`.
    pub verbose: bool,
    /// Errors only. Wins over `verbose`.
    pub quiet: bool,
    /// Also write a daily rolling log file here.
    pub log_dir: Option<PathBuf>,
}

impl LoggingOptions {
    fn filter(&self) -> EnvFilter {
        if self.quiet {
            EnvFilter::new("error")
        } else if self.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
        }
    }
}

/// Install the global subscriber.
///
/// When a log directory is configured the returned guard flushes the file
/// writer on drop; keep it alive for the lifetime of the program.
pub fn init_logging(options: &LoggingOptions) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::resource("creating log directory", dir, e))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(options.filter())
        .with(
            fmt::layer()
                .with_ansi(true)
                .with_timer(LocalTimer)
                .with_target(options.verbose),
        )
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {}", e)))?;

    Ok(guard)
}
