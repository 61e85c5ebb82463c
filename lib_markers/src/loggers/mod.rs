//! # Logging Setup
//!
//! One call wires `tracing` to two sinks: a human-readable console layer and a
//! plain-text file in the configured log directory, written through a
//! non-blocking `tracing-appender` worker. `RUST_LOG` wins over the configured
//! level when set.
//!
//! Each start opens a fresh timestamped file; older files beyond the
//! retention count are deleted first.

use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Log files kept from previous runs.
pub const KEEP_LOGS: usize = 1;

/// Failures while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggerError {
    /// The log directory could not be prepared.
    #[error("log directory error: {0}")]
    Io(#[from] std::io::Error),
    /// A global subscriber is already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Init(String),
}

/// Installs the global subscriber. Keep the returned guard alive for the
/// lifetime of the process, dropping it flushes and stops the file writer.
pub fn setup_logging(log_dir: &Path, log_level: &str, app_name: &str) -> Result<WorkerGuard, LoggerError> {
    fs::create_dir_all(log_dir)?;
    cleanup_old_logs(log_dir, KEEP_LOGS)?;

    let file_name = format!("{app_name}_{}.log", chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, file_name));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_directive(log_level)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()
        .map_err(|e| LoggerError::Init(e.to_string()))?;

    Ok(guard)
}

/// Maps a configured level name onto a filter directive. Unknown names fall
/// back to `info`.
pub fn level_directive(log_level: &str) -> &'static str {
    match log_level.trim().to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "fatal" => "error",
        _ => "info",
    }
}

/// Deletes all but the `keep` most recently modified `.log` files in
/// `log_dir`. Returns how many were removed.
pub fn cleanup_old_logs(log_dir: &Path, keep: usize) -> std::io::Result<usize> {
    let mut entries: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "log"))
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, e.path()))
        })
        .collect();

    // Newest first.
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (_, path) in entries.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            // No subscriber is installed yet at this point.
            Err(e) => eprintln!("Failed to delete old log file {}: {e}", path.display()),
        }
    }
    Ok(removed)
}
