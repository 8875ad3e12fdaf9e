//! Subscriber setup for the host application and for extension host processes.

use crate::config::{LogLevel, LoggingConfig};
use crate::paths::AppDirs;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::{fmt, EnvFilter};

/// Filter directives in this variable replace the configured level.
pub const LOG_ENV: &str = "EXTHOST_LOG";

const DEFAULT_LOG_STEM: &str = "exthost.log";

/// Flushes the background file writer when dropped; hold it for the life of `main`.
pub struct LoggingGuard {
    _file: WorkerGuard,
}

/// Installs the application subscriber: a daily-rolling file in the log
/// directory, mirrored to stderr when `console` is set.
pub fn init_logging(config: &LoggingConfig, dirs: &AppDirs) -> Result<LoggingGuard, LoggingError> {
    let log_dir = dirs.log_dir();
    fs::create_dir_all(log_dir).map_err(|source| LoggingError::LogDir {
        path: log_dir.to_path_buf(),
        source,
    })?;

    let stem = config.file_name.as_deref().unwrap_or(DEFAULT_LOG_STEM);
    prune_rotated_logs(log_dir, stem, config.max_log_files.max(1))?;

    let (file, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, stem));
    // stdout belongs to command output, so the console copy goes to stderr.
    let writer = if config.console {
        BoxMakeWriter::new(std::io::stderr.and(file))
    } else {
        BoxMakeWriter::new(file)
    };

    fmt()
        .with_env_filter(build_filter(config.level)?)
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .map_err(LoggingError::Install)?;

    tracing::debug!(dir = %log_dir.display(), file = stem, "Logging initialised");
    Ok(LoggingGuard { _file: guard })
}

/// Subscriber for extension host processes: stderr only, no files.
pub fn init_stderr_logging(level: LogLevel) -> Result<(), LoggingError> {
    fmt()
        .with_env_filter(build_filter(level)?)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(LoggingError::Install)
}

fn build_filter(level: LogLevel) -> Result<EnvFilter, LoggingError> {
    let directives = match std::env::var(LOG_ENV) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => level.as_filter_directive().to_string(),
    };
    EnvFilter::try_new(&directives).map_err(|source| LoggingError::Filter { directives, source })
}

/// Keeps the newest `keep` files named `<stem>*`. Daily rotation suffixes
/// sort chronologically, so name order is age order.
fn prune_rotated_logs(dir: &Path, stem: &str, keep: usize) -> Result<(), LoggingError> {
    let mut rotated: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|source| LoggingError::LogDir {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(stem))
        .map(|entry| entry.path())
        .collect();
    if rotated.len() <= keep {
        return Ok(());
    }

    rotated.sort();
    let excess = rotated.len() - keep;
    for path in rotated.into_iter().take(excess) {
        fs::remove_file(&path).map_err(|source| LoggingError::Prune { path, source })?;
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("log directory {path} is not usable: {source}")]
    LogDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid log filter '{directives}': {source}")]
    Filter {
        directives: String,
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("failed to install tracing subscriber: {0}")]
    Install(Box<dyn std::error::Error + Send + Sync>),
    #[error("failed to remove rotated log {path}: {source}")]
    Prune {
        path: PathBuf,
        source: std::io::Error,
    },
}
