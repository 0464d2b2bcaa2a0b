//! Subscriber setup: compact events on stderr plus one plain-text log file per run.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// `log_<YYYYmmdd_HHMMSS>.log`, stamped with local time.
pub fn log_file_name(now: chrono::DateTime<chrono::Local>) -> String {
    format!("log_{}.log", now.format("%Y%m%d_%H%M%S"))
}

/// Stderr-only subscriber for the moments before the log directory is known,
/// such as reading the config file.
pub fn bootstrap() -> impl tracing::Subscriber + Send + Sync {
    tracing_subscriber::registry().with(env_filter()).with(stderr_layer())
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn stderr_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr)
}

/// Install the global subscriber. Keep the returned guard alive until exit
/// so buffered file output is flushed.
pub fn init(log_dir: &Path) -> Result<(WorkerGuard, PathBuf)> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let file_name = log_file_name(chrono::Local::now());
    let log_path = log_dir.join(&file_name);

    let appender = tracing_appender::rolling::never(log_dir, &file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr_layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok((guard, log_path))
}
