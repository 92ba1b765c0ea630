//! Tracing subscribers for the agent.
//!
//! `monitor` runs for a long time, so it keeps a daily-rotated JSON record
//! under the runtime logs directory as well as console output. The one-shot
//! subcommands only log to stderr because stdout carries their results.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Rolling files are named `devops-agent.log.YYYY-MM-DD`.
const LOG_FILE_PREFIX: &str = "devops-agent.log";

/// Level used when `RUST_LOG` is unset or unparseable.
const DEFAULT_LEVEL: &str = "info";

/// Keeps the background log writer running. Pending JSON records are
/// flushed when it is dropped, so `main` holds it until exit.
pub struct LoggingGuard {
    _writer: WorkerGuard,
}

/// Install the monitor's subscriber: JSON records to a daily file in
/// `logs_dir` plus console output on stderr.
///
/// # Errors
///
/// Fails if `logs_dir` cannot be created or a global subscriber is already
/// installed.
pub fn init_daemon(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX));

    tracing_subscriber::registry()
        .with(level_filter())
        .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("tracing subscriber already installed")?;

    Ok(LoggingGuard { _writer: guard })
}

/// Install a stderr-only subscriber for one-shot subcommands. A subscriber
/// that is already installed is left in place.
pub fn init_cli() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(level_filter())
        .with_writer(std::io::stderr)
        .try_init();
}

fn level_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))
}
