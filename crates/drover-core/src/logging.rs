//! Tracing bootstrap.
//!
//! Log output goes to a non-blocking file appender so the embedding
//! application keeps stdout/stderr to itself. The returned guard must
//! be held for the process lifetime or buffered lines are lost.

use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Environment variable controlling the log filter (standard
/// `tracing_subscriber` directive syntax).
pub const LOG_FILTER_ENV: &str = "DROVER_LOG";

/// Initializes the global subscriber with a daily-rolling file
/// appender in `dir`.
pub fn init(dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::daily(dir, "drover.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(guard)
}
