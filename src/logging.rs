//! Process logging.
//!
//! Two layers on one registry: a compact console layer on stderr, and a JSON
//! layer writing daily-rolled `buildpilot.<date>.jsonl` files under the
//! artifact root's `logs/` directory. `BUILDPILOT_LOG` takes an `EnvFilter`
//! directive and governs both layers when set.

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub const LOG_ENV: &str = "BUILDPILOT_LOG";
const LOG_PREFIX: &str = "buildpilot";

/// Keeps the background file writer alive; drop it last.
pub struct LoggingGuard {
    _file: WorkerGuard,
}

fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Install the global subscriber. Safe to call more than once; later calls
/// keep the first subscriber.
pub fn init_logging(logs_dir: &Path, verbose: bool) -> Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("Failed to create log directory: {}", logs_dir.display()))?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(LOG_PREFIX)
        .filename_suffix("jsonl")
        .build(logs_dir)
        .context("Failed to create rolling log appender")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false)
        .with_filter(env_filter("info"));

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .with_filter(env_filter(if verbose { "debug" } else { "warn" }));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .ok();

    Ok(LoggingGuard { _file: guard })
}
