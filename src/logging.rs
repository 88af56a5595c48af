//! Structured logging bootstrap.
//!
//! Generalizes `goose-conductor::log_manager::LogManager`: a JSON file
//! layer (daily-rotated, non-blocking) plus a human-readable stderr layer,
//! gated by `EnvFilter`. Library code never calls [`init`] implicitly —
//! only a consuming binary (or a test that wants log output) does, the
//! same division of responsibility the teacher draws between
//! `goose-conductor::main` and its library modules.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogConfig;

/// Holds the non-blocking writer's flush guard. Drop only at process exit.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Initialize the global tracing subscriber from the given config.
///
/// Returns an error if the log directory cannot be created or the
/// subscriber has already been installed (tracing only allows one global
/// default, as `goose-conductor`'s `LogManager::init` also assumes).
pub fn init(config: &LogConfig) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(&config.dir)?;

    let file_appender = tracing_appender::rolling::daily(&config.dir, "aidos-core.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(non_blocking);

    let stderr_layer = fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_ansi(true);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,aidos_core=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))?;

    tracing::info!(log_dir = %config.dir.display(), "logging initialised");

    prune_old_logs(&config.dir, config.max_files);

    Ok(LoggingGuard { _guard: guard })
}

/// Best-effort pruning of rotated log files beyond `max_files`, mirroring
/// `goose-conductor::log_manager::prune_old_logs`.
pub fn prune_old_logs(dir: &std::path::Path, max_files: usize) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    let mut logs: Vec<_> = entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .file_name()
                .map(|n| n.to_string_lossy().starts_with("aidos-core.log"))
                .unwrap_or(false)
        })
        .collect();

    logs.sort_by(|a, b| {
        let ta = a.metadata().and_then(|m| m.modified()).ok();
        let tb = b.metadata().and_then(|m| m.modified()).ok();
        tb.cmp(&ta)
    });

    for old in logs.into_iter().skip(max_files) {
        let path = old.path();
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to prune old log");
        }
    }
}
