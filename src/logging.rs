//! Structured logging: console plus a daily-rolling file under the data dir.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Rolled log files kept on disk.
pub const MAX_LOG_FILES: usize = 14;
pub const LOG_FILE_PREFIX: &str = "sync";
const DEFAULT_FILTER: &str = "info,the_small_sync_lib=debug";

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
/// With `json` the console layer emits one JSON object per line. The
/// returned guard flushes the file writer when dropped and must live until
/// exit.
pub fn init(log_dir: &Path, json: bool) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    fs::create_dir_all(log_dir).ok();
    let pruned = prune_old_logs(log_dir, MAX_LOG_FILES);

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = if json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    // A second init (tests, embedding hosts) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    if pruned > 0 {
        tracing::debug!(pruned, "Old log files removed");
    }
    guard
}

/// Delete rolled log files beyond `keep`, newest kept. Returns the number
/// removed.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, SystemTime)> = entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(&format!("{LOG_FILE_PREFIX}.")))
        })
        .filter(|entry| entry.path().is_file())
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    // Newest first; same mtime falls back to the dated file name.
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}
