//! Per-run trace log for savesync
//!
//! Every run writes `{temp_dir}/savesync-logs/savesync-{run_id}.log` at trace
//! level for our own crates, while the console only shows warnings (debug
//! with `--verbose`). Only the newest [`KEEP_LOGS`] files are kept.

use std::path::{Path, PathBuf};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer as _;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::progress;

const LOG_PREFIX: &str = "savesync-";
const KEEP_LOGS: usize = 20;
const FILE_DIRECTIVES: &str = "warn,savesync=trace,savesync_core=trace,savesync_transport=trace";

/// Logging for one run; dropping it flushes the file writer
pub struct RunLog {
    pub log_path: PathBuf,
    _flush: tracing_appender::non_blocking::WorkerGuard,
}

fn log_dir() -> PathBuf {
    std::env::temp_dir().join("savesync-logs")
}

/// Console verbosity for the `--verbose` flag
fn console_level(verbose: bool) -> LevelFilter {
    if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    }
}

/// File filter: `RUST_LOG` if set and valid, otherwise trace for our crates
fn file_filter(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(FILE_DIRECTIVES))
}

/// Delete all but the newest `keep` run logs in `dir`; returns how many went
fn prune_logs(dir: &Path, keep: usize) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };

    let mut logs: Vec<(std::time::SystemTime, PathBuf)> = entries
        .filter_map(Result::ok)
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.starts_with(LOG_PREFIX) && name.ends_with(".log")
        })
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, e.path()))
        })
        .collect();
    if logs.len() <= keep {
        return 0;
    }

    logs.sort_by(|a, b| b.0.cmp(&a.0));
    logs.drain(keep..)
        .filter(|(_, path)| std::fs::remove_file(path).is_ok())
        .count()
}

/// Install the file and console layers. Keep the returned [`RunLog`] alive
/// until the program exits.
pub fn init(verbose: bool) -> RunLog {
    let dir = log_dir();
    let _ = std::fs::create_dir_all(&dir);
    let pruned = prune_logs(&dir, KEEP_LOGS.saturating_sub(1));

    let file_name = format!("{LOG_PREFIX}{}.log", uuid::Uuid::new_v4());
    let log_path = dir.join(&file_name);
    let (writer, flush) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&dir, &file_name));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(file_filter(std::env::var("RUST_LOG").ok().as_deref()));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(progress::ProgressWriter)
        .with_target(false)
        .without_time()
        .with_filter(console_level(verbose));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    if pruned > 0 {
        tracing::debug!(pruned, dir = %dir.display(), "removed old run logs");
    }

    RunLog {
        log_path,
        _flush: flush,
    }
}
