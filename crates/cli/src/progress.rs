//! Cargo-style progress output for savesync
//!
//! Displays progress in the familiar cargo format:
//! ```text
//!    Comparing hollow/default against gdrive:saves
//!   Uploading [===========>             ] 3/7 Saves/slot1.sav
//!      Synced 7 files in 1.24s
//! ```

use std::io::Write as _;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressBar};
use savesync_core::compare::{ComparisonStatus, SyncComparison};
use savesync_core::engine::{TransferEvent, TransferReport};
use savesync_core::migrate::{MigrationEvent, MigrationOutcome};
use savesync_core::remote::Direction;
use savesync_core::tracker::{ScanEvent, ScanOutcome};

static MULTI: LazyLock<MultiProgress> = LazyLock::new(MultiProgress::new);

/// Status verbs for cargo-style output (right-aligned to 12 chars)
pub struct Status;

impl Status {
    pub const SCANNING: &str = "Scanning";
    pub const CHANGED: &str = "Changed";
    pub const MISSING: &str = "Missing";
    pub const COMPARING: &str = "Comparing";
    pub const UPLOADING: &str = "Uploading";
    pub const DOWNLOADING: &str = "Downloading";
    pub const UPLOADED: &str = "Uploaded";
    pub const DOWNLOADED: &str = "Downloaded";
    pub const MIGRATING: &str = "Migrating";
    pub const COPIED: &str = "Copied";
    pub const TRACKING: &str = "Tracking";
    pub const SKIPPED: &str = "Skipped";
    pub const SYNCED: &str = "Synced";
    pub const FRESH: &str = "Fresh";
}

/// Print a cargo-style status line
pub fn print_status(status: &str, message: &str) {
    print_styled(&console::Style::new().green().bold(), status, message);
}

/// Same as [`print_status`] in yellow, for partial results
pub fn print_warning(status: &str, message: &str) {
    print_styled(&console::Style::new().yellow().bold(), status, message);
}

fn print_error(status: &str, message: &str) {
    print_styled(&console::Style::new().red().bold(), status, message);
}

fn print_styled(style: &console::Style, status: &str, message: &str) {
    MULTI.suspend(|| {
        let mut term = console::Term::stderr();
        let _ = writeln!(term, "{:>12} {}", style.apply_to(status), message);
    });
}

/// Writer for the console log layer that doesn't tear active bars
#[derive(Clone, Copy)]
pub struct ProgressWriter;

impl std::io::Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        MULTI.suspend(|| std::io::stderr().write_all(buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for ProgressWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}

/// Spinner shown while a remote operation runs
pub fn spinner(status: &'static str, message: String) -> ProgressBar {
    let pb = MULTI.add(ProgressBar::new_spinner());
    pb.set_style(
        indicatif::ProgressStyle::default_spinner()
            .template("{spinner:.green} {prefix:>12.green.bold} {msg}")
            .expect("valid template"),
    );
    pb.set_prefix(status);
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn format_elapsed(elapsed: Duration) -> String {
    if elapsed.as_secs() >= 1 {
        format!("{:.2}s", elapsed.as_secs_f64())
    } else {
        format!("{}ms", elapsed.as_millis())
    }
}

/// Usage time as hours and minutes
pub fn format_usage(usage: Duration) -> String {
    let minutes = usage.as_secs() / 60;
    match (minutes / 60, minutes % 60) {
        (0, m) => format!("{m}m"),
        (h, m) => format!("{h}h {m:02}m"),
    }
}

/// Tracks wall time of one command for the summary line
pub struct Progress {
    start: Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    fn elapsed(&self) -> String {
        format_elapsed(self.start.elapsed())
    }

    pub fn scan(&self, outcome: &ScanOutcome) {
        for event in &outcome.events {
            match event {
                ScanEvent::Changed { path, .. } => print_status(Status::CHANGED, path.as_str()),
                ScanEvent::Missing { path } => print_warning(Status::MISSING, path.as_str()),
                ScanEvent::Failed { entry, error } => print_error("Failed", &format!("{entry}: {error}")),
                ScanEvent::Cancelled { remaining } => {
                    print_warning("Cancelled", &format!("{remaining} files not scanned"));
                }
                ScanEvent::Unchanged { .. } => {}
            }
        }
        let files = outcome
            .events
            .iter()
            .filter(|e| !matches!(e, ScanEvent::Failed { .. } | ScanEvent::Cancelled { .. }))
            .count();
        print_status(
            Status::SCANNING,
            &format!(
                "{files} files, {} changed in {}",
                outcome.candidates.len(),
                self.elapsed()
            ),
        );
    }

    pub fn transfer(&self, report: &TransferReport) {
        let (done, verb) = match report.direction {
            Direction::Upload => (Status::UPLOADED, "uploaded"),
            Direction::Download => (Status::DOWNLOADED, "downloaded"),
        };
        for event in &report.events {
            match event {
                TransferEvent::Transferred { path, bytes } => print_status(
                    done,
                    &format!(
                        "{path} ({})",
                        humansize::format_size(*bytes, humansize::BINARY)
                    ),
                ),
                TransferEvent::Failed { path, error } => {
                    print_error("Failed", &format!("{path}: {error}"));
                }
                TransferEvent::Cancelled { remaining } => {
                    print_warning("Cancelled", &format!("{remaining} files left"));
                }
                TransferEvent::Skipped { .. } => {}
            }
        }

        if report.direction == Direction::Upload && !report.record_set_uploaded {
            print_warning("Warning", "record set was not uploaded, run push again");
        }

        if report.is_complete() {
            print_status(
                Status::SYNCED,
                &format!(
                    "{} files {verb}, {} up to date in {}",
                    report.transferred,
                    report.skipped,
                    self.elapsed()
                ),
            );
        } else {
            print_warning(
                "Finished",
                &format!(
                    "{} {verb}, {} failed in {}",
                    report.transferred,
                    report.failed.len(),
                    self.elapsed()
                ),
            );
        }
    }

    pub fn comparison(&self, comparison: &SyncComparison) {
        let local = format_usage(comparison.local_usage);
        let magnitude = format_usage(comparison.magnitude);
        let message = match (comparison.status, comparison.remote_usage) {
            (ComparisonStatus::RemoteNotFound, _) | (_, None) => {
                format!("no remote record set, local has {local}")
            }
            (ComparisonStatus::LocalAhead, Some(remote)) => format!(
                "local ahead by {magnitude} ({local} vs {})",
                format_usage(remote)
            ),
            (ComparisonStatus::CloudAhead, Some(remote)) => format!(
                "cloud ahead by {magnitude} ({} vs {local})",
                format_usage(remote)
            ),
            (ComparisonStatus::Similar, Some(_)) => {
                format!("usage within threshold ({local}, off by {magnitude})")
            }
        };
        print_status(Status::COMPARING, &message);
    }

    pub fn migration(&self, outcome: &MigrationOutcome) {
        for event in &outcome.events {
            match event {
                MigrationEvent::Purged => print_warning("Purged", "existing remote folder"),
                MigrationEvent::Copied {
                    source,
                    destination,
                } => print_status(Status::COPIED, &format!("{source} -> {destination}")),
                MigrationEvent::Skipped { source } => print_status(Status::SKIPPED, source),
                MigrationEvent::Failed { source, error } => {
                    print_error("Failed", &format!("{source}: {error}"));
                }
                MigrationEvent::Cancelled { remaining } => {
                    print_warning("Cancelled", &format!("{remaining} files left"));
                }
            }
        }

        let summary = format!(
            "{} copied, {} skipped, {} failed in {}",
            outcome.copied,
            outcome.skipped,
            outcome.failed.len(),
            self.elapsed()
        );
        if outcome.is_complete() {
            print_status(Status::MIGRATING, &summary);
        } else {
            print_warning(Status::MIGRATING, &summary);
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_usage() {
        assert_eq!(format_usage(Duration::from_secs(59)), "0m");
        assert_eq!(format_usage(Duration::from_secs(600)), "10m");
        assert_eq!(format_usage(Duration::from_secs(7_260)), "2h 01m");
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_millis(250)), "250ms");
        assert_eq!(format_elapsed(Duration::from_millis(1_500)), "1.50s");
    }
}
