//! Change detection over an explicit list of tracked save files
//!
//! Only opted-in entries are looked at. An entry naming a directory opts in
//! every file beneath it; nothing outside the tracked entries is ever walked.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::hash::ContentHash;
use crate::path::{PathRoots, PortablePath};
use crate::record::{ChecksumRecord, RecordSet, unix_now};

/// Progress of a scan, one event per resolved file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Unchanged {
        path: PortablePath,
    },
    Changed {
        path: PortablePath,
        previous: Option<ContentHash>,
        current: ContentHash,
    },
    /// Tracked but not on disk; its record is left as is
    Missing {
        path: PortablePath,
    },
    Failed {
        entry: String,
        error: String,
    },
    Cancelled {
        remaining: usize,
    },
}

/// Result of one scan.
///
/// An empty candidate list with no failures is a successful scan where
/// nothing changed.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    /// Absolute paths of files whose content changed since the last record
    pub candidates: Vec<PathBuf>,
    /// Previous records with every candidate updated
    pub records: RecordSet,
    pub events: Vec<ScanEvent>,
    pub cancelled: bool,
}

impl ScanOutcome {
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.candidates.is_empty()
    }

    /// Entries that could not be resolved or read
    #[must_use]
    pub fn failures(&self) -> Vec<(&str, &str)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ScanEvent::Failed { entry, error } => Some((entry.as_str(), error.as_str())),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn missing(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, ScanEvent::Missing { .. }))
            .count()
    }
}

/// Detects which tracked files changed since their last record
pub struct ChangeTracker {
    roots: PathRoots,
}

impl ChangeTracker {
    #[must_use]
    pub fn new(roots: PathRoots) -> Self {
        Self { roots }
    }

    #[must_use]
    pub fn roots(&self) -> &PathRoots {
        &self.roots
    }

    /// Scan the tracked entries plus every file that already has a record.
    ///
    /// A file is a candidate iff it has no record or its checksum differs.
    /// Candidates get the new checksum and `last_local_write = now`;
    /// `last_synchronized` is never touched here. Missing files are skipped
    /// without touching their record, and an unreadable file is reported
    /// without stopping the scan. Cancellation is checked before each file.
    #[must_use]
    pub fn scan(
        &self,
        previous: RecordSet,
        tracked: &[String],
        cancel: &CancellationToken,
    ) -> ScanOutcome {
        let mut records = previous;
        let mut events = Vec::new();
        let mut candidates = Vec::new();

        let files = self.resolve_files(&records, tracked, &mut events);
        let now = unix_now();

        for (index, (portable, absolute)) in files.iter().enumerate() {
            if cancel.is_cancelled() {
                let remaining = files.len() - index;
                debug!(remaining, "scan cancelled");
                events.push(ScanEvent::Cancelled { remaining });
                return ScanOutcome {
                    candidates,
                    records,
                    events,
                    cancelled: true,
                };
            }

            if !absolute.is_file() {
                events.push(ScanEvent::Missing {
                    path: portable.clone(),
                });
                continue;
            }

            let (checksum, size) = match hash_with_size(absolute) {
                Ok(v) => v,
                Err(e) => {
                    warn!(path = %absolute.display(), error = %e, "failed to read tracked file");
                    events.push(ScanEvent::Failed {
                        entry: portable.to_string(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            let previous_checksum = records.get(portable).map(|r| r.checksum);
            if previous_checksum == Some(checksum) {
                events.push(ScanEvent::Unchanged {
                    path: portable.clone(),
                });
                continue;
            }

            let record = match records.get(portable) {
                Some(existing) => ChecksumRecord {
                    checksum,
                    size_bytes: size,
                    last_local_write: now,
                    ..existing.clone()
                },
                None => ChecksumRecord::new(portable.clone(), checksum, size),
            };
            records.upsert(record);

            debug!(path = %portable, "changed");
            events.push(ScanEvent::Changed {
                path: portable.clone(),
                previous: previous_checksum,
                current: checksum,
            });
            candidates.push(absolute.clone());
        }

        info!(
            files = files.len(),
            changed = candidates.len(),
            "scan complete"
        );

        ScanOutcome {
            candidates,
            records,
            events,
            cancelled: false,
        }
    }

    /// Expand tracked entries and record keys into unique (portable, absolute) pairs
    fn resolve_files(
        &self,
        records: &RecordSet,
        tracked: &[String],
        events: &mut Vec<ScanEvent>,
    ) -> Vec<(PortablePath, PathBuf)> {
        let mut seen = BTreeSet::new();
        let mut files = Vec::new();

        for entry in tracked {
            match self.resolve_entry(entry) {
                Ok(resolved) => {
                    for (portable, absolute) in resolved {
                        if seen.insert(portable.clone()) {
                            files.push((portable, absolute));
                        } else {
                            debug!(path = %portable, entry, "already tracked by an earlier entry");
                        }
                    }
                }
                Err(e) => events.push(ScanEvent::Failed {
                    entry: entry.clone(),
                    error: e.to_string(),
                }),
            }
        }

        for portable in records.records.keys() {
            if seen.contains(portable) {
                continue;
            }
            match self.roots.expand(portable) {
                Ok(absolute) => {
                    seen.insert(portable.clone());
                    files.push((portable.clone(), absolute));
                }
                Err(e) => events.push(ScanEvent::Failed {
                    entry: portable.to_string(),
                    error: e.to_string(),
                }),
            }
        }

        files
    }

    fn resolve_entry(&self, entry: &str) -> Result<Vec<(PortablePath, PathBuf)>, SyncError> {
        let entry_path = Path::new(entry);
        let portable = self.roots.contract_tracked(entry_path)?;
        let absolute = if entry_path.is_absolute() {
            entry_path.to_path_buf()
        } else {
            self.roots.expand(&portable)?
        };

        if !absolute.is_dir() {
            return Ok(vec![(portable, absolute)]);
        }

        let mut files = Vec::new();
        let mut builder = WalkBuilder::new(&absolute);
        builder.standard_filters(false).follow_links(false);

        for result in builder.build() {
            let dir_entry = match result {
                Ok(e) => e,
                Err(e) => {
                    warn!(entry, error = %e, "skipping unreadable directory entry");
                    continue;
                }
            };
            if !dir_entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let path = dir_entry.into_path();
            let portable = self.roots.contract_tracked(&path)?;
            files.push((portable, path));
        }

        files.sort();
        Ok(files)
    }
}

fn hash_with_size(path: &Path) -> std::io::Result<(ContentHash, u64)> {
    let checksum = ContentHash::from_file(path)?;
    let size = std::fs::metadata(path)?.len();
    Ok((checksum, size))
}
