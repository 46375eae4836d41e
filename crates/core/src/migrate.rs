//! One-time migration from the legacy remote layout to the current one
//!
//! The legacy layout stored every file flat under the item folder and kept
//! the file's real location only in its record's `portable_path`. The
//! current layout mirrors that location (see [`PortablePath::storage_key`]).
//! So the source of a copy is always the flat name the legacy set is keyed
//! by, and the destination is rebuilt from the record, never from that key.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::path::{PathRoots, PortablePath};
use crate::record::{ChecksumRecord, ConflictPolicy, RecordMetadata, RecordSet, unix_now};
use crate::remote::{RemoteTransport, remote_join, with_timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    /// Destination has no such file
    Copy,
    /// Destination had the file; it is purged first and rewritten
    Replace,
    /// Destination already has the file and wins
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    /// Flat name in the legacy folder
    pub source: String,
    pub destination: PortablePath,
    pub action: FileAction,
    /// Legacy record rewritten to the destination path
    pub record: ChecksumRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    pub policy: ConflictPolicy,
    /// Delete the current folder before copying
    pub purge_destination: bool,
    pub files: Vec<PlannedFile>,
    /// Metadata the migrated record set ends up with
    pub metadata: RecordMetadata,
}

impl MigrationPlan {
    fn empty(policy: ConflictPolicy, metadata: RecordMetadata) -> Self {
        Self {
            policy,
            purge_destination: false,
            files: Vec::new(),
            metadata,
        }
    }

    /// Files that will actually be written
    pub fn copies(&self) -> impl Iterator<Item = &PlannedFile> {
        self.files.iter().filter(|f| f.action != FileAction::Skip)
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.action == FileAction::Skip)
            .count()
    }

    /// No purge and nothing to copy
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.purge_destination && self.copies().next().is_none()
    }

    /// Destination resolved for a legacy flat name
    #[must_use]
    pub fn resolved_path(&self, source: &str) -> Option<&PortablePath> {
        self.files
            .iter()
            .find(|f| f.source == source)
            .map(|f| &f.destination)
    }
}

/// Work out how the legacy record set maps onto the current one.
///
/// - no current set: copy everything
/// - `KeepExisting`: nothing to do
/// - `ReplaceWithLegacy`: purge the destination, then copy everything
/// - `Merge`: copy what the current set lacks, skip the rest
///
/// # Errors
/// Returns [`crate::SyncError::Validation`] if a legacy record's path
/// cannot be resolved against `roots`. Nothing is planned in that case.
pub fn plan(
    legacy: &RecordSet,
    current: Option<&RecordSet>,
    policy: ConflictPolicy,
    roots: &PathRoots,
) -> Result<MigrationPlan> {
    if current.is_some() && policy == ConflictPolicy::KeepExisting {
        debug!("current layout exists and policy keeps it");
        let metadata = current.map(|c| c.metadata.clone()).unwrap_or_default();
        return Ok(MigrationPlan::empty(policy, metadata));
    }

    let mut files = Vec::with_capacity(legacy.len());
    let mut claimed = BTreeSet::new();

    for (flat, record) in &legacy.records {
        let source = flat.as_str().to_string();
        let destination = resolve_destination(&record.portable_path, roots)?;

        let in_current = current.is_some_and(|c| c.get(&destination).is_some());
        let action = if !claimed.insert(destination.clone()) {
            warn!(%destination, source, "two legacy files resolve to the same destination");
            FileAction::Skip
        } else {
            match (current.is_some(), policy, in_current) {
                (false, _, _) | (true, ConflictPolicy::Merge, false) => FileAction::Copy,
                (true, ConflictPolicy::Merge, true) => FileAction::Skip,
                (true, ConflictPolicy::ReplaceWithLegacy, true) => FileAction::Replace,
                (true, ConflictPolicy::ReplaceWithLegacy, false) => FileAction::Copy,
                (true, ConflictPolicy::KeepExisting, _) => FileAction::Skip,
            }
        };

        files.push(PlannedFile {
            source,
            record: ChecksumRecord {
                portable_path: destination.clone(),
                ..record.clone()
            },
            destination,
            action,
        });
    }

    // Usage follows the side whose files win
    let metadata = match current {
        Some(current) if policy == ConflictPolicy::Merge => {
            let mut merged = current.metadata.clone();
            if legacy.metadata.usage.cumulative_secs > merged.usage.cumulative_secs {
                merged.usage = legacy.metadata.usage;
            }
            merged
        }
        _ => legacy.metadata.clone(),
    };

    let plan = MigrationPlan {
        policy,
        purge_destination: current.is_some() && policy == ConflictPolicy::ReplaceWithLegacy,
        files,
        metadata,
    };
    info!(
        ?policy,
        copies = plan.copies().count(),
        skipped = plan.skipped(),
        purge = plan.purge_destination,
        "planned migration"
    );
    Ok(plan)
}

/// Re-apply the contraction rules to the recorded path
fn resolve_destination(recorded: &PortablePath, roots: &PathRoots) -> Result<PortablePath> {
    let absolute = roots.expand(recorded)?;
    roots.contract(&absolute)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationEvent {
    Purged,
    Copied { source: String, destination: PortablePath },
    Skipped { source: String },
    Failed { source: String, error: String },
    Cancelled { remaining: usize },
}

/// Result of executing a plan. Partial success carries both counts.
#[derive(Debug, Clone, Default)]
pub struct MigrationOutcome {
    pub copied: usize,
    pub skipped: usize,
    pub failed: Vec<(String, String)>,
    pub cancelled: bool,
    /// Current record set after migration
    pub records: RecordSet,
    pub events: Vec<MigrationEvent>,
}

impl MigrationOutcome {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }

    #[must_use]
    pub fn attempted(&self) -> usize {
        self.copied + self.failed.len()
    }
}

/// Where the two layouts live on the remote
#[derive(Debug, Clone)]
pub struct MigrationTarget<'a> {
    pub legacy_dir: &'a str,
    pub current_dir: &'a str,
    pub timeout: Duration,
}

impl MigrationTarget<'_> {
    /// The legacy folder must lie outside the current one, or purging the
    /// current folder would delete the copy sources.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] if `legacy_dir` equals or sits
    /// below `current_dir`.
    pub fn validate(&self) -> Result<()> {
        let legacy = self.legacy_dir.trim_end_matches('/');
        let current = self.current_dir.trim_end_matches('/');
        let nested = legacy
            .strip_prefix(current)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'));
        if nested {
            return Err(SyncError::validation(
                self.legacy_dir,
                format!("legacy folder is inside the current folder `{}`", self.current_dir),
            ));
        }
        Ok(())
    }
}

/// Run a plan file by file.
///
/// A failed or timed-out copy is recorded and the next file is tried. The
/// only hard failure is a purge that does not complete, since copying on
/// top of a half-deleted folder would not be a replacement.
///
/// # Errors
/// Returns [`SyncError::Validation`] for an invalid target, or the transport
/// error of a failed purge.
pub async fn execute<T>(
    plan: &MigrationPlan,
    current: Option<RecordSet>,
    transport: &T,
    target: &MigrationTarget<'_>,
    cancel: &CancellationToken,
) -> Result<MigrationOutcome>
where
    T: RemoteTransport + ?Sized,
{
    target.validate()?;
    let mut outcome = MigrationOutcome::default();

    let mut records = if plan.purge_destination {
        with_timeout(target.timeout, transport.purge(target.current_dir)).await?;
        outcome.events.push(MigrationEvent::Purged);
        RecordSet::new()
    } else {
        current.unwrap_or_default()
    };
    records.metadata = plan.metadata.clone();

    for (index, file) in plan.files.iter().enumerate() {
        if cancel.is_cancelled() {
            let remaining = plan.files.len() - index;
            outcome.events.push(MigrationEvent::Cancelled { remaining });
            outcome.cancelled = true;
            break;
        }

        if file.action == FileAction::Skip {
            outcome.skipped += 1;
            outcome.events.push(MigrationEvent::Skipped {
                source: file.source.clone(),
            });
            continue;
        }

        let from = remote_join(target.legacy_dir, &file.source);
        let to = remote_join(target.current_dir, &file.destination.storage_key());
        match with_timeout(target.timeout, transport.copy(&from, &to)).await {
            Ok(()) => {
                let mut record = file.record.clone();
                record.mark_synchronized(unix_now());
                records.upsert(record);
                outcome.copied += 1;
                outcome.events.push(MigrationEvent::Copied {
                    source: file.source.clone(),
                    destination: file.destination.clone(),
                });
            }
            Err(e) => {
                warn!(from, to, error = %e, "migration copy failed");
                outcome.failed.push((file.source.clone(), e.to_string()));
                outcome.events.push(MigrationEvent::Failed {
                    source: file.source.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    info!(
        copied = outcome.copied,
        skipped = outcome.skipped,
        failed = outcome.failed.len(),
        "migration finished"
    );
    outcome.records = records;
    Ok(outcome)
}
