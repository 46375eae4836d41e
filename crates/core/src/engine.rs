//! Sync engine: the operations a front end calls per tracked item
//!
//! The engine holds no record set between calls. Every operation loads the
//! item's record set from the store, works on it, and saves it back, so a
//! UI and a tracking loop never act on stale state. Callers must not run
//! two operations for the same item at once.

use std::path::Path;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compare::{ComparisonStatus, SyncComparison, fetch_and_compare};
use crate::config::ItemConfig;
use crate::error::Result;
use crate::hash::ContentHash;
use crate::migrate::{self, MigrationOutcome, MigrationTarget};
use crate::path::{PathRoots, PortablePath};
use crate::record::{ChecksumRecord, ConflictPolicy, LastSync, RecordSet, unix_now};
use crate::remote::{Direction, RemoteTransport, remote_join, with_timeout};
use crate::store::{ItemKey, RecordStore, load_or_empty};
use crate::tracker::{ChangeTracker, ScanOutcome};

/// Remote location and time limits shared by all items
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub remote_root: String,
    pub fetch_timeout: Duration,
    pub transfer_timeout: Duration,
    pub scan_interval: Duration,
}

/// An item as the engine sees it
#[derive(Debug, Clone)]
pub struct TrackedItem {
    pub key: ItemKey,
    pub roots: PathRoots,
    pub tracked: Vec<String>,
}

impl TrackedItem {
    /// # Errors
    /// Returns an error if the item or profile id is invalid
    pub fn from_config(config: &ItemConfig) -> Result<Self> {
        Ok(Self {
            key: config.key()?,
            roots: config.roots(),
            tracked: config.tracked.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Transferred { path: PortablePath, bytes: u64 },
    Skipped { path: PortablePath },
    Failed { path: PortablePath, error: String },
    Cancelled { remaining: usize },
}

/// Per-file result of a push or pull
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub direction: Direction,
    pub transferred: usize,
    pub skipped: usize,
    pub failed: Vec<(PortablePath, String)>,
    pub cancelled: bool,
    /// Whether the remote record set was updated (push only)
    pub record_set_uploaded: bool,
    pub events: Vec<TransferEvent>,
}

impl TransferReport {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            transferred: 0,
            skipped: 0,
            failed: Vec::new(),
            cancelled: false,
            record_set_uploaded: false,
            events: Vec::new(),
        }
    }

    fn transferred(&mut self, path: &PortablePath, bytes: u64) {
        self.transferred += 1;
        self.events.push(TransferEvent::Transferred {
            path: path.clone(),
            bytes,
        });
    }

    fn skipped(&mut self, path: &PortablePath) {
        self.skipped += 1;
        self.events.push(TransferEvent::Skipped { path: path.clone() });
    }

    fn failed(&mut self, path: &PortablePath, error: impl Into<String>) {
        let error = error.into();
        warn!(%path, error, "transfer failed");
        self.failed.push((path.clone(), error.clone()));
        self.events.push(TransferEvent::Failed {
            path: path.clone(),
            error,
        });
    }

    fn cancel(&mut self, remaining: usize) {
        self.cancelled = true;
        self.events.push(TransferEvent::Cancelled { remaining });
    }

    /// Every file went through and nothing was cut short
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }

    fn last_sync(&self) -> LastSync {
        LastSync::from_counts(self.transferred, self.failed.len(), unix_now())
    }
}

#[derive(Debug, Clone)]
pub enum SmartAction {
    Pushed(TransferReport),
    Pulled(TransferReport),
    UpToDate,
}

#[derive(Debug, Clone)]
pub struct SmartSyncOutcome {
    pub comparison: SyncComparison,
    pub action: SmartAction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub scans: usize,
    pub changed: usize,
}

pub struct SyncEngine<S, T> {
    store: S,
    transport: T,
    settings: EngineSettings,
}

impl<S, T> SyncEngine<S, T>
where
    S: RecordStore,
    T: RemoteTransport,
{
    pub fn new(store: S, transport: T, settings: EngineSettings) -> Self {
        Self {
            store,
            transport,
            settings,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Remote folder of an item in the current layout
    #[must_use]
    pub fn remote_dir(&self, item: &TrackedItem) -> String {
        item.key.remote_dir(&self.settings.remote_root)
    }

    /// Current record set of an item (empty if none could be loaded)
    pub fn records(&self, item: &TrackedItem) -> RecordSet {
        load_or_empty(&self.store, &item.key)
    }

    /// Start tracking a file explicitly
    ///
    /// # Errors
    /// Fails on an unreadable file, an invalid path or a failed save.
    pub fn track(&self, item: &TrackedItem, path: &Path) -> Result<PortablePath> {
        let mut records = load_or_empty(&self.store, &item.key);
        let portable = records.track(path, &item.roots)?;
        self.store.save(&item.key, &records)?;
        info!(key = %item.key, %portable, "tracking");
        Ok(portable)
    }

    /// Stop tracking a file; returns the removed record
    ///
    /// # Errors
    /// Fails if the record set cannot be saved.
    pub fn untrack(
        &self,
        item: &TrackedItem,
        portable: &PortablePath,
    ) -> Result<Option<ChecksumRecord>> {
        let mut records = load_or_empty(&self.store, &item.key);
        let removed = records.untrack(portable);
        if removed.is_some() {
            self.store.save(&item.key, &records)?;
        }
        Ok(removed)
    }

    fn scan_unsaved(&self, item: &TrackedItem, cancel: &CancellationToken) -> ScanOutcome {
        let previous = load_or_empty(&self.store, &item.key);
        ChangeTracker::new(item.roots.clone()).scan(previous, &item.tracked, cancel)
    }

    /// Detect changed files and persist their new checksums.
    ///
    /// # Errors
    /// Returns [`crate::SyncError::Persistence`] if the updated records
    /// cannot be saved.
    pub fn scan(&self, item: &TrackedItem, cancel: &CancellationToken) -> Result<ScanOutcome> {
        let outcome = self.scan_unsaved(item, cancel);
        if outcome.has_changes() {
            self.store.save(&item.key, &outcome.records)?;
        }
        Ok(outcome)
    }

    /// Upload every file whose content is not yet confirmed on the remote,
    /// then the record set itself.
    ///
    /// Each file is re-hashed first and only uploaded if it still holds the
    /// recorded content. `last_synchronized` only advances for files the
    /// transport confirmed.
    ///
    /// # Errors
    /// Returns [`crate::SyncError::Persistence`] if the record set cannot be
    /// saved. Per-file failures are in the report.
    pub async fn push(
        &self,
        item: &TrackedItem,
        cancel: &CancellationToken,
    ) -> Result<TransferReport> {
        let mut records = load_or_empty(&self.store, &item.key);
        let remote_dir = self.remote_dir(item);
        let pending = records.pending_upload();
        let mut report = TransferReport::new(Direction::Upload);

        for (index, portable) in pending.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancel(pending.len() - index);
                break;
            }

            let local = match item.roots.expand(portable) {
                Ok(local) => local,
                Err(e) => {
                    report.failed(portable, e.to_string());
                    continue;
                }
            };
            if !local.is_file() {
                report.failed(portable, "missing locally");
                continue;
            }
            let Some(expected) = records.get(portable).map(|r| r.checksum) else {
                continue;
            };
            match ContentHash::from_file(&local) {
                Ok(actual) if actual == expected => {}
                Ok(_) => {
                    report.failed(portable, "content changed since the last scan");
                    continue;
                }
                Err(e) => {
                    report.failed(portable, e.to_string());
                    continue;
                }
            }

            let remote = remote_join(&remote_dir, &portable.storage_key());
            let upload = self.transport.transfer(&local, &remote, Direction::Upload);
            match with_timeout(self.settings.transfer_timeout, upload).await {
                Ok(()) => {
                    if let Some(record) = records.get_mut(portable) {
                        record.mark_synchronized(unix_now());
                        report.transferred(portable, record.size_bytes);
                    }
                }
                Err(e) => report.failed(portable, e.to_string()),
            }
        }

        records.metadata.last_sync = Some(report.last_sync());
        let put = self.transport.put_record_set(&remote_dir, &records);
        match with_timeout(self.settings.transfer_timeout, put).await {
            Ok(()) => report.record_set_uploaded = true,
            Err(e) => {
                warn!(key = %item.key, error = %e, "failed to upload record set");
                let last = report.last_sync();
                records.metadata.last_sync =
                    Some(LastSync::from_counts(last.transferred, last.failed + 1, last.at));
            }
        }

        self.store.save(&item.key, &records)?;
        info!(
            key = %item.key,
            transferred = report.transferred,
            failed = report.failed.len(),
            "push finished"
        );
        Ok(report)
    }

    /// Download every remote file that differs from the local copy.
    ///
    /// A download replaces the local file only after its checksum matched.
    ///
    /// # Errors
    /// Returns a transport error if the remote record set cannot be fetched,
    /// or [`crate::SyncError::Persistence`] if the local one cannot be saved.
    pub async fn pull(
        &self,
        item: &TrackedItem,
        cancel: &CancellationToken,
    ) -> Result<TransferReport> {
        let remote_dir = self.remote_dir(item);
        let fetch = self.transport.fetch_record_set(&remote_dir);
        let remote = with_timeout(self.settings.fetch_timeout, fetch).await?;
        let mut report = TransferReport::new(Direction::Download);

        let Some(remote) = remote else {
            info!(key = %item.key, "nothing on the remote to pull");
            return Ok(report);
        };

        let mut local = load_or_empty(&self.store, &item.key);
        let wanted: Vec<&ChecksumRecord> = remote.records.values().collect();

        for (index, remote_record) in wanted.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancel(wanted.len() - index);
                break;
            }

            let portable = &remote_record.portable_path;
            let target = match item.roots.expand(portable) {
                Ok(target) => target,
                Err(e) => {
                    report.failed(portable, e.to_string());
                    continue;
                }
            };

            let up_to_date = target.is_file()
                && local
                    .get(portable)
                    .is_some_and(|r| r.checksum == remote_record.checksum);
            if up_to_date {
                report.skipped(portable);
                continue;
            }

            let remote_path = remote_join(&remote_dir, &portable.storage_key());
            match self.download_verified(&target, &remote_path, remote_record).await {
                Ok(()) => {
                    let now = unix_now();
                    let mut record = ChecksumRecord {
                        last_local_write: now,
                        ..(*remote_record).clone()
                    };
                    record.mark_synchronized(now);
                    local.upsert(record);
                    report.transferred(portable, remote_record.size_bytes);
                }
                Err(e) => report.failed(portable, e),
            }
        }

        if remote.metadata.usage.cumulative_secs > local.metadata.usage.cumulative_secs {
            local.metadata.usage = remote.metadata.usage;
        }
        local.metadata.last_sync = Some(report.last_sync());
        self.store.save(&item.key, &local)?;

        info!(
            key = %item.key,
            transferred = report.transferred,
            skipped = report.skipped,
            failed = report.failed.len(),
            "pull finished"
        );
        Ok(report)
    }

    /// Download into a temp file next to `target` and move it into place only
    /// if its checksum matches the record. The local file is untouched
    /// otherwise.
    async fn download_verified(
        &self,
        target: &Path,
        remote_path: &str,
        expected: &ChecksumRecord,
    ) -> std::result::Result<(), String> {
        let parent = target
            .parent()
            .ok_or_else(|| format!("{} has no parent directory", target.display()))?;
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        let staged = tempfile::NamedTempFile::new_in(parent).map_err(|e| e.to_string())?;

        let download = self
            .transport
            .transfer(staged.path(), remote_path, Direction::Download);
        with_timeout(self.settings.transfer_timeout, download)
            .await
            .map_err(|e| e.to_string())?;

        let actual = ContentHash::from_file(staged.path()).map_err(|e| e.to_string())?;
        if actual != expected.checksum {
            return Err(format!(
                "checksum mismatch: expected {}, got {actual}",
                expected.checksum
            ));
        }
        staged.persist(target).map_err(|e| e.error.to_string())?;
        Ok(())
    }

    /// Compare local usage against the remote's
    pub async fn compare(&self, item: &TrackedItem, threshold: Duration) -> SyncComparison {
        let local = load_or_empty(&self.store, &item.key);
        fetch_and_compare(
            &self.transport,
            &self.remote_dir(item),
            &local.usage(),
            threshold,
            self.settings.fetch_timeout,
        )
        .await
    }

    /// Compare, then push, pull or do nothing.
    ///
    /// # Errors
    /// See [`Self::scan`], [`Self::push`] and [`Self::pull`].
    pub async fn smart_sync(
        &self,
        item: &TrackedItem,
        threshold: Duration,
        cancel: &CancellationToken,
    ) -> Result<SmartSyncOutcome> {
        let comparison = self.compare(item, threshold).await;

        let action = match comparison.status {
            ComparisonStatus::CloudAhead => SmartAction::Pulled(self.pull(item, cancel).await?),
            ComparisonStatus::LocalAhead | ComparisonStatus::RemoteNotFound => {
                self.scan(item, cancel)?;
                SmartAction::Pushed(self.push(item, cancel).await?)
            }
            ComparisonStatus::Similar => {
                self.scan(item, cancel)?;
                if self.records(item).pending_upload().is_empty() {
                    debug!(key = %item.key, "similar usage and nothing pending");
                    SmartAction::UpToDate
                } else {
                    SmartAction::Pushed(self.push(item, cancel).await?)
                }
            }
        };

        Ok(SmartSyncOutcome { comparison, action })
    }

    /// Move the item from a legacy flat folder into the current layout.
    ///
    /// # Errors
    /// Fails if the legacy folder lies inside the item's folder, either
    /// record set cannot be fetched, the plan is invalid, a
    /// required purge fails or the merged record set cannot be uploaded.
    /// Individual copy failures are reported in the outcome.
    pub async fn migrate(
        &self,
        item: &TrackedItem,
        legacy_dir: &str,
        policy: ConflictPolicy,
        cancel: &CancellationToken,
    ) -> Result<MigrationOutcome> {
        let current_dir = self.remote_dir(item);
        let target = MigrationTarget {
            legacy_dir,
            current_dir: &current_dir,
            timeout: self.settings.transfer_timeout,
        };
        target.validate()?;

        let fetch_legacy = self.transport.fetch_record_set(legacy_dir);
        let Some(legacy) = with_timeout(self.settings.fetch_timeout, fetch_legacy).await? else {
            info!(legacy_dir, "no legacy record set, nothing to migrate");
            return Ok(MigrationOutcome::default());
        };

        let fetch_current = self.transport.fetch_record_set(&current_dir);
        let current = with_timeout(self.settings.fetch_timeout, fetch_current).await?;

        let plan = migrate::plan(&legacy, current.as_ref(), policy, &item.roots)?;
        if plan.is_empty() {
            return Ok(MigrationOutcome {
                skipped: plan.skipped(),
                records: current.unwrap_or_default(),
                ..MigrationOutcome::default()
            });
        }

        let outcome = migrate::execute(&plan, current, &self.transport, &target, cancel).await?;

        let put = self.transport.put_record_set(&current_dir, &outcome.records);
        with_timeout(self.settings.transfer_timeout, put).await?;
        Ok(outcome)
    }

    /// Re-scan periodically until `cancel` fires.
    ///
    /// Scan failures inside the loop are logged and the loop goes on; the
    /// final scan in [`Self::finish_session`] is the one that must succeed.
    pub async fn track_session(
        &self,
        item: &TrackedItem,
        cancel: &CancellationToken,
    ) -> SessionSummary {
        let mut ticker = tokio::time::interval(self.settings.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut summary = SessionSummary::default();

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => match self.scan(item, cancel) {
                    Ok(outcome) => {
                        summary.scans += 1;
                        summary.changed += outcome.candidates.len();
                    }
                    Err(e) => warn!(key = %item.key, error = %e, "background scan failed"),
                },
            }
        }

        debug!(key = %item.key, scans = summary.scans, "tracking loop stopped");
        summary
    }

    /// Final scan at a session boundary, plus usage accounting.
    ///
    /// Call only after the tracking loop for this item has returned.
    ///
    /// # Errors
    /// Returns [`crate::SyncError::Persistence`] if the result cannot be saved.
    pub fn finish_session(&self, item: &TrackedItem, elapsed: Duration) -> Result<ScanOutcome> {
        let mut outcome = self.scan_unsaved(item, &CancellationToken::new());
        outcome.records.add_usage(elapsed, unix_now());
        self.store.save(&item.key, &outcome.records)?;
        info!(
            key = %item.key,
            changed = outcome.candidates.len(),
            played_secs = elapsed.as_secs(),
            "session finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracked_item_from_config() {
        let config = ItemConfig {
            id: "hollow".into(),
            install_root: "/games/hollow".into(),
            profile: "default".into(),
            tracked: vec!["Saves".into()],
            legacy_remote: None,
        };
        let item = TrackedItem::from_config(&config).unwrap();
        assert_eq!(item.key.to_string(), "hollow/default");
        assert_eq!(item.roots.install_root(), Path::new("/games/hollow"));
        assert_eq!(item.tracked, vec!["Saves".to_string()]);
    }

    #[test]
    fn test_report_counts() {
        let path = PortablePath::parse("%GAMEPATH%/a.sav").unwrap();
        let mut report = TransferReport::new(Direction::Upload);
        report.transferred(&path, 10);
        report.failed(&path, "nope");
        assert!(!report.is_complete());
        let last = report.last_sync();
        assert_eq!((last.transferred, last.failed), (1, 1));
    }
}
