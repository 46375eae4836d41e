//! Checksum records: the per-file state a save is synchronised against

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::hash::ContentHash;
use crate::path::{PathRoots, PortablePath};

/// Current time as seconds since the UNIX epoch
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// One tracked file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumRecord {
    pub portable_path: PortablePath,
    pub checksum: ContentHash,
    /// Informational only, never used for change detection
    pub size_bytes: u64,
    /// Seconds since UNIX epoch
    pub last_local_write: i64,
    /// Seconds since UNIX epoch of the last confirmed transfer of this file
    #[serde(default)]
    pub last_synchronized: Option<i64>,
    /// Checksum the remote copy had after that transfer
    #[serde(default)]
    pub synchronized_checksum: Option<ContentHash>,
}

impl ChecksumRecord {
    #[must_use]
    pub fn new(portable_path: PortablePath, checksum: ContentHash, size_bytes: u64) -> Self {
        Self {
            portable_path,
            checksum,
            size_bytes,
            last_local_write: unix_now(),
            last_synchronized: None,
            synchronized_checksum: None,
        }
    }

    /// Local content differs from what was last confirmed on the remote
    #[must_use]
    pub fn needs_upload(&self) -> bool {
        self.synchronized_checksum != Some(self.checksum)
    }

    /// Record a confirmed transfer of the current content
    pub fn mark_synchronized(&mut self, at: i64) {
        self.last_synchronized = Some(at);
        self.synchronized_checksum = Some(self.checksum);
    }
}

/// Cumulative usage of an item, as recorded alongside its record set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSample {
    pub cumulative_secs: u64,
    /// Seconds since UNIX epoch
    pub as_of: i64,
}

impl UsageSample {
    #[must_use]
    pub fn new(cumulative: Duration, as_of: i64) -> Self {
        Self {
            cumulative_secs: cumulative.as_secs(),
            as_of,
        }
    }

    #[must_use]
    pub fn cumulative(&self) -> Duration {
        Duration::from_secs(self.cumulative_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Succeeded,
    Partial,
    Failed,
}

/// Result of the most recent sync attempt, kept for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSync {
    pub outcome: SyncOutcome,
    pub at: i64,
    pub transferred: usize,
    pub failed: usize,
}

impl LastSync {
    #[must_use]
    pub fn from_counts(transferred: usize, failed: usize, at: i64) -> Self {
        let outcome = match (transferred, failed) {
            (_, 0) => SyncOutcome::Succeeded,
            (0, _) => SyncOutcome::Failed,
            _ => SyncOutcome::Partial,
        };
        Self {
            outcome,
            at,
            transferred,
            failed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    #[serde(default)]
    pub usage: UsageSample,
    #[serde(default)]
    pub last_sync: Option<LastSync>,
}

/// How to reconcile two record sets that both describe the same item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Leave the existing side untouched
    KeepExisting,
    /// Discard the existing side and take the incoming one
    ReplaceWithLegacy,
    /// Add what is missing, never overwrite what exists
    Merge,
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "keep-existing" | "keep" => Ok(Self::KeepExisting),
            "replace-with-legacy" | "replace" => Ok(Self::ReplaceWithLegacy),
            "merge" => Ok(Self::Merge),
            other => Err(format!(
                "unknown policy `{other}` (expected keep-existing, replace-with-legacy or merge)"
            )),
        }
    }
}

/// Keys that differ between two record sets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordDiff {
    pub added: Vec<PortablePath>,
    pub modified: Vec<PortablePath>,
    pub removed: Vec<PortablePath>,
}

impl RecordDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }
}

/// All records of one (item, profile) pair plus per-item metadata.
///
/// This is the durable file format other tools read, so field names are
/// stable and maps are ordered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSet {
    #[serde(default)]
    pub records: BTreeMap<PortablePath, ChecksumRecord>,
    #[serde(default)]
    pub metadata: RecordMetadata,
}

impl RecordSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = ChecksumRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| (r.portable_path.clone(), r))
                .collect(),
            metadata: RecordMetadata::default(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn get(&self, path: &PortablePath) -> Option<&ChecksumRecord> {
        self.records.get(path)
    }

    pub fn get_mut(&mut self, path: &PortablePath) -> Option<&mut ChecksumRecord> {
        self.records.get_mut(path)
    }

    /// Insert or replace the record stored under its portable path
    pub fn upsert(&mut self, record: ChecksumRecord) {
        self.records.insert(record.portable_path.clone(), record);
    }

    /// Start tracking a file explicitly.
    ///
    /// # Errors
    /// Fails if the path cannot be contracted or the file cannot be read.
    pub fn track(&mut self, absolute: &Path, roots: &PathRoots) -> Result<PortablePath> {
        let portable = roots.contract_tracked(absolute)?;
        let checksum =
            ContentHash::from_file(absolute).map_err(|e| SyncError::io(absolute, e))?;
        let size = std::fs::metadata(absolute)
            .map_err(|e| SyncError::io(absolute, e))?
            .len();

        let record = match self.records.remove(&portable) {
            Some(mut existing) => {
                if existing.checksum != checksum {
                    existing.checksum = checksum;
                    existing.last_local_write = unix_now();
                }
                existing.size_bytes = size;
                existing
            }
            None => ChecksumRecord::new(portable.clone(), checksum, size),
        };
        self.upsert(record);
        Ok(portable)
    }

    /// Stop tracking a file. This is the only way a record is removed.
    pub fn untrack(&mut self, path: &PortablePath) -> Option<ChecksumRecord> {
        self.records.remove(path)
    }

    /// Records whose current content has not been confirmed on the remote
    #[must_use]
    pub fn pending_upload(&self) -> Vec<PortablePath> {
        self.records
            .values()
            .filter(|r| r.needs_upload())
            .map(|r| r.portable_path.clone())
            .collect()
    }

    /// Total size of all tracked files
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.records.values().map(|r| r.size_bytes).sum()
    }

    #[must_use]
    pub fn usage(&self) -> UsageSample {
        self.metadata.usage
    }

    /// Accumulate session time into the usage metric
    pub fn add_usage(&mut self, elapsed: Duration, now: i64) {
        let total = self.metadata.usage.cumulative() + elapsed;
        self.metadata.usage = UsageSample::new(total, now);
    }

    /// Compare `self` (the previous state) against `current`.
    ///
    /// Only checksums decide "modified"; size and timestamps are metadata.
    #[must_use]
    pub fn diff(&self, current: &Self) -> RecordDiff {
        let mut diff = RecordDiff::default();

        for (path, record) in &current.records {
            match self.records.get(path) {
                None => diff.added.push(path.clone()),
                Some(old) if old.checksum != record.checksum => diff.modified.push(path.clone()),
                Some(_) => {}
            }
        }

        for path in self.records.keys() {
            if !current.records.contains_key(path) {
                diff.removed.push(path.clone());
            }
        }

        diff
    }

    /// Combine two record sets.
    ///
    /// Keys present on one side only are always carried over. For keys
    /// present in both, `ReplaceWithLegacy` keeps the overlay record,
    /// `KeepExisting` keeps the base record and `Merge` keeps the base
    /// record while folding in the overlay's timestamps when both describe
    /// the same content. The base metadata is kept.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] if any record cannot be expanded
    /// against `roots`.
    pub fn merge(
        base: &Self,
        overlay: &Self,
        policy: ConflictPolicy,
        roots: &PathRoots,
    ) -> Result<Self> {
        for record in base.records.values().chain(overlay.records.values()) {
            roots.expand(&record.portable_path)?;
        }

        let mut merged = base.clone();
        for (path, incoming) in &overlay.records {
            let Some(existing) = merged.records.get_mut(path) else {
                merged.records.insert(path.clone(), incoming.clone());
                continue;
            };

            match policy {
                ConflictPolicy::ReplaceWithLegacy => *existing = incoming.clone(),
                ConflictPolicy::KeepExisting => {}
                ConflictPolicy::Merge => {
                    if existing.checksum == incoming.checksum {
                        existing.last_local_write =
                            existing.last_local_write.max(incoming.last_local_write);
                        existing.last_synchronized =
                            existing.last_synchronized.max(incoming.last_synchronized);
                        if existing.synchronized_checksum.is_none() {
                            existing.synchronized_checksum = incoming.synchronized_checksum;
                        }
                    } else {
                        debug!(path = %path, "merge keeps existing record over differing content");
                    }
                }
            }
        }

        Ok(merged)
    }

    /// Serialise to the on-disk JSON form
    ///
    /// # Errors
    /// Returns an error if serialisation fails
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    /// Parse the on-disk JSON form
    ///
    /// # Errors
    /// Returns an error if the bytes are not a valid record set
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    fn record(path: &str, content: &[u8]) -> ChecksumRecord {
        ChecksumRecord {
            portable_path: PortablePath::parse(path).unwrap(),
            checksum: ContentHash::from_bytes(content),
            size_bytes: content.len() as u64,
            last_local_write: 1_000,
            last_synchronized: None,
            synchronized_checksum: None,
        }
    }

    fn key(path: &str) -> PortablePath {
        PortablePath::parse(path).unwrap()
    }

    #[test]
    fn test_diff_added_modified_removed() {
        let previous = RecordSet::from_records([
            record("%GAMEPATH%/a.sav", b"a"),
            record("%GAMEPATH%/b.sav", b"b"),
        ]);
        let current = RecordSet::from_records([
            record("%GAMEPATH%/a.sav", b"a2"),
            record("%GAMEPATH%/c.sav", b"c"),
        ]);

        let diff = previous.diff(&current);
        assert_eq!(diff.added, vec![key("%GAMEPATH%/c.sav")]);
        assert_eq!(diff.modified, vec![key("%GAMEPATH%/a.sav")]);
        assert_eq!(diff.removed, vec![key("%GAMEPATH%/b.sav")]);
        assert_eq!(diff.len(), 3);
    }

    #[test]
    fn test_diff_ignores_size_and_timestamps() {
        let previous = RecordSet::from_records([record("%GAMEPATH%/a.sav", b"a")]);
        let mut changed = record("%GAMEPATH%/a.sav", b"a");
        changed.size_bytes = 999;
        changed.last_local_write = 5_000;
        changed.last_synchronized = Some(5_000);
        let current = RecordSet::from_records([changed]);

        assert!(previous.diff(&current).is_empty());
    }

    #[test]
    fn test_merge_policies() {
        let roots = PathRoots::new("/games/foo");
        let base = RecordSet::from_records([
            record("%GAMEPATH%/shared.sav", b"base"),
            record("%GAMEPATH%/base_only.sav", b"x"),
        ]);
        let overlay = RecordSet::from_records([
            record("%GAMEPATH%/shared.sav", b"overlay"),
            record("%GAMEPATH%/overlay_only.sav", b"y"),
        ]);

        let replaced =
            RecordSet::merge(&base, &overlay, ConflictPolicy::ReplaceWithLegacy, &roots).unwrap();
        assert_eq!(
            replaced.get(&key("%GAMEPATH%/shared.sav")).unwrap().checksum,
            ContentHash::from_bytes(b"overlay")
        );
        assert_eq!(replaced.len(), 3);

        let kept = RecordSet::merge(&base, &overlay, ConflictPolicy::KeepExisting, &roots).unwrap();
        assert_eq!(
            kept.get(&key("%GAMEPATH%/shared.sav")).unwrap().checksum,
            ContentHash::from_bytes(b"base")
        );
        assert_eq!(kept.len(), 3);

        let merged = RecordSet::merge(&base, &overlay, ConflictPolicy::Merge, &roots).unwrap();
        assert_eq!(
            merged.get(&key("%GAMEPATH%/shared.sav")).unwrap().checksum,
            ContentHash::from_bytes(b"base")
        );
    }

    #[test]
    fn test_merge_same_content_folds_timestamps() {
        let roots = PathRoots::new("/games/foo");
        let base = RecordSet::from_records([record("%GAMEPATH%/a.sav", b"same")]);
        let mut newer = record("%GAMEPATH%/a.sav", b"same");
        newer.last_local_write = 2_000;
        newer.mark_synchronized(2_500);
        let overlay = RecordSet::from_records([newer]);

        let merged = RecordSet::merge(&base, &overlay, ConflictPolicy::Merge, &roots).unwrap();
        let rec = merged.get(&key("%GAMEPATH%/a.sav")).unwrap();
        assert_eq!(rec.last_local_write, 2_000);
        assert_eq!(rec.last_synchronized, Some(2_500));
        assert!(!rec.needs_upload());
    }

    #[test]
    fn test_merge_rejects_unresolvable_record() {
        let roots = PathRoots::new("/games/foo");
        let base = RecordSet::new();
        let overlay = RecordSet::from_records([record("%USERPROFILE%/a.sav", b"a")]);

        let err = RecordSet::merge(&base, &overlay, ConflictPolicy::Merge, &roots).unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
    }

    #[test]
    fn test_track_and_untrack() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("Saves")).unwrap();
        let file = dir.path().join("Saves/slot1.sav");
        fs::write(&file, b"level 3").unwrap();

        let roots = PathRoots::new(dir.path());
        let mut set = RecordSet::new();
        let portable = set.track(&file, &roots).unwrap();

        assert_eq!(portable.as_str(), "%GAMEPATH%/Saves/slot1.sav");
        let rec = set.get(&portable).unwrap();
        assert_eq!(rec.size_bytes, 7);
        assert!(rec.needs_upload());
        assert_eq!(set.pending_upload(), vec![portable.clone()]);

        assert!(set.untrack(&portable).is_some());
        assert!(set.is_empty());
    }

    #[test]
    fn test_track_refuses_file_outside_roots() {
        let install = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        let file = elsewhere.path().join("slot.sav");
        fs::write(&file, b"real save").unwrap();

        let mut set = RecordSet::new();
        let err = set.track(&file, &PathRoots::new(install.path())).unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }), "{err}");
        assert!(set.is_empty());
    }

    #[test]
    fn test_mark_synchronized_clears_pending() {
        let mut rec = record("%GAMEPATH%/a.sav", b"a");
        assert!(rec.needs_upload());
        rec.mark_synchronized(2_000);
        assert!(!rec.needs_upload());
        rec.checksum = ContentHash::from_bytes(b"changed");
        assert!(rec.needs_upload());
    }

    #[test]
    fn test_add_usage_accumulates() {
        let mut set = RecordSet::new();
        set.add_usage(Duration::from_secs(3_600), 10);
        set.add_usage(Duration::from_secs(600), 20);
        assert_eq!(set.usage().cumulative(), Duration::from_secs(4_200));
        assert_eq!(set.usage().as_of, 20);
    }

    #[test]
    fn test_last_sync_from_counts() {
        assert_eq!(LastSync::from_counts(3, 0, 1).outcome, SyncOutcome::Succeeded);
        assert_eq!(LastSync::from_counts(0, 0, 1).outcome, SyncOutcome::Succeeded);
        assert_eq!(LastSync::from_counts(8, 2, 1).outcome, SyncOutcome::Partial);
        assert_eq!(LastSync::from_counts(0, 2, 1).outcome, SyncOutcome::Failed);
    }

    #[test]
    fn test_json_keeps_all_record_fields() {
        let mut rec = record("%GAMEPATH%/Saves/a.sav", b"a");
        rec.mark_synchronized(1_234);
        let mut set = RecordSet::from_records([rec]);
        set.add_usage(Duration::from_secs(90), 77);

        let bytes = set.to_json().unwrap();
        let parsed = RecordSet::from_json(&bytes).unwrap();
        assert_eq!(parsed, set);

        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"%GAMEPATH%/Saves/a.sav\""));
        assert!(text.contains("\"last_synchronized\": 1234"));
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("merge".parse::<ConflictPolicy>(), Ok(ConflictPolicy::Merge));
        assert_eq!(
            "replace-with-legacy".parse::<ConflictPolicy>(),
            Ok(ConflictPolicy::ReplaceWithLegacy)
        );
        assert!("overwrite".parse::<ConflictPolicy>().is_err());
    }
}
