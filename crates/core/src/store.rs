//! Record set persistence, one JSON file per (item, profile)

use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::record::RecordSet;
use crate::remote::remote_join;

/// File name of a persisted record set, locally and on the remote
pub const RECORDS_FILE: &str = "records.json";

/// Identifies one record set: an item (application) and a profile within it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    item_id: String,
    profile_id: String,
}

impl ItemKey {
    /// # Errors
    /// Returns [`SyncError::Validation`] if either id is empty or could
    /// escape its folder.
    pub fn new(item_id: impl Into<String>, profile_id: impl Into<String>) -> Result<Self> {
        let item_id = item_id.into();
        let profile_id = profile_id.into();
        for id in [&item_id, &profile_id] {
            if id.trim().is_empty()
                || id == "."
                || id == ".."
                || id.contains(['/', '\\', ':'])
            {
                return Err(SyncError::validation(id.as_str(), "not a valid item or profile id"));
            }
        }
        Ok(Self {
            item_id,
            profile_id,
        })
    }

    #[must_use]
    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    #[must_use]
    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    /// Folder of this record set below a remote root
    #[must_use]
    pub fn remote_dir(&self, remote_root: &str) -> String {
        remote_join(
            remote_root,
            &format!("{}/{}", self.item_id, self.profile_id),
        )
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.item_id, self.profile_id)
    }
}

/// Persistence collaborator for record sets
pub trait RecordStore: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet
    fn load(&self, key: &ItemKey) -> Result<Option<RecordSet>>;

    /// Must fail loudly: a lost save means duplicate uploads next run
    fn save(&self, key: &ItemKey, records: &RecordSet) -> Result<()>;
}

/// Load the record set, treating both absence and a failed load as "no prior state"
pub fn load_or_empty<S: RecordStore + ?Sized>(store: &S, key: &ItemKey) -> RecordSet {
    match store.load(key) {
        Ok(Some(records)) => records,
        Ok(None) => {
            debug!(%key, "no stored record set");
            RecordSet::new()
        }
        Err(e) => {
            warn!(%key, error = %e, "failed to load record set, starting from empty");
            RecordSet::new()
        }
    }
}

/// Stores record sets under `<root>/<item>/<profile>/records.json`
#[derive(Debug, Clone)]
pub struct FsRecordStore {
    root: PathBuf,
}

impl FsRecordStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn path_for(&self, key: &ItemKey) -> PathBuf {
        self.root
            .join(key.item_id())
            .join(key.profile_id())
            .join(RECORDS_FILE)
    }
}

impl RecordStore for FsRecordStore {
    fn load(&self, key: &ItemKey) -> Result<Option<RecordSet>> {
        let path = self.path_for(key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::io(path, e)),
        };

        RecordSet::from_json(&bytes)
            .map(Some)
            .map_err(|e| SyncError::Persistence {
                item: key.to_string(),
                reason: format!("{}: {e}", path.display()),
            })
    }

    fn save(&self, key: &ItemKey, records: &RecordSet) -> Result<()> {
        let path = self.path_for(key);
        let persistence = |reason: String| SyncError::Persistence {
            item: key.to_string(),
            reason,
        };

        let dir = path
            .parent()
            .ok_or_else(|| persistence(format!("{} has no parent", path.display())))?;
        std::fs::create_dir_all(dir).map_err(|e| persistence(e.to_string()))?;

        let bytes = records.to_json().map_err(|e| persistence(e.to_string()))?;

        // Write beside the target and rename so readers never see a partial file
        let mut temp =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| persistence(e.to_string()))?;
        temp.write_all(&bytes)
            .map_err(|e| persistence(e.to_string()))?;
        temp.persist(&path)
            .map_err(|e| persistence(e.error.to_string()))?;

        debug!(%key, records = records.len(), "saved record set");
        Ok(())
    }
}
