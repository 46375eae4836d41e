//! Local directory transport
//!
//! Treats a directory on this machine as the remote. Remote paths are
//! `/`-separated and relative to that directory. Useful for tests and for
//! remotes that are already mounted (network shares, synced folders).

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use savesync_core::record::RecordSet;
use savesync_core::remote::{Direction, RemoteTransport, TransportError, remote_join};
use savesync_core::store::RECORDS_FILE;
use tracing::debug;

/// Transport over a local directory
#[derive(Debug, Clone)]
pub struct LocalTransport {
    root: PathBuf,
}

impl LocalTransport {
    /// Create a new local transport rooted at `root`
    ///
    /// # Errors
    /// Returns an error if the root cannot be created
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, TransportError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a remote path below the root, refusing anything that escapes it
    fn resolve(&self, remote: &str) -> Result<PathBuf, TransportError> {
        let relative = Path::new(remote.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("remote path escapes the transport root: {remote}"),
            )));
        }
        Ok(self.root.join(relative))
    }
}

fn copy_file(from: &Path, to: &Path) -> Result<(), TransportError> {
    if !from.is_file() {
        return Err(TransportError::NotFound(from.display().to_string()));
    }
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(from, to)?;
    Ok(())
}

#[async_trait]
impl RemoteTransport for LocalTransport {
    async fn fetch_record_set(
        &self,
        remote_dir: &str,
    ) -> Result<Option<RecordSet>, TransportError> {
        let path = self.resolve(&remote_join(remote_dir, RECORDS_FILE))?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        RecordSet::from_json(&bytes)
            .map(Some)
            .map_err(|e| TransportError::Decode(format!("{}: {e}", path.display())))
    }

    async fn put_record_set(
        &self,
        remote_dir: &str,
        records: &RecordSet,
    ) -> Result<(), TransportError> {
        let path = self.resolve(&remote_join(remote_dir, RECORDS_FILE))?;
        let bytes = records
            .to_json()
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        debug!(path = %path.display(), records = records.len(), "wrote record set");
        Ok(())
    }

    async fn transfer(
        &self,
        local: &Path,
        remote: &str,
        direction: Direction,
    ) -> Result<(), TransportError> {
        let remote = self.resolve(remote)?;
        match direction {
            Direction::Upload => copy_file(local, &remote),
            Direction::Download => copy_file(&remote, local),
        }
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), TransportError> {
        copy_file(&self.resolve(from)?, &self.resolve(to)?)
    }

    async fn purge(&self, remote_dir: &str) -> Result<(), TransportError> {
        let path = self.resolve(remote_dir)?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
