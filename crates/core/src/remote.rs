//! The remote storage seam
//!
//! The engine never builds transport-specific commands; it hands opaque
//! remote path strings to a [`RemoteTransport`] and bounds every call with a
//! caller-chosen timeout.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::SyncError;
use crate::record::RecordSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("remote path not found: {0}")]
    NotFound(String),

    #[error("`{command}` exited with {status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("failed to spawn transport process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed remote record set: {0}")]
    Decode(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(after) => SyncError::Timeout(after),
            other => SyncError::TransientTransport(other.to_string()),
        }
    }
}

/// Remote storage collaborator.
///
/// Remote paths are opaque strings built with [`remote_join`].
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Fetch the record set stored in `remote_dir`, `Ok(None)` if there is none
    async fn fetch_record_set(&self, remote_dir: &str)
    -> Result<Option<RecordSet>, TransportError>;

    /// Write `records` as the record set of `remote_dir`
    async fn put_record_set(
        &self,
        remote_dir: &str,
        records: &RecordSet,
    ) -> Result<(), TransportError>;

    /// Move one file between this machine and the remote
    async fn transfer(
        &self,
        local: &Path,
        remote: &str,
        direction: Direction,
    ) -> Result<(), TransportError>;

    /// Copy one file between two remote locations
    async fn copy(&self, from: &str, to: &str) -> Result<(), TransportError>;

    /// Delete everything under `remote_dir`. A missing directory is not an error.
    async fn purge(&self, remote_dir: &str) -> Result<(), TransportError>;
}

/// Bound a transport call by `limit`; running out of time is a [`TransportError::Timeout`]
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(limit)),
    }
}

/// Join remote path segments with `/`, leaving `remote:` prefixes intact
#[must_use]
pub fn remote_join(base: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches('/');
    if base.is_empty() {
        relative.to_string()
    } else if relative.is_empty() {
        base.to_string()
    } else if base.ends_with('/') || base.ends_with(':') {
        format!("{base}{relative}")
    } else {
        format!("{base}/{relative}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_join() {
        assert_eq!(remote_join("gdrive:", "saves/foo"), "gdrive:saves/foo");
        assert_eq!(remote_join("gdrive:backup", "saves"), "gdrive:backup/saves");
        assert_eq!(remote_join("gdrive:backup/", "/saves"), "gdrive:backup/saves");
        assert_eq!(remote_join("", "saves"), "saves");
        assert_eq!(remote_join("gdrive:x", ""), "gdrive:x");
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expires() {
        let result: Result<(), _> = with_timeout(Duration::from_secs(5), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(TransportError::Timeout(d)) if d == Duration::from_secs(5)));
    }

    #[test]
    fn test_timeout_maps_to_sync_timeout() {
        let err: SyncError = TransportError::Timeout(Duration::from_secs(3)).into();
        assert!(matches!(err, SyncError::Timeout(_)));
        assert!(err.is_retryable());

        let err: SyncError = TransportError::NotFound("x".into()).into();
        assert!(matches!(err, SyncError::TransientTransport(_)));
    }
}
