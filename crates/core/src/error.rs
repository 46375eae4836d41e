//! Error taxonomy for the sync engine

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the core engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed portable path, or one that cannot be resolved against the given roots.
    /// Local and non-retryable.
    #[error("invalid portable path `{path}`: {reason}")]
    Validation { path: String, reason: String },

    /// Remote collaborator failed (subprocess error, unreachable remote).
    #[error("transport failure: {0}")]
    TransientTransport(String),

    /// Remote collaborator did not answer within the caller's timeout.
    #[error("transport timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The record set could not be written back.
    #[error("failed to persist record set for {item}: {reason}")]
    Persistence { item: String, reason: String },

    /// Local file could not be read.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    pub(crate) fn validation(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientTransport(_) | Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
