//! Error taxonomy for the backup engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    /// A listing, chain entry or metadata pointer resolved to nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// A delta was requested whose chain has no preceding full backup.
    #[error("no full backup precedes {0} in its chain")]
    CorruptChain(String),

    /// The metadata's version field is outside the supported range.
    #[error("unsupported delta backup version: {0}")]
    UnsupportedVersion(String),

    /// A stored file no longer matches its recorded checksum.
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    /// The remote repository is disabled; validated before any remote call.
    #[error("remote {0} is disabled")]
    RemoteUnavailable(String),

    /// One or more disk saves failed within a single backup job.
    #[error("{failed} of {total} disk backups failed")]
    PartialBackupFailure { failed: usize, total: usize },

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Collaborator (hypervisor, merge primitive) failures.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BackupError>;
