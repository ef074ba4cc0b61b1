//! Remote file-storage abstraction.
//!
//! Paths are `/`-joined relative segments against the handler's root; an
//! empty path is the root itself. The transport behind a handler (local
//! disk, NFS, SMB, ...) is not this crate's concern.

pub mod local;

use std::io;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::error::{BackupError, Result};

pub type ReadStream = Pin<Box<dyn AsyncRead + Send>>;
pub type WriteStream = Pin<Box<dyn AsyncWrite + Send>>;

/// Checksum handling for reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumVerify {
    /// Read raw bytes, no verification.
    Skip,
    /// Fail `NotFound` when no checksum is recorded for the file; a
    /// mismatch surfaces as `InvalidData` once the stream is drained.
    Require,
    /// Verify when a checksum is recorded, read raw otherwise.
    IfPresent,
}

#[async_trait]
pub trait StorageHandler: Send + Sync {
    /// Lists the entries directly under `dir` (`""` is the root).
    async fn list(&self, dir: &str) -> io::Result<Vec<String>>;

    async fn create_read_stream(&self, path: &str, verify: ChecksumVerify)
        -> io::Result<ReadStream>;

    /// Opens `path` for writing. With `checksum` the handler records a
    /// digest alongside the file once the stream is shut down.
    async fn create_output_stream(&self, path: &str, checksum: bool) -> io::Result<WriteStream>;

    /// Removes `path`; `with_checksum` also drops any recorded digest.
    async fn unlink(&self, path: &str, with_checksum: bool) -> io::Result<()>;

    /// Renames a file together with any recorded digest.
    async fn rename(&self, from: &str, to: &str) -> io::Result<()>;

    async fn output_file(&self, path: &str, contents: Bytes) -> io::Result<()>;

    async fn read_file(&self, path: &str) -> io::Result<Bytes>;
}

/// `/`-join of storage path segments; an empty `dir` means the root.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Splits into `(parent, file name)`; files at the root have an empty
/// parent.
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => ("", path),
    }
}

pub(crate) fn is_not_found(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::NotFound
}

pub(crate) fn checksum_mismatch(path: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("checksum mismatch: {path}"),
    )
}

/// A configured backup target. Every operation validates `enabled` before
/// touching the remote.
#[derive(Clone)]
pub struct RemoteRepository {
    id: Uuid,
    name: String,
    enabled: bool,
    handler: Arc<dyn StorageHandler>,
}

impl RemoteRepository {
    pub fn new(name: impl Into<String>, handler: Arc<dyn StorageHandler>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            enabled: true,
            handler,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn handler(&self) -> Result<&Arc<dyn StorageHandler>> {
        if !self.enabled {
            return Err(BackupError::RemoteUnavailable(self.name.clone()));
        }
        Ok(&self.handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers_treat_the_root_as_empty() {
        assert_eq!(join_path("", "a.ova"), "a.ova");
        assert_eq!(join_path("vm_delta_t_x", "disk_y"), "vm_delta_t_x/disk_y");
        assert_eq!(split_path("a.ova"), ("", "a.ova"));
        assert_eq!(
            split_path("vm_delta_t_x/disk_y/b.vhd"),
            ("vm_delta_t_x/disk_y", "b.vhd")
        );
    }

    #[tokio::test]
    async fn disabled_remote_is_unavailable() {
        let mut remote = RemoteRepository::new(
            "offsite",
            Arc::new(crate::testing::MemoryStorage::new()) as Arc<dyn StorageHandler>,
        );
        assert!(remote.handler().is_ok());

        remote.set_enabled(false);
        assert!(matches!(
            remote.handler(),
            Err(BackupError::RemoteUnavailable(name)) if name == "offsite"
        ));
    }
}
