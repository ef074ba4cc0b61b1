//! Chain consolidation.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::{BackupError, Result};
use crate::storage::{is_not_found, join_path, ChecksumVerify, StorageHandler};

use super::{backup_file_name, catalog, BackupKind};

/// Opaque incremental-image merge primitive: folds the image at
/// `delta_path` into the image at `base_path`, in place.
#[async_trait]
pub trait ImageMerger: Send + Sync {
    async fn merge(
        &self,
        storage: &dyn StorageHandler,
        base_path: &str,
        delta_path: &str,
    ) -> anyhow::Result<()>;
}

/// Verifies a stored file against its recorded checksum by draining it.
/// Nothing to verify (no file, or no recorded checksum) passes.
pub async fn check_file_integrity(storage: &dyn StorageHandler, path: &str) -> Result<()> {
    let mut stream = match storage.create_read_stream(path, ChecksumVerify::Require).await {
        Ok(stream) => stream,
        Err(error) if is_not_found(&error) => return Ok(()),
        Err(error) => return Err(error.into()),
    };

    match tokio::io::copy(&mut stream, &mut tokio::io::sink()).await {
        Ok(_) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::InvalidData => {
            Err(BackupError::ChecksumMismatch(path.to_string()))
        }
        Err(error) => Err(error.into()),
    }
}

/// Consolidates delta chains down to the retention depth.
#[derive(Clone)]
pub struct ChainMerger {
    merger: Arc<dyn ImageMerger>,
}

impl ChainMerger {
    pub fn new(merger: Arc<dyn ImageMerger>) -> Self {
        Self { merger }
    }

    /// Folds the oldest entries of the chain in `dir` into their base
    /// until the chain is `depth` long. A chain already within the depth
    /// is left untouched, so repeated calls are no-ops.
    pub async fn merge_if_needed(
        &self,
        storage: &dyn StorageHandler,
        dir: &str,
        depth: usize,
    ) -> Result<()> {
        let backups = catalog::list_chain(storage, dir).await?;
        if backups.len() <= depth {
            return Ok(());
        }
        let target = backups.len() - depth;

        check_file_integrity(storage, &join_path(dir, &backups[target].file_name)).await?;
        let consolidated = join_path(
            dir,
            &backup_file_name(&backups[target].timestamp, BackupKind::Full),
        );

        let mut base = target;
        while base > 0 && backups[base].kind == BackupKind::Delta {
            base -= 1;
        }

        // Nothing before the merge base is reachable from a retained
        // backup any more.
        for entry in backups[..base].iter().rev() {
            if let Err(unlink_error) =
                storage.unlink(&join_path(dir, &entry.file_name), true).await
            {
                warn!(dir, file = %entry.file_name, error = %unlink_error, "failed to remove obsolete backup");
            }
        }

        let parent = join_path(dir, &backups[base].file_name);
        for entry in &backups[base + 1..=target] {
            let path = join_path(dir, &entry.file_name);
            check_file_integrity(storage, &path).await?;
            if let Err(merge_error) = self.merger.merge(storage, &parent, &path).await {
                error!(dir, file = %entry.file_name, error = %merge_error, "merge primitive failed");
                return Err(merge_error.into());
            }
            storage.unlink(&path, true).await?;
        }

        storage.rename(&parent, &consolidated).await?;
        info!(dir, chain_length = depth, consolidated = %consolidated, "merged delta chain");
        Ok(())
    }
}
