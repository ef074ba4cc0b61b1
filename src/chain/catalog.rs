//! Chain discovery and classification.

use tracing::warn;

use crate::error::{BackupError, Result};
use crate::storage::{is_not_found, join_path, split_path, StorageHandler};

use super::{BackupEntry, BackupKind};

/// Lists one disk directory's backup chain, oldest first.
///
/// A missing directory is an empty chain. A leading run of deltas with no
/// preceding full cannot be restored from; it is dropped from the result
/// and its files are removed best-effort so the next listing starts clean.
pub async fn list_chain(storage: &dyn StorageHandler, dir: &str) -> Result<Vec<BackupEntry>> {
    let files = match storage.list(dir).await {
        Ok(files) => files,
        Err(error) if is_not_found(&error) => Vec::new(),
        Err(error) => return Err(error.into()),
    };

    let mut backups: Vec<BackupEntry> = files
        .iter()
        .filter_map(|name| BackupEntry::parse(name))
        .collect();
    backups.sort_by(|a, b| a.file_name.cmp(&b.file_name));

    let stable_from = backups
        .iter()
        .position(BackupEntry::is_full)
        .unwrap_or(backups.len());
    if stable_from > 0 {
        warn!(dir, orphaned = stable_from, "dropping delta run with no base full");
        for entry in &backups[..stable_from] {
            if let Err(error) = storage.unlink(&join_path(dir, &entry.file_name), true).await {
                warn!(dir, file = %entry.file_name, error = %error, "failed to remove orphaned delta");
            }
        }
    }

    Ok(backups.split_off(stable_from))
}

/// Resolves the inclusive `[full ..= target]` slice of chain filenames the
/// given backup depends on.
pub async fn dependency_chain(
    storage: &dyn StorageHandler,
    target_path: &str,
) -> Result<Vec<String>> {
    let (dir, file_name) = split_path(target_path);
    let backups = list_chain(storage, dir).await?;

    let Some(target) = BackupEntry::parse(file_name)
        .and_then(|wanted| backups.iter().position(|entry| entry.timestamp == wanted.timestamp))
    else {
        return Err(BackupError::NotFound(format!(
            "backup {target_path} is not in its chain"
        )));
    };

    let mut base = target;
    while base > 0 && backups[base].kind == BackupKind::Delta {
        base -= 1;
    }
    if backups[base].kind != BackupKind::Full {
        return Err(BackupError::CorruptChain(target_path.to_string()));
    }

    Ok(backups[base..=target]
        .iter()
        .map(|entry| entry.file_name.clone())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStorage;

    fn seeded(chain: &[&str]) -> MemoryStorage {
        let storage = MemoryStorage::new();
        for name in chain {
            let with_checksum = name.contains("_delta.");
            storage.insert(&format!("disk_a/{name}"), b"image", with_checksum);
        }
        storage
    }

    #[tokio::test]
    async fn missing_directory_lists_as_empty() {
        let storage = MemoryStorage::new();
        let chain = list_chain(&storage, "disk_missing").await.unwrap();
        assert!(chain.is_empty());
    }

    #[tokio::test]
    async fn sorts_and_ignores_foreign_files() {
        let storage = seeded(&[
            "20260103T000000Z_delta.vhd",
            "20260101T000000Z_full.vhd",
            "20260102T000000Z_delta.vhd",
        ]);
        storage.insert("disk_a/notes.txt", b"not a backup", false);

        let chain = list_chain(&storage, "disk_a").await.unwrap();
        let names: Vec<_> = chain.iter().map(|entry| entry.file_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "20260101T000000Z_full.vhd",
                "20260102T000000Z_delta.vhd",
                "20260103T000000Z_delta.vhd",
            ]
        );
    }

    #[tokio::test]
    async fn leading_delta_run_is_pruned_and_deleted() {
        // First full at index 2: indices [0, 2) are orphaned.
        let storage = seeded(&[
            "20260101T000000Z_delta.vhd",
            "20260102T000000Z_delta.vhd",
            "20260103T000000Z_full.vhd",
            "20260104T000000Z_delta.vhd",
        ]);

        let chain = list_chain(&storage, "disk_a").await.unwrap();
        let names: Vec<_> = chain.iter().map(|entry| entry.file_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["20260103T000000Z_full.vhd", "20260104T000000Z_delta.vhd"]
        );
        assert!(!storage.contains("disk_a/20260101T000000Z_delta.vhd"));
        assert!(!storage.contains("disk_a/20260102T000000Z_delta.vhd"));
        assert!(storage.contains("disk_a/20260103T000000Z_full.vhd"));
    }

    #[tokio::test]
    async fn dependency_chain_spans_full_through_target() {
        let storage = seeded(&[
            "20260101T000000Z_full.vhd",
            "20260102T000000Z_delta.vhd",
            "20260103T000000Z_full.vhd",
            "20260104T000000Z_delta.vhd",
            "20260105T000000Z_delta.vhd",
        ]);

        let chain = dependency_chain(&storage, "disk_a/20260105T000000Z_delta.vhd")
            .await
            .unwrap();
        assert_eq!(
            chain,
            vec![
                "20260103T000000Z_full.vhd",
                "20260104T000000Z_delta.vhd",
                "20260105T000000Z_delta.vhd",
            ]
        );

        // A full depends only on itself.
        let chain = dependency_chain(&storage, "disk_a/20260103T000000Z_full.vhd")
            .await
            .unwrap();
        assert_eq!(chain, vec!["20260103T000000Z_full.vhd"]);
    }

    #[tokio::test]
    async fn unknown_target_fails_not_found() {
        let storage = seeded(&["20260101T000000Z_full.vhd"]);
        let error = dependency_chain(&storage, "disk_a/20990101T000000Z_delta.vhd")
            .await
            .unwrap_err();
        assert!(matches!(error, BackupError::NotFound(_)));
    }
}
