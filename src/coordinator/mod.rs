//! Delta backup transactions.
//!
//! The coordinator drives full/delta VM exports, per-disk persistence,
//! chain consolidation, retention and imports, against two independent,
//! non-transactional back ends. Every multistep operation runs under a
//! [`CompensationStack`] so a partial failure leaves no orphaned
//! hypervisor or storage resource behind.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::Arc;

use futures_util::future::{join_all, try_join_all};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::chain::{self, backup_file_name, catalog, merge::ChainMerger, timestamp_now, BackupKind};
use crate::compensation::CompensationStack;
use crate::error::{BackupError, Result};
use crate::hypervisor::{
    AttachmentKind, DeltaExport, DeltaExportOptions, DeltaImport, ExportStream,
    HypervisorConnection, SnapshotRecord, VmRecord,
};
use crate::metadata::{DeltaBackupMetadata, ImportFormat};
use crate::retention;
use crate::storage::{
    is_not_found, join_path, split_path, ChecksumVerify, RemoteRepository, StorageHandler,
};

/// Label of the per-tag base snapshot a delta export is taken against.
fn base_snapshot_label(tag: &str) -> String {
    format!("delta_base_{tag}")
}

/// Dispatches best-effort background cleanup; failures are logged, never
/// awaited for correctness.
fn spawn_cleanup<F>(task: &'static str, cleanup: F)
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(cleanup_error) = cleanup.await {
            warn!(task, error = %cleanup_error, "background cleanup failed");
        }
    });
}

pub struct DeltaExportCoordinator {
    hypervisor: Arc<dyn HypervisorConnection>,
    merger: ChainMerger,
}

impl DeltaExportCoordinator {
    pub fn new(hypervisor: Arc<dyn HypervisorConnection>, merger: ChainMerger) -> Self {
        Self { hypervisor, merger }
    }

    /// Takes a delta backup of `vm_id` against its most recent base
    /// snapshot (full when no base exists) and bounds the per-disk chains
    /// and metadata history to `depth`. Returns the backup's logical
    /// (extension-less) metadata path.
    pub async fn rolling_delta_backup(
        &self,
        vm_id: Uuid,
        remote: &RemoteRepository,
        tag: &str,
        depth: usize,
    ) -> Result<String> {
        let storage = remote.handler()?.clone();
        let vm = self.hypervisor.vm(vm_id).await?;

        // Newest prior base for this tag; older same-tag bases only waste
        // space on the hypervisor.
        let label = base_snapshot_label(tag);
        let mut bases: Vec<SnapshotRecord> = self
            .hypervisor
            .snapshots(vm_id)
            .await?
            .into_iter()
            .filter(|snapshot| snapshot.label == label)
            .collect();
        bases.sort_by_key(|snapshot| snapshot.created_at);
        let base = bases.pop();
        for stale in bases {
            let hypervisor = Arc::clone(&self.hypervisor);
            spawn_cleanup("delete stale base snapshot", async move {
                hypervisor.delete_snapshot(stale.id).await
            });
        }

        let dir = chain::delta_backup_dir(tag, vm.id);

        // A disk whose chain holds no full yet cannot anchor a delta.
        let attachments = self.hypervisor.attachments(vm_id).await?;
        let disk_ids: Vec<Uuid> = attachments
            .iter()
            .filter(|attachment| attachment.kind == AttachmentKind::Disk)
            .filter_map(|attachment| attachment.disk)
            .collect();
        let force_full: Vec<Uuid> = try_join_all(disk_ids.iter().map(|&disk_id| {
            let storage = &storage;
            let dir = dir.as_str();
            async move {
                let disk = self.hypervisor.disk(disk_id).await?;
                let chain_dir = join_path(dir, &chain::disk_backup_dir(disk.id));
                let backups = catalog::list_chain(storage.as_ref(), &chain_dir).await?;
                Ok::<_, BackupError>((disk.id, !backups.iter().any(|entry| entry.is_full())))
            }
        }))
        .await?
        .into_iter()
        .filter(|(_, missing_full)| *missing_full)
        .map(|(disk_id, _)| disk_id)
        .collect();

        CompensationStack::run(|rollback| {
            self.run_delta_backup(rollback, storage, vm, base, dir, force_full, label, depth)
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_delta_backup(
        &self,
        rollback: CompensationStack,
        storage: Arc<dyn StorageHandler>,
        vm: VmRecord,
        base: Option<SnapshotRecord>,
        dir: String,
        force_full: Vec<Uuid>,
        snapshot_label: String,
        depth: usize,
    ) -> Result<String> {
        let export = self
            .hypervisor
            .export_delta_vm(
                vm.id,
                base.as_ref().map(|snapshot| snapshot.id),
                DeltaExportOptions {
                    snapshot_label,
                    force_full_disks: force_full.clone(),
                },
            )
            .await?;
        let DeltaExport {
            vm: vm_descriptor,
            mut disks,
            attachments,
            snapshot,
            streams,
            format_version,
        } = export;

        // Mandatory: open export streams and the transient export snapshot
        // must not outlive a failed backup.
        {
            let tokens: Vec<_> = streams.values().map(ExportStream::cancel_token).collect();
            let hypervisor = Arc::clone(&self.hypervisor);
            let snapshot_id = snapshot.id;
            rollback.register("cancel export", move || async move {
                for token in &tokens {
                    token.cancel();
                }
                hypervisor.delete_snapshot(snapshot_id).await
            });
        }

        // Persist every disk stream; siblings run to completion no matter
        // what the others do.
        let timestamp = timestamp_now();
        let total = streams.len();
        let base_missing = base.is_none();
        let force_full = &force_full;
        let saves = streams.into_iter().map(|(key, stream)| {
            let storage = Arc::clone(&storage);
            let dir = dir.clone();
            let timestamp = timestamp.clone();
            let descriptor = disks.get(&key).cloned();
            async move {
                let outcome = match descriptor {
                    Some(disk) => {
                        let kind = if base_missing || force_full.contains(&disk.id) {
                            BackupKind::Full
                        } else {
                            BackupKind::Delta
                        };
                        save_disk_backup(storage.as_ref(), &dir, disk.id, kind, &timestamp, stream)
                            .await
                    }
                    None => Err(BackupError::NotFound(format!(
                        "export stream {key} has no disk descriptor"
                    ))),
                };
                (key, outcome)
            }
        });
        let outcomes = join_all(saves).await;

        let mut saved = Vec::new();
        let mut failed = 0usize;
        for (key, outcome) in outcomes {
            match outcome {
                Ok(relative_path) => {
                    if let Some(disk) = disks.get_mut(&key) {
                        disk.relative_path = Some(relative_path.clone());
                    }
                    saved.push(relative_path);
                }
                Err(save_error) => {
                    error!(disk = %key, error = %save_error, "disk backup failed");
                    failed += 1;
                }
            }
        }

        {
            let storage = Arc::clone(&storage);
            let dir = dir.clone();
            let saved = saved.clone();
            rollback.register("remove saved disk backups", move || async move {
                for relative_path in &saved {
                    if let Err(unlink_error) =
                        storage.unlink(&join_path(&dir, relative_path), true).await
                    {
                        warn!(file = %relative_path, error = %unlink_error, "failed to remove saved disk backup");
                    }
                }
                Ok(())
            });
        }

        if failed > 0 {
            return Err(BackupError::PartialBackupFailure { failed, total });
        }

        // The descriptor is only written once every stream is safely on
        // the remote; its existence implies a restorable backup.
        let metadata = DeltaBackupMetadata {
            format_version: Some(format_version),
            vm: vm_descriptor,
            disks,
            attachments,
        };
        let logical_path = join_path(&dir, &format!("{timestamp}_{}", vm.name));
        let metadata_path = format!("{logical_path}.{}", chain::METADATA_EXT);
        {
            let storage = Arc::clone(&storage);
            let metadata_path = metadata_path.clone();
            rollback.register("remove backup metadata", move || async move {
                storage.unlink(&metadata_path, false).await.map_err(Into::into)
            });
        }
        storage
            .output_file(&metadata_path, serde_json::to_vec_pretty(&metadata)?.into())
            .await?;

        // The backup is complete, so the chains can be consolidated. A
        // merge failure aborts the whole call: the fresh artifacts are
        // rolled back and the chain keeps its previous, still-valid shape.
        for relative_path in &saved {
            let (disk_dir, _) = split_path(relative_path);
            self.merger
                .merge_if_needed(storage.as_ref(), &join_path(&dir, disk_dir), depth)
                .await?;
        }

        self.prune_metadata_history(&storage, &dir, depth).await?;

        if let Some(base) = base {
            let hypervisor = Arc::clone(&self.hypervisor);
            spawn_cleanup("delete prior base snapshot", async move {
                hypervisor.delete_snapshot(base.id).await
            });
        }

        info!(vm = %vm.name, backup = %logical_path, disks = total, "rolling delta backup completed");
        Ok(logical_path)
    }

    /// Prunes this VM/tag's metadata history to `depth`. Each pruned
    /// descriptor's legacy whole-image sibling is dropped in the
    /// background.
    async fn prune_metadata_history(
        &self,
        storage: &Arc<dyn StorageHandler>,
        dir: &str,
        depth: usize,
    ) -> Result<()> {
        let files = match storage.list(dir).await {
            Ok(files) => files,
            Err(list_error) if is_not_found(&list_error) => return Ok(()),
            Err(list_error) => return Err(list_error.into()),
        };

        let metadata_suffix = format!(".{}", chain::METADATA_EXT);
        let mut history: Vec<String> = files
            .into_iter()
            .filter(|name| name.ends_with(&metadata_suffix))
            .collect();
        history.sort();

        retention::prune(history, depth, |name| {
            let storage = Arc::clone(storage);
            let dir = dir.to_string();
            let metadata_suffix = metadata_suffix.clone();
            async move {
                storage.unlink(&join_path(&dir, &name), false).await?;

                let stem = name.strip_suffix(&metadata_suffix).unwrap_or(&name);
                let sibling = join_path(&dir, &format!("{stem}.{}", chain::FULL_IMAGE_EXT));
                spawn_cleanup("remove legacy backup image", async move {
                    match storage.unlink(&sibling, false).await {
                        Ok(()) => Ok(()),
                        Err(unlink_error) if is_not_found(&unlink_error) => Ok(()),
                        Err(unlink_error) => Err(unlink_error.into()),
                    }
                });
                Ok(())
            }
        })
        .await?;
        Ok(())
    }

    /// Restores a delta backup identified by its logical metadata path.
    pub async fn import_delta_backup(
        &self,
        remote: &RemoteRepository,
        file_path: &str,
        target_sr: Uuid,
    ) -> Result<VmRecord> {
        let storage = remote.handler()?.clone();
        let raw = storage
            .read_file(&format!("{file_path}.{}", chain::METADATA_EXT))
            .await?;
        let metadata: DeltaBackupMetadata = serde_json::from_slice(&raw)?;

        let vm = match metadata.import_format()? {
            ImportFormat::Current => {
                self.import_current(&storage, file_path, metadata, target_sr).await?
            }
            ImportFormat::Legacy => {
                self.import_legacy(&storage, file_path, metadata, target_sr).await?
            }
        };
        info!(vm = %vm.name, backup = file_path, "delta backup imported");
        Ok(vm)
    }

    /// Current (`^1`) restore: the hypervisor receives each disk's ordered
    /// chain streams and owns the replay.
    async fn import_current(
        &self,
        storage: &Arc<dyn StorageHandler>,
        file_path: &str,
        metadata: DeltaBackupMetadata,
        target_sr: Uuid,
    ) -> Result<VmRecord> {
        let (base_dir, _) = split_path(file_path);

        let mut disk_streams = HashMap::new();
        for (key, disk) in &metadata.disks {
            let Some(relative_path) = disk.relative_path.as_deref() else {
                return Err(BackupError::NotFound(format!(
                    "disk {key} records no backup path"
                )));
            };
            let target = join_path(base_dir, relative_path);
            let (disk_dir, _) = split_path(&target);
            let chain_files = catalog::dependency_chain(storage.as_ref(), &target).await?;

            let mut streams = Vec::with_capacity(chain_files.len());
            for file_name in &chain_files {
                streams.push(
                    storage
                        .create_read_stream(
                            &join_path(disk_dir, file_name),
                            ChecksumVerify::IfPresent,
                        )
                        .await?,
                );
            }
            disk_streams.insert(key.clone(), streams);
        }

        Ok(self
            .hypervisor
            .import_delta_vm(
                DeltaImport {
                    metadata,
                    disk_streams,
                },
                target_sr,
            )
            .await?)
    }

    /// Version 0 restore: the VM shell comes from the whole-image sibling
    /// and each disk is rebuilt by replaying its chain through the content
    /// importer. Partially imported resources are compensation-deleted.
    async fn import_legacy(
        &self,
        storage: &Arc<dyn StorageHandler>,
        file_path: &str,
        metadata: DeltaBackupMetadata,
        target_sr: Uuid,
    ) -> Result<VmRecord> {
        let (base_dir, _) = split_path(file_path);

        CompensationStack::run(|rollback| async move {
            let shell = storage
                .create_read_stream(
                    &format!("{file_path}.{}", chain::FULL_IMAGE_EXT),
                    ChecksumVerify::Skip,
                )
                .await?;
            let vm = self.hypervisor.import_vm_image(shell, target_sr, true).await?;
            {
                let hypervisor = Arc::clone(&self.hypervisor);
                let vm_id = vm.id;
                rollback.register("delete imported vm shell", move || async move {
                    hypervisor.delete_vm(vm_id).await
                });
            }

            for (key, descriptor) in &metadata.disks {
                let Some(relative_path) = descriptor.relative_path.as_deref() else {
                    return Err(BackupError::NotFound(format!(
                        "disk {key} records no backup path"
                    )));
                };

                let disk = self.hypervisor.create_disk(target_sr, descriptor).await?;
                {
                    let hypervisor = Arc::clone(&self.hypervisor);
                    let disk_id = disk.id;
                    rollback.register("delete imported disk", move || async move {
                        hypervisor.delete_disk(disk_id).await
                    });
                }

                let target = join_path(base_dir, relative_path);
                let (disk_dir, _) = split_path(&target);
                for file_name in &catalog::dependency_chain(storage.as_ref(), &target).await? {
                    let stream = storage
                        .create_read_stream(&join_path(disk_dir, file_name), ChecksumVerify::Skip)
                        .await?;
                    self.hypervisor.import_disk_content(disk.id, stream).await?;
                }

                for attachment in metadata
                    .attachments
                    .iter()
                    .filter(|attachment| attachment.disk_key == *key)
                {
                    self.hypervisor.attach_disk(vm.id, disk.id, attachment).await?;
                }
            }

            Ok(vm)
        })
        .await
    }
}

/// Persists one export stream under its disk's chain directory, returning
/// the path relative to the VM's delta root. A partially written file left
/// by a failed copy is removed best-effort.
async fn save_disk_backup(
    storage: &dyn StorageHandler,
    dir: &str,
    disk_id: Uuid,
    kind: BackupKind,
    timestamp: &str,
    stream: ExportStream,
) -> Result<String> {
    let relative_path = join_path(&chain::disk_backup_dir(disk_id), &backup_file_name(timestamp, kind));
    let full_path = join_path(dir, &relative_path);

    // Full images carry no checksum: a later merge rewrites them in place,
    // which would invalidate the recorded digest.
    let with_checksum = kind == BackupKind::Delta;

    let (mut reader, cancel) = stream.into_parts();
    let copy_result = async {
        let mut target = storage.create_output_stream(&full_path, with_checksum).await?;
        tokio::select! {
            copied = tokio::io::copy(&mut reader, &mut target) => {
                copied?;
            }
            _ = cancel.cancelled() => {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    format!("export stream for disk {disk_id} cancelled"),
                ));
            }
        }
        target.shutdown().await?;
        Ok::<_, io::Error>(())
    }
    .await;

    if let Err(copy_error) = copy_result {
        if let Err(unlink_error) = storage.unlink(&full_path, true).await {
            if !is_not_found(&unlink_error) {
                warn!(file = %full_path, error = %unlink_error, "failed to remove partial disk backup");
            }
        }
        return Err(copy_error.into());
    }

    Ok(relative_path)
}
