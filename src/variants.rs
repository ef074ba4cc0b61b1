//! Thin backup policies over the retention law: plain full-image rolling
//! backups, rolling snapshot retention and disaster-recovery copies, plus
//! remote listing and plain-image import.

use std::sync::Arc;

use regex::Regex;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

use crate::chain::{self, timestamp_now};
use crate::error::Result;
use crate::hypervisor::{ExportVmOptions, HypervisorConnection, SnapshotRecord, VmRecord};
use crate::retention;
use crate::storage::{ChecksumVerify, RemoteRepository, StorageHandler};

/// Tag applied to DR copies on the target repository.
const DR_COPY_TAG: &str = "Disaster Recovery";

pub struct BackupVariants {
    hypervisor: Arc<dyn HypervisorConnection>,
}

impl BackupVariants {
    pub fn new(hypervisor: Arc<dyn HypervisorConnection>) -> Self {
        Self { hypervisor }
    }

    /// Exports one full VM image to the remote and keeps the newest
    /// `depth` same-tag images, the fresh one included.
    pub async fn rolling_plain_backup(
        &self,
        vm_id: Uuid,
        remote: &RemoteRepository,
        tag: &str,
        depth: usize,
        options: ExportVmOptions,
    ) -> Result<String> {
        let storage = remote.handler()?.clone();
        let vm = self.hypervisor.vm(vm_id).await?;

        let pattern = plain_backup_pattern(tag, &vm.name)?;
        let mut backups: Vec<String> = storage
            .list("")
            .await?
            .into_iter()
            .filter(|name| pattern.is_match(name))
            .collect();
        backups.sort();

        let file_name = format!(
            "{}_{tag}_{}.{}",
            timestamp_now(),
            vm.name,
            chain::FULL_IMAGE_EXT
        );
        let mut source = self.hypervisor.export_vm(vm_id, options).await?;
        let mut target = storage.create_output_stream(&file_name, false).await?;
        tokio::io::copy(&mut source, &mut target).await?;
        target.shutdown().await?;
        info!(vm = %vm.name, file = %file_name, "plain backup written");

        // The fresh image occupies the newest slot of the retention window.
        retention::prune(backups, depth.saturating_sub(1), |name| {
            let storage = Arc::clone(&storage);
            async move { storage.unlink(&name, false).await.map_err(Into::into) }
        })
        .await?;

        Ok(file_name)
    }

    /// Takes a tagged snapshot and keeps the newest `depth` of its kind,
    /// the fresh one included.
    pub async fn rolling_snapshot(
        &self,
        vm_id: Uuid,
        tag: &str,
        depth: usize,
    ) -> Result<SnapshotRecord> {
        let vm = self.hypervisor.vm(vm_id).await?;

        let pattern = snapshot_pattern(tag)?;
        let mut snapshots: Vec<SnapshotRecord> = self
            .hypervisor
            .snapshots(vm_id)
            .await?
            .into_iter()
            .filter(|snapshot| pattern.is_match(&snapshot.label))
            .collect();
        snapshots.sort_by(|a, b| a.label.cmp(&b.label));

        let label = format!("rollingSnapshot_{}_{tag}_{}", timestamp_now(), vm.name);
        let created = self.hypervisor.snapshot_vm(vm_id, &label).await?;
        info!(vm = %vm.name, label = %label, "rolling snapshot created");

        let hypervisor = &self.hypervisor;
        retention::prune(snapshots, depth.saturating_sub(1), |snapshot| async move {
            hypervisor
                .delete_snapshot(snapshot.id)
                .await
                .map_err(Into::into)
        })
        .await?;

        Ok(created)
    }

    /// Replicates the VM onto a disaster-recovery repository and keeps the
    /// newest `depth` same-tag copies there, the fresh one included.
    pub async fn rolling_dr_copy(
        &self,
        vm_id: Uuid,
        target_sr: Uuid,
        tag: &str,
        depth: usize,
    ) -> Result<VmRecord> {
        let vm = self.hypervisor.vm(vm_id).await?;

        let pattern = dr_copy_pattern(tag, &vm.name)?;
        let mut copies: Vec<VmRecord> = self
            .hypervisor
            .residents(target_sr)
            .await?
            .into_iter()
            .filter(|resident| pattern.is_match(&resident.name))
            .collect();
        copies.sort_by(|a, b| a.name.cmp(&b.name));

        let copy_name = format!("{}_DR_{tag}_{}", vm.name, timestamp_now());
        let copy = self
            .hypervisor
            .remote_copy_vm(vm_id, target_sr, &copy_name)
            .await?;
        self.hypervisor.add_tag(copy.id, DR_COPY_TAG).await?;
        info!(vm = %vm.name, copy = %copy_name, "dr copy created");

        let hypervisor = &self.hypervisor;
        retention::prune(copies, depth.saturating_sub(1), |old| async move {
            hypervisor.delete_vm(old.id).await.map_err(Into::into)
        })
        .await?;

        Ok(copy)
    }

    /// Lists every backup on the remote: plain images at the root plus the
    /// logical (extension-less) path of each delta descriptor.
    pub async fn list_backups(&self, remote: &RemoteRepository) -> Result<Vec<String>> {
        let storage = remote.handler()?;
        let files = storage.list("").await?;

        let image_suffix = format!(".{}", chain::FULL_IMAGE_EXT);
        let mut backups: Vec<String> = files
            .iter()
            .filter(|name| name.ends_with(&image_suffix))
            .cloned()
            .collect();

        let metadata_suffix = format!(".{}", chain::METADATA_EXT);
        for dir in files
            .iter()
            .filter(|name| name.starts_with(chain::DELTA_DIR_PREFIX))
        {
            for name in storage.list(dir).await? {
                if let Some(stem) = name.strip_suffix(&metadata_suffix) {
                    backups.push(format!("{dir}/{stem}"));
                }
            }
        }

        Ok(backups)
    }

    /// Imports one plain full image as a new VM.
    pub async fn import_full_backup(
        &self,
        remote: &RemoteRepository,
        file: &str,
        target_sr: Uuid,
    ) -> Result<VmRecord> {
        let storage = remote.handler()?;
        let stream = storage.create_read_stream(file, ChecksumVerify::Skip).await?;
        Ok(self
            .hypervisor
            .import_vm_image(stream, target_sr, false)
            .await?)
    }
}

fn plain_backup_pattern(tag: &str, vm_name: &str) -> Result<Regex> {
    compile_pattern(format!(
        "^[^_]+_{}_{}\\.{}$",
        regex::escape(tag),
        regex::escape(vm_name),
        chain::FULL_IMAGE_EXT
    ))
}

fn snapshot_pattern(tag: &str) -> Result<Regex> {
    compile_pattern(format!("^rollingSnapshot_[^_]+_{}_", regex::escape(tag)))
}

fn dr_copy_pattern(tag: &str, vm_name: &str) -> Result<Regex> {
    compile_pattern(format!(
        "^{}_DR_{}_[0-9]{{8}}T[0-9]{{6}}Z$",
        regex::escape(vm_name),
        regex::escape(tag)
    ))
}

fn compile_pattern(pattern: String) -> Result<Regex> {
    Ok(Regex::new(&pattern).map_err(anyhow::Error::from)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeHypervisor, MemoryStorage};
    use chrono::{TimeZone, Utc};

    fn remote(storage: &MemoryStorage) -> RemoteRepository {
        RemoteRepository::new(
            "offsite",
            Arc::new(storage.clone()) as Arc<dyn StorageHandler>,
        )
    }

    #[tokio::test]
    async fn plain_backup_writes_the_image_and_prunes_old_ones() {
        let storage = MemoryStorage::new();
        storage.insert("20260101T000000Z_nightly_web-1.ova", b"old1", false);
        storage.insert("20260102T000000Z_nightly_web-1.ova", b"old2", false);
        storage.insert("20260103T000000Z_weekly_web-1.ova", b"other tag", false);
        storage.insert("20260104T000000Z_nightly_db-1.ova", b"other vm", false);

        let hypervisor = Arc::new(FakeHypervisor::new());
        let vm = hypervisor.add_vm("web-1");
        hypervisor.set_plain_image(b"full image bytes");

        let variants = BackupVariants::new(hypervisor.clone());
        let file = variants
            .rolling_plain_backup(
                vm.id,
                &remote(&storage),
                "nightly",
                2,
                ExportVmOptions::default(),
            )
            .await
            .unwrap();

        assert!(file.ends_with("_nightly_web-1.ova"));
        assert_eq!(storage.contents(&file).unwrap(), b"full image bytes");
        // Two kept in total: the fresh image and the newest old one.
        assert!(!storage.contains("20260101T000000Z_nightly_web-1.ova"));
        assert!(storage.contains("20260102T000000Z_nightly_web-1.ova"));
        // Other tags and other VMs are untouched.
        assert!(storage.contains("20260103T000000Z_weekly_web-1.ova"));
        assert!(storage.contains("20260104T000000Z_nightly_db-1.ova"));
    }

    #[tokio::test]
    async fn rolling_snapshot_prunes_only_matching_labels() {
        let hypervisor = Arc::new(FakeHypervisor::new());
        let vm = hypervisor.add_vm("web-1");
        for (label, day) in [
            ("rollingSnapshot_20260101T000000Z_nightly_web-1", 1),
            ("rollingSnapshot_20260102T000000Z_nightly_web-1", 2),
            ("rollingSnapshot_20260102T000000Z_weekly_web-1", 2),
            ("manual-checkpoint", 3),
        ] {
            hypervisor.add_snapshot(
                vm.id,
                SnapshotRecord {
                    id: Uuid::new_v4(),
                    label: label.to_string(),
                    created_at: Utc.with_ymd_and_hms(2026, 1, day, 0, 0, 0).unwrap(),
                },
            );
        }

        let variants = BackupVariants::new(hypervisor.clone());
        let created = variants.rolling_snapshot(vm.id, "nightly", 2).await.unwrap();
        assert!(created.label.starts_with("rollingSnapshot_"));
        assert!(created.label.ends_with("_nightly_web-1"));
        assert_eq!(hypervisor.snapshot_labels(), vec![created.label.clone()]);

        // depth 2 keeps the fresh snapshot plus the newest old one.
        assert_eq!(hypervisor.deleted_snapshots().len(), 1);
        let remaining = hypervisor.snapshots(vm.id).await.unwrap();
        let labels: Vec<_> = remaining.iter().map(|s| s.label.as_str()).collect();
        assert!(!labels.contains(&"rollingSnapshot_20260101T000000Z_nightly_web-1"));
        assert!(labels.contains(&"rollingSnapshot_20260102T000000Z_nightly_web-1"));
        assert!(labels.contains(&"rollingSnapshot_20260102T000000Z_weekly_web-1"));
        assert!(labels.contains(&"manual-checkpoint"));
    }

    #[tokio::test]
    async fn dr_copy_tags_the_replica_and_prunes_older_copies() {
        let hypervisor = Arc::new(FakeHypervisor::new());
        let vm = hypervisor.add_vm("web-1");
        let sr = Uuid::new_v4();
        hypervisor.set_residents(
            sr,
            vec![
                VmRecord {
                    id: Uuid::new_v4(),
                    name: "web-1_DR_nightly_20260101T000000Z".into(),
                },
                VmRecord {
                    id: Uuid::new_v4(),
                    name: "web-1_DR_nightly_20260102T000000Z".into(),
                },
                VmRecord {
                    id: Uuid::new_v4(),
                    name: "unrelated-vm".into(),
                },
            ],
        );

        let variants = BackupVariants::new(hypervisor.clone());
        let copy = variants
            .rolling_dr_copy(vm.id, sr, "nightly", 2)
            .await
            .unwrap();
        assert!(copy.name.starts_with("web-1_DR_nightly_"));
        assert!(hypervisor
            .tags()
            .contains(&(copy.id, DR_COPY_TAG.to_string())));

        // Only the oldest matching copy goes; the stranger stays.
        assert_eq!(hypervisor.deleted_vms().len(), 1);
        let residents = hypervisor.residents(sr).await.unwrap();
        let names: Vec<_> = residents.iter().map(|vm| vm.name.as_str()).collect();
        assert!(!names.contains(&"web-1_DR_nightly_20260101T000000Z"));
        assert!(names.contains(&"web-1_DR_nightly_20260102T000000Z"));
        assert!(names.contains(&"unrelated-vm"));
    }

    #[tokio::test]
    async fn listing_mixes_plain_images_and_delta_logical_paths() {
        let storage = MemoryStorage::new();
        storage.insert("20260101T000000Z_nightly_web-1.ova", b"plain", false);
        storage.insert(
            "vm_delta_nightly_1111/20260102T000000Z_web-1.json",
            b"{}",
            false,
        );
        storage.insert(
            "vm_delta_nightly_1111/disk_a/20260102T000000Z_full.vhd",
            b"img",
            false,
        );

        let variants = BackupVariants::new(Arc::new(FakeHypervisor::new()));
        let mut backups = variants.list_backups(&remote(&storage)).await.unwrap();
        backups.sort();
        assert_eq!(
            backups,
            vec![
                "20260101T000000Z_nightly_web-1.ova".to_string(),
                "vm_delta_nightly_1111/20260102T000000Z_web-1".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn plain_image_import_streams_into_the_hypervisor() {
        let storage = MemoryStorage::new();
        storage.insert("20260101T000000Z_nightly_web-1.ova", b"image bytes", false);

        let hypervisor = Arc::new(FakeHypervisor::new());
        let variants = BackupVariants::new(hypervisor.clone());
        let sr = Uuid::new_v4();

        let vm = variants
            .import_full_backup(&remote(&storage), "20260101T000000Z_nightly_web-1.ova", sr)
            .await
            .unwrap();

        assert_eq!(vm.name, "imported-vm");
        assert_eq!(hypervisor.imported_images(), vec![(sr, false, 11)]);
    }

    #[tokio::test]
    async fn disabled_remote_rejects_before_any_work() {
        let storage = MemoryStorage::new();
        let mut remote = remote(&storage);
        remote.set_enabled(false);

        let hypervisor = Arc::new(FakeHypervisor::new());
        let vm = hypervisor.add_vm("web-1");
        let variants = BackupVariants::new(hypervisor);

        let error = variants
            .rolling_plain_backup(vm.id, &remote, "nightly", 2, ExportVmOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, crate::BackupError::RemoteUnavailable(_)));
        assert!(storage.paths().is_empty());
    }
}
