//! Hypervisor control-plane abstraction.
//!
//! The hypervisor's object graph (VM → attachments → disk → snapshots) is
//! an external, server-pushed cache; the trait exposes it as a read-only
//! query capability plus the mutations and transfer entry points the
//! backup flows need. The protocol behind it is not this crate's concern.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::metadata::{AttachmentDescriptor, DeltaBackupMetadata, DiskDescriptor, VmDescriptor};
use crate::storage::ReadStream;

/// Format version stamped on exports produced through this engine.
pub const DELTA_FORMAT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRecord {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskRecord {
    pub id: Uuid,
    pub name: String,
    pub virtual_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub id: Uuid,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Disk,
    Media,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRecord {
    pub id: Uuid,
    pub disk: Option<Uuid>,
    pub kind: AttachmentKind,
}

/// One disk's export stream, cancellable while unconsumed.
pub struct ExportStream {
    reader: ReadStream,
    cancel: CancellationToken,
}

impl ExportStream {
    pub fn new(reader: ReadStream, cancel: CancellationToken) -> Self {
        Self { reader, cancel }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn into_parts(self) -> (ReadStream, CancellationToken) {
        (self.reader, self.cancel)
    }
}

/// A full or delta VM export: descriptors plus one live stream per disk.
pub struct DeltaExport {
    pub vm: VmDescriptor,
    pub disks: BTreeMap<String, DiskDescriptor>,
    pub attachments: Vec<AttachmentDescriptor>,
    /// Transient snapshot backing this export; it becomes the next base.
    pub snapshot: SnapshotRecord,
    pub streams: HashMap<String, ExportStream>,
    pub format_version: String,
}

#[derive(Debug, Clone)]
pub struct DeltaExportOptions {
    /// Label for the transient export snapshot.
    pub snapshot_label: String,
    /// Disks that must be exported in full even when a base exists.
    pub force_full_disks: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExportVmOptions {
    pub compress: bool,
    pub metadata_only: bool,
}

/// Input to the hypervisor's delta importer: the persisted descriptor plus
/// each disk's ordered chain streams. Replay order is the callee's
/// contract.
pub struct DeltaImport {
    pub metadata: DeltaBackupMetadata,
    pub disk_streams: HashMap<String, Vec<ReadStream>>,
}

#[async_trait]
pub trait HypervisorConnection: Send + Sync {
    async fn vm(&self, id: Uuid) -> anyhow::Result<VmRecord>;

    async fn disk(&self, id: Uuid) -> anyhow::Result<DiskRecord>;

    async fn attachments(&self, vm: Uuid) -> anyhow::Result<Vec<AttachmentRecord>>;

    async fn snapshots(&self, vm: Uuid) -> anyhow::Result<Vec<SnapshotRecord>>;

    /// VMs with at least one disk resident on the given storage repository.
    async fn residents(&self, sr: Uuid) -> anyhow::Result<Vec<VmRecord>>;

    async fn snapshot_vm(&self, vm: Uuid, label: &str) -> anyhow::Result<SnapshotRecord>;

    async fn delete_snapshot(&self, snapshot: Uuid) -> anyhow::Result<()>;

    async fn delete_vm(&self, vm: Uuid) -> anyhow::Result<()>;

    async fn create_disk(&self, sr: Uuid, descriptor: &DiskDescriptor)
        -> anyhow::Result<DiskRecord>;

    async fn delete_disk(&self, disk: Uuid) -> anyhow::Result<()>;

    async fn attach_disk(
        &self,
        vm: Uuid,
        disk: Uuid,
        attachment: &AttachmentDescriptor,
    ) -> anyhow::Result<()>;

    async fn add_tag(&self, vm: Uuid, tag: &str) -> anyhow::Result<()>;

    /// Exports the VM as a delta against `base`, or in full without one.
    async fn export_delta_vm(
        &self,
        vm: Uuid,
        base: Option<Uuid>,
        options: DeltaExportOptions,
    ) -> anyhow::Result<DeltaExport>;

    async fn import_delta_vm(&self, import: DeltaImport, sr: Uuid) -> anyhow::Result<VmRecord>;

    /// Replays one chain file's contents into an existing disk.
    async fn import_disk_content(&self, disk: Uuid, stream: ReadStream) -> anyhow::Result<()>;

    async fn export_vm(&self, vm: Uuid, options: ExportVmOptions) -> anyhow::Result<ReadStream>;

    async fn import_vm_image(
        &self,
        stream: ReadStream,
        sr: Uuid,
        metadata_only: bool,
    ) -> anyhow::Result<VmRecord>;

    async fn remote_copy_vm(
        &self,
        vm: Uuid,
        target_sr: Uuid,
        name: &str,
    ) -> anyhow::Result<VmRecord>;
}
