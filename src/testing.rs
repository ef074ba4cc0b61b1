//! In-memory collaborator fakes shared by the unit tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chain::merge::ImageMerger;
use crate::hypervisor::{
    AttachmentRecord, DeltaExport, DeltaExportOptions, DeltaImport, DiskRecord, ExportStream,
    ExportVmOptions, HypervisorConnection, SnapshotRecord, VmRecord, DELTA_FORMAT_VERSION,
};
use crate::metadata::{AttachmentDescriptor, DiskDescriptor, VmDescriptor};
use crate::storage::{checksum_mismatch, ChecksumVerify, ReadStream, StorageHandler, WriteStream};

fn not_found(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("not found: {path}"))
}

#[derive(Default)]
struct StorageState {
    files: BTreeMap<String, Vec<u8>>,
    checksums: BTreeMap<String, String>,
    fail_prefixes: Vec<String>,
}

/// Map-backed [`StorageHandler`] with the same checksum-sidecar semantics
/// as the local handler, plus write-failure injection.
#[derive(Clone, Default)]
pub(crate) struct MemoryStorage {
    state: Arc<Mutex<StorageState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn digest(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn lock(&self) -> MutexGuard<'_, StorageState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, path: &str, contents: &[u8], with_checksum: bool) {
        let mut state = self.lock();
        if with_checksum {
            state
                .checksums
                .insert(path.to_string(), Self::digest(contents));
        }
        state.files.insert(path.to_string(), contents.to_vec());
    }

    /// Alters the stored bytes without touching the recorded checksum.
    pub fn corrupt(&self, path: &str) {
        if let Some(contents) = self.lock().files.get_mut(path) {
            contents.extend_from_slice(b"!corrupt");
        }
    }

    /// Any write under `prefix` fails, simulating a broken transfer.
    pub fn fail_writes_under(&self, prefix: &str) {
        self.lock().fail_prefixes.push(prefix.to_string());
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock().files.contains_key(path)
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }
}

#[async_trait]
impl StorageHandler for MemoryStorage {
    async fn list(&self, dir: &str) -> io::Result<Vec<String>> {
        let state = self.lock();
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        let mut names = BTreeSet::new();
        for path in state.files.keys() {
            if let Some(rest) = path.strip_prefix(&prefix) {
                let name = rest.split('/').next().unwrap_or(rest);
                if !name.is_empty() {
                    names.insert(name.to_string());
                }
            }
        }
        if names.is_empty() && !dir.is_empty() {
            return Err(not_found(dir));
        }
        Ok(names.into_iter().collect())
    }

    async fn create_read_stream(
        &self,
        path: &str,
        verify: ChecksumVerify,
    ) -> io::Result<ReadStream> {
        let (bytes, recorded) = {
            let state = self.lock();
            let Some(bytes) = state.files.get(path).cloned() else {
                return Err(not_found(path));
            };
            (bytes, state.checksums.get(path).cloned())
        };

        let corrupt = match verify {
            ChecksumVerify::Skip => false,
            ChecksumVerify::Require => match recorded {
                Some(digest) => digest != Self::digest(&bytes),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no checksum recorded for {path}"),
                    ))
                }
            },
            ChecksumVerify::IfPresent => recorded
                .map(|digest| digest != Self::digest(&bytes))
                .unwrap_or(false),
        };

        Ok(Box::pin(MemoryReader {
            bytes: Cursor::new(bytes),
            corrupt,
            path: path.to_string(),
        }))
    }

    async fn create_output_stream(&self, path: &str, checksum: bool) -> io::Result<WriteStream> {
        let fail = self
            .lock()
            .fail_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()));
        Ok(Box::pin(MemoryWriter {
            storage: self.clone(),
            path: path.to_string(),
            buffer: Vec::new(),
            checksum,
            fail,
            committed: false,
        }))
    }

    async fn unlink(&self, path: &str, with_checksum: bool) -> io::Result<()> {
        let mut state = self.lock();
        if state.files.remove(path).is_none() {
            return Err(not_found(path));
        }
        if with_checksum {
            state.checksums.remove(path);
        }
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let mut state = self.lock();
        let Some(contents) = state.files.remove(from) else {
            return Err(not_found(from));
        };
        state.files.insert(to.to_string(), contents);
        if let Some(digest) = state.checksums.remove(from) {
            state.checksums.insert(to.to_string(), digest);
        }
        Ok(())
    }

    async fn output_file(&self, path: &str, contents: Bytes) -> io::Result<()> {
        self.lock().files.insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> io::Result<Bytes> {
        self.lock()
            .files
            .get(path)
            .cloned()
            .map(Bytes::from)
            .ok_or_else(|| not_found(path))
    }
}

/// Yields the stored bytes, then an `InvalidData` error when the recorded
/// checksum no longer matches, mirroring verification at end of stream.
struct MemoryReader {
    bytes: Cursor<Vec<u8>>,
    corrupt: bool,
    path: String,
}

impl AsyncRead for MemoryReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.bytes).poll_read(cx, buf))?;
        if buf.filled().len() == before && this.corrupt {
            this.corrupt = false;
            return Poll::Ready(Err(checksum_mismatch(&this.path)));
        }
        Poll::Ready(Ok(()))
    }
}

/// Buffers writes and commits on shutdown, so a failed copy never leaves a
/// file behind.
struct MemoryWriter {
    storage: MemoryStorage,
    path: String,
    buffer: Vec<u8>,
    checksum: bool,
    fail: bool,
    committed: bool,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.fail {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                format!("injected write failure: {}", self.path),
            )));
        }
        self.buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.fail {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                format!("injected write failure: {}", self.path),
            )));
        }
        if !self.committed {
            self.committed = true;
            let this = &*self;
            this.storage
                .insert(&this.path, &this.buffer, this.checksum);
        }
        Poll::Ready(Ok(()))
    }
}

#[derive(Default)]
struct HypervisorState {
    vms: HashMap<Uuid, VmRecord>,
    disks: HashMap<Uuid, DiskRecord>,
    attachments: HashMap<Uuid, Vec<AttachmentRecord>>,
    snapshots: HashMap<Uuid, Vec<SnapshotRecord>>,
    residents: HashMap<Uuid, Vec<VmRecord>>,
    export_disks: Vec<(String, DiskDescriptor, Vec<u8>)>,
    export_attachments: Vec<AttachmentDescriptor>,
    plain_image: Vec<u8>,

    export_snapshots: Vec<Uuid>,
    export_tokens: Vec<CancellationToken>,
    export_bases: Vec<Option<Uuid>>,
    deleted_snapshots: Vec<Uuid>,
    deleted_vms: Vec<Uuid>,
    deleted_disks: Vec<Uuid>,
    created_disks: Vec<DiskRecord>,
    attached: Vec<(Uuid, Uuid, String)>,
    tags: Vec<(Uuid, String)>,
    snapshot_labels: Vec<String>,
    delta_imports: Vec<(Uuid, Vec<(String, usize)>)>,
    content_imports: Vec<(Uuid, Vec<u8>)>,
    imported_images: Vec<(Uuid, bool, usize)>,
}

/// Scripted [`HypervisorConnection`] that records every mutation.
#[derive(Default)]
pub(crate) struct FakeHypervisor {
    state: Mutex<HypervisorState>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HypervisorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_vm(&self, name: &str) -> VmRecord {
        let record = VmRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
        };
        self.lock().vms.insert(record.id, record.clone());
        record
    }

    pub fn add_disk(&self, vm: Uuid, name: &str, virtual_size: u64) -> DiskRecord {
        let record = DiskRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            virtual_size,
        };
        let mut state = self.lock();
        state.disks.insert(record.id, record.clone());
        state
            .attachments
            .entry(vm)
            .or_default()
            .push(AttachmentRecord {
                id: Uuid::new_v4(),
                disk: Some(record.id),
                kind: crate::hypervisor::AttachmentKind::Disk,
            });
        record
    }

    pub fn add_snapshot(&self, vm: Uuid, snapshot: SnapshotRecord) {
        self.lock().snapshots.entry(vm).or_default().push(snapshot);
    }

    pub fn set_residents(&self, sr: Uuid, residents: Vec<VmRecord>) {
        self.lock().residents.insert(sr, residents);
    }

    /// Configures the payload the next delta export will stream per disk.
    pub fn set_export_disks(&self, disks: Vec<(String, DiskDescriptor, Vec<u8>)>) {
        self.lock().export_disks = disks;
    }

    pub fn set_export_attachments(&self, attachments: Vec<AttachmentDescriptor>) {
        self.lock().export_attachments = attachments;
    }

    pub fn set_plain_image(&self, image: &[u8]) {
        self.lock().plain_image = image.to_vec();
    }

    pub fn export_snapshots(&self) -> Vec<Uuid> {
        self.lock().export_snapshots.clone()
    }

    pub fn export_tokens(&self) -> Vec<CancellationToken> {
        self.lock().export_tokens.clone()
    }

    pub fn export_bases(&self) -> Vec<Option<Uuid>> {
        self.lock().export_bases.clone()
    }

    pub fn deleted_snapshots(&self) -> Vec<Uuid> {
        self.lock().deleted_snapshots.clone()
    }

    pub fn deleted_vms(&self) -> Vec<Uuid> {
        self.lock().deleted_vms.clone()
    }

    pub fn deleted_disks(&self) -> Vec<Uuid> {
        self.lock().deleted_disks.clone()
    }

    pub fn created_disks(&self) -> Vec<DiskRecord> {
        self.lock().created_disks.clone()
    }

    pub fn attached(&self) -> Vec<(Uuid, Uuid, String)> {
        self.lock().attached.clone()
    }

    pub fn tags(&self) -> Vec<(Uuid, String)> {
        self.lock().tags.clone()
    }

    pub fn snapshot_labels(&self) -> Vec<String> {
        self.lock().snapshot_labels.clone()
    }

    pub fn delta_imports(&self) -> Vec<(Uuid, Vec<(String, usize)>)> {
        self.lock().delta_imports.clone()
    }

    pub fn content_imports(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.lock().content_imports.clone()
    }

    pub fn imported_images(&self) -> Vec<(Uuid, bool, usize)> {
        self.lock().imported_images.clone()
    }
}

#[async_trait]
impl HypervisorConnection for FakeHypervisor {
    async fn vm(&self, id: Uuid) -> anyhow::Result<VmRecord> {
        self.lock()
            .vms
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such vm: {id}"))
    }

    async fn disk(&self, id: Uuid) -> anyhow::Result<DiskRecord> {
        self.lock()
            .disks
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such disk: {id}"))
    }

    async fn attachments(&self, vm: Uuid) -> anyhow::Result<Vec<AttachmentRecord>> {
        Ok(self.lock().attachments.get(&vm).cloned().unwrap_or_default())
    }

    async fn snapshots(&self, vm: Uuid) -> anyhow::Result<Vec<SnapshotRecord>> {
        Ok(self.lock().snapshots.get(&vm).cloned().unwrap_or_default())
    }

    async fn residents(&self, sr: Uuid) -> anyhow::Result<Vec<VmRecord>> {
        Ok(self.lock().residents.get(&sr).cloned().unwrap_or_default())
    }

    async fn snapshot_vm(&self, vm: Uuid, label: &str) -> anyhow::Result<SnapshotRecord> {
        let record = SnapshotRecord {
            id: Uuid::new_v4(),
            label: label.to_string(),
            created_at: Utc::now(),
        };
        let mut state = self.lock();
        state.snapshots.entry(vm).or_default().push(record.clone());
        state.snapshot_labels.push(label.to_string());
        Ok(record)
    }

    async fn delete_snapshot(&self, snapshot: Uuid) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.deleted_snapshots.push(snapshot);
        for snapshots in state.snapshots.values_mut() {
            snapshots.retain(|record| record.id != snapshot);
        }
        Ok(())
    }

    async fn delete_vm(&self, vm: Uuid) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.deleted_vms.push(vm);
        state.vms.remove(&vm);
        for residents in state.residents.values_mut() {
            residents.retain(|record| record.id != vm);
        }
        Ok(())
    }

    async fn create_disk(
        &self,
        _sr: Uuid,
        descriptor: &DiskDescriptor,
    ) -> anyhow::Result<DiskRecord> {
        let record = DiskRecord {
            id: Uuid::new_v4(),
            name: descriptor.name.clone(),
            virtual_size: descriptor.virtual_size,
        };
        let mut state = self.lock();
        state.disks.insert(record.id, record.clone());
        state.created_disks.push(record.clone());
        Ok(record)
    }

    async fn delete_disk(&self, disk: Uuid) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.deleted_disks.push(disk);
        state.disks.remove(&disk);
        Ok(())
    }

    async fn attach_disk(
        &self,
        vm: Uuid,
        disk: Uuid,
        attachment: &AttachmentDescriptor,
    ) -> anyhow::Result<()> {
        self.lock().attached.push((vm, disk, attachment.device.clone()));
        Ok(())
    }

    async fn add_tag(&self, vm: Uuid, tag: &str) -> anyhow::Result<()> {
        self.lock().tags.push((vm, tag.to_string()));
        Ok(())
    }

    async fn export_delta_vm(
        &self,
        vm: Uuid,
        base: Option<Uuid>,
        options: DeltaExportOptions,
    ) -> anyhow::Result<DeltaExport> {
        let mut state = self.lock();
        let vm_record = state
            .vms
            .get(&vm)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such vm: {vm}"))?;

        let snapshot = SnapshotRecord {
            id: Uuid::new_v4(),
            label: options.snapshot_label.clone(),
            created_at: Utc::now(),
        };
        state.export_snapshots.push(snapshot.id);
        state.export_bases.push(base);

        let mut disks = BTreeMap::new();
        let mut streams = HashMap::new();
        for (key, descriptor, payload) in state.export_disks.clone() {
            disks.insert(key.clone(), descriptor);
            let token = CancellationToken::new();
            state.export_tokens.push(token.clone());
            let reader: ReadStream = Box::pin(Cursor::new(payload));
            streams.insert(key, ExportStream::new(reader, token));
        }

        Ok(DeltaExport {
            vm: VmDescriptor {
                id: vm_record.id,
                name: vm_record.name,
            },
            disks,
            attachments: state.export_attachments.clone(),
            snapshot,
            streams,
            format_version: DELTA_FORMAT_VERSION.to_string(),
        })
    }

    async fn import_delta_vm(&self, import: DeltaImport, sr: Uuid) -> anyhow::Result<VmRecord> {
        let mut replayed = Vec::new();
        for (key, streams) in import.disk_streams {
            let mut count = 0usize;
            for mut stream in streams {
                let mut sink = Vec::new();
                stream.read_to_end(&mut sink).await?;
                count += 1;
            }
            replayed.push((key, count));
        }
        replayed.sort();

        let record = VmRecord {
            id: Uuid::new_v4(),
            name: format!("restored-{}", import.metadata.vm.name),
        };
        let mut state = self.lock();
        state.delta_imports.push((sr, replayed));
        state.vms.insert(record.id, record.clone());
        Ok(record)
    }

    async fn import_disk_content(&self, disk: Uuid, mut stream: ReadStream) -> anyhow::Result<()> {
        let mut contents = Vec::new();
        stream.read_to_end(&mut contents).await?;
        self.lock().content_imports.push((disk, contents));
        Ok(())
    }

    async fn export_vm(&self, _vm: Uuid, _options: ExportVmOptions) -> anyhow::Result<ReadStream> {
        let image = self.lock().plain_image.clone();
        Ok(Box::pin(Cursor::new(image)))
    }

    async fn import_vm_image(
        &self,
        mut stream: ReadStream,
        sr: Uuid,
        metadata_only: bool,
    ) -> anyhow::Result<VmRecord> {
        let mut contents = Vec::new();
        stream.read_to_end(&mut contents).await?;

        let record = VmRecord {
            id: Uuid::new_v4(),
            name: "imported-vm".to_string(),
        };
        let mut state = self.lock();
        state.imported_images.push((sr, metadata_only, contents.len()));
        state.vms.insert(record.id, record.clone());
        Ok(record)
    }

    async fn remote_copy_vm(
        &self,
        _vm: Uuid,
        target_sr: Uuid,
        name: &str,
    ) -> anyhow::Result<VmRecord> {
        let record = VmRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
        };
        let mut state = self.lock();
        state.vms.insert(record.id, record.clone());
        state
            .residents
            .entry(target_sr)
            .or_default()
            .push(record.clone());
        Ok(record)
    }
}

/// [`ImageMerger`] that records folds and concatenates payloads so tests
/// can observe both the call order and the consolidated contents.
#[derive(Default)]
pub(crate) struct RecordingMerger {
    calls: Mutex<Vec<(String, String)>>,
    fail_on: Mutex<Option<String>>,
}

impl RecordingMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn fail_on(&self, delta_path: &str) {
        *self.fail_on.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(delta_path.to_string());
    }
}

#[async_trait]
impl ImageMerger for RecordingMerger {
    async fn merge(
        &self,
        storage: &dyn StorageHandler,
        base_path: &str,
        delta_path: &str,
    ) -> anyhow::Result<()> {
        let failing = self
            .fail_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if failing.as_deref() == Some(delta_path) {
            anyhow::bail!("merge primitive unavailable: {delta_path}");
        }

        let delta = storage.read_file(delta_path).await?;
        let base = storage.read_file(base_path).await?;
        let mut folded = base.to_vec();
        folded.extend_from_slice(&delta);
        storage.output_file(base_path, folded.into()).await?;

        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((base_path.to_string(), delta_path.to_string()));
        Ok(())
    }
}
