//! Local-filesystem storage handler.
//!
//! Checksummed files get a `<name>.checksum` sidecar holding the hex
//! sha256 of their contents. Listings hide sidecars, renames and unlinks
//! move or drop them together with the data file.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use super::{checksum_mismatch, ChecksumVerify, ReadStream, StorageHandler, WriteStream};

const CHECKSUM_EXT: &str = "checksum";

pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn sidecar(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".");
        name.push(CHECKSUM_EXT);
        path.with_file_name(name)
    }
}

#[async_trait]
impl StorageHandler for LocalStorage {
    async fn list(&self, dir: &str) -> io::Result<Vec<String>> {
        let mut entries = fs::read_dir(self.resolve(dir)).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(&format!(".{CHECKSUM_EXT}")) {
                names.push(name);
            }
        }
        Ok(names)
    }

    async fn create_read_stream(
        &self,
        path: &str,
        verify: ChecksumVerify,
    ) -> io::Result<ReadStream> {
        let target = self.resolve(path);
        let expected = match verify {
            ChecksumVerify::Skip => None,
            ChecksumVerify::Require | ChecksumVerify::IfPresent => {
                match fs::read_to_string(Self::sidecar(&target)).await {
                    Ok(digest) => Some(digest.trim().to_string()),
                    Err(error) if error.kind() == io::ErrorKind::NotFound => {
                        if verify == ChecksumVerify::Require {
                            return Err(io::Error::new(
                                io::ErrorKind::NotFound,
                                format!("no checksum recorded for {path}"),
                            ));
                        }
                        None
                    }
                    Err(error) => return Err(error),
                }
            }
        };

        let file = fs::File::open(&target).await?;
        Ok(match expected {
            Some(digest) => Box::pin(ChecksumReader::new(file, digest, path.to_string())),
            None => Box::pin(file),
        })
    }

    async fn create_output_stream(&self, path: &str, checksum: bool) -> io::Result<WriteStream> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::File::create(&target).await?;
        Ok(if checksum {
            Box::pin(ChecksumWriter::new(file, Self::sidecar(&target)))
        } else {
            Box::pin(file)
        })
    }

    async fn unlink(&self, path: &str, with_checksum: bool) -> io::Result<()> {
        let target = self.resolve(path);
        fs::remove_file(&target).await?;
        if with_checksum {
            match fs::remove_file(Self::sidecar(&target)).await {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let source = self.resolve(from);
        let target = self.resolve(to);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&source, &target).await?;
        match fs::rename(Self::sidecar(&source), Self::sidecar(&target)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error),
        }
    }

    async fn output_file(&self, path: &str, contents: Bytes) -> io::Result<()> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(target, contents).await
    }

    async fn read_file(&self, path: &str) -> io::Result<Bytes> {
        Ok(fs::read(self.resolve(path)).await?.into())
    }
}

/// Hashes while reading; the digest is compared against the sidecar's
/// value once the underlying file reports end of stream.
struct ChecksumReader {
    file: fs::File,
    hasher: Option<Sha256>,
    expected: String,
    path: String,
}

impl ChecksumReader {
    fn new(file: fs::File, expected: String, path: String) -> Self {
        Self {
            file,
            hasher: Some(Sha256::new()),
            expected,
            path,
        }
    }
}

impl AsyncRead for ChecksumReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.file).poll_read(cx, buf))?;

        let filled = buf.filled();
        if filled.len() > before {
            if let Some(hasher) = this.hasher.as_mut() {
                hasher.update(&filled[before..]);
            }
        } else if let Some(hasher) = this.hasher.take() {
            if hex::encode(hasher.finalize()) != this.expected {
                return Poll::Ready(Err(checksum_mismatch(&this.path)));
            }
        }
        Poll::Ready(Ok(()))
    }
}

/// Hashes while writing; shutdown flushes the file and then persists the
/// digest sidecar.
struct ChecksumWriter {
    file: Option<fs::File>,
    hasher: Sha256,
    sidecar: PathBuf,
    finish: Option<BoxFuture<'static, io::Result<()>>>,
}

impl ChecksumWriter {
    fn new(file: fs::File, sidecar: PathBuf) -> Self {
        Self {
            file: Some(file),
            hasher: Sha256::new(),
            sidecar,
            finish: None,
        }
    }
}

impl AsyncWrite for ChecksumWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let Some(file) = this.file.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                "write after shutdown",
            )));
        };
        let written = ready!(Pin::new(file).poll_write(cx, buf))?;
        this.hasher.update(&buf[..written]);
        Poll::Ready(Ok(written))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.file.as_mut() {
            Some(file) => Pin::new(file).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.finish.is_none() {
            let digest = hex::encode(std::mem::take(&mut this.hasher).finalize());
            let sidecar = this.sidecar.clone();
            let file = this.file.take();
            this.finish = Some(Box::pin(async move {
                if let Some(mut file) = file {
                    file.shutdown().await?;
                }
                fs::write(sidecar, digest).await
            }));
        }
        match this.finish.as_mut() {
            Some(finish) => finish.as_mut().poll(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn write_with_checksum(storage: &LocalStorage, path: &str, contents: &[u8]) {
        let mut target = storage.create_output_stream(path, true).await.unwrap();
        target.write_all(contents).await.unwrap();
        target.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn checksummed_write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        write_with_checksum(&storage, "disk_a/20260105T031500Z_delta.vhd", b"delta bytes").await;
        assert!(dir
            .path()
            .join("disk_a/20260105T031500Z_delta.vhd.checksum")
            .exists());

        let mut stream = storage
            .create_read_stream("disk_a/20260105T031500Z_delta.vhd", ChecksumVerify::Require)
            .await
            .unwrap();
        let mut contents = Vec::new();
        stream.read_to_end(&mut contents).await.unwrap();
        assert_eq!(contents, b"delta bytes");
    }

    #[tokio::test]
    async fn corrupted_file_fails_verification_at_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        write_with_checksum(&storage, "x.vhd", b"original").await;
        std::fs::write(dir.path().join("x.vhd"), b"tampered").unwrap();

        let mut stream = storage
            .create_read_stream("x.vhd", ChecksumVerify::Require)
            .await
            .unwrap();
        let mut contents = Vec::new();
        let error = stream.read_to_end(&mut contents).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn require_fails_not_found_without_a_recorded_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage
            .output_file("plain.vhd", Bytes::from_static(b"no sidecar"))
            .await
            .unwrap();

        let error = storage
            .create_read_stream("plain.vhd", ChecksumVerify::Require)
            .await
            .err()
            .unwrap();
        assert_eq!(error.kind(), io::ErrorKind::NotFound);

        // IfPresent falls back to a raw read.
        let mut stream = storage
            .create_read_stream("plain.vhd", ChecksumVerify::IfPresent)
            .await
            .unwrap();
        let mut contents = Vec::new();
        stream.read_to_end(&mut contents).await.unwrap();
        assert_eq!(contents, b"no sidecar");
    }

    #[tokio::test]
    async fn rename_and_unlink_carry_the_sidecar_along() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        write_with_checksum(&storage, "d/old.vhd", b"payload").await;
        storage.rename("d/old.vhd", "d/new.vhd").await.unwrap();
        assert!(!dir.path().join("d/old.vhd.checksum").exists());
        assert!(dir.path().join("d/new.vhd.checksum").exists());

        storage.unlink("d/new.vhd", true).await.unwrap();
        assert!(!dir.path().join("d/new.vhd").exists());
        assert!(!dir.path().join("d/new.vhd.checksum").exists());
    }

    #[tokio::test]
    async fn listings_hide_checksum_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        write_with_checksum(&storage, "d/a.vhd", b"a").await;
        storage
            .output_file("d/b.vhd", Bytes::from_static(b"b"))
            .await
            .unwrap();

        let mut names = storage.list("d").await.unwrap();
        names.sort();
        assert_eq!(names, vec!["a.vhd", "b.vhd"]);
    }
}
