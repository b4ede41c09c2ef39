//! File attachment manager: streamed uploads to disk plus the metadata rows
//!
//! Attachment bytes live under `root/<owner_id>/<record_id>/<leaf name>`, so
//! repeated uploads for one record land in a stable subdirectory. Cleanup of
//! superseded or deleted bytes is never best-effort: an undeletable file
//! aborts the enclosing operation.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use stash_core::types::FileAttachment;
use stash_core::{VaultError, VaultResult};

use crate::repository::FileRepository;

/// Directory that holds every attachment for one record.
pub fn attachment_dir(root: &Path, owner_id: u64, record_id: u64) -> PathBuf {
    root.join(owner_id.to_string()).join(record_id.to_string())
}

/// Metadata-row side of the attachment manager.
#[derive(Clone)]
pub struct FileService {
    repo: Arc<dyn FileRepository>,
}

impl FileService {
    pub fn new(repo: Arc<dyn FileRepository>) -> Self {
        Self { repo }
    }

    /// Insert a new attachment row, or update in place when replacing.
    ///
    /// Replacement deletes the superseded bytes first, unless the new upload
    /// already landed on the same path (same leaf name).
    pub async fn save(&self, file: &mut FileAttachment) -> VaultResult<()> {
        if file.id == 0 {
            return self.repo.insert(file).await;
        }

        let old = self
            .repo
            .get(file.id)
            .await?
            .ok_or(VaultError::NotFound)?;

        if old.path != file.path {
            remove_bytes(&old.path).await?;
        }

        self.repo.update(file).await
    }

    pub async fn get(&self, id: u64) -> VaultResult<FileAttachment> {
        self.repo.get(id).await?.ok_or(VaultError::NotFound)
    }

    pub async fn exists(&self, id: u64) -> VaultResult<bool> {
        Ok(self.repo.get(id).await?.is_some())
    }

    /// Delete the backing bytes, then the row. Bytes already missing on disk
    /// are fine; bytes present but undeletable abort the operation.
    pub async fn delete(&self, id: u64) -> VaultResult<()> {
        let file = self.repo.get(id).await?.ok_or(VaultError::NotFound)?;
        remove_bytes(&file.path).await?;
        self.repo.delete(file.id).await
    }
}

async fn remove_bytes(path: &Path) -> VaultResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "attachment bytes already gone");
            Ok(())
        }
        Err(e) => Err(VaultError::Io(e)),
    }
}

/// Streams one upload to its destination file.
///
/// The handle stays open for the lifetime of the stream and is closed on
/// every exit path; dropping the uploader mid-stream (client cancellation)
/// closes it too.
pub struct Uploader {
    root: PathBuf,
    dest: Option<(PathBuf, tokio::fs::File)>,
    bytes_written: u64,
}

impl Uploader {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            dest: None,
            bytes_written: 0,
        }
    }

    /// Create the destination file; called once, after the first message of
    /// the stream has been validated.
    ///
    /// Only the leaf of `file_name` is used, so a crafted name cannot escape
    /// the record's subdirectory.
    pub async fn open(&mut self, owner_id: u64, record_id: u64, file_name: &str) -> VaultResult<()> {
        let leaf = Path::new(file_name)
            .file_name()
            .ok_or_else(|| VaultError::InvalidArgument("file name is empty".into()))?;

        let dir = attachment_dir(&self.root, owner_id, record_id);
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(leaf);
        let file = tokio::fs::File::create(&path).await?;
        debug!(path = %path.display(), "upload destination created");

        self.dest = Some((path, file));
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.dest.is_some()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Append one chunk in arrival order.
    pub async fn write(&mut self, chunk: &[u8]) -> VaultResult<()> {
        let Some((_, file)) = self.dest.as_mut() else {
            return Err(VaultError::Storage("upload destination not open".into()));
        };
        file.write_all(chunk).await?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    /// Flush and close, returning the destination path and total byte count.
    pub async fn finish(mut self) -> VaultResult<(PathBuf, u64)> {
        let Some((path, mut file)) = self.dest.take() else {
            return Err(VaultError::Storage("upload destination not open".into()));
        };
        file.flush().await?;
        drop(file);
        Ok((path, self.bytes_written))
    }

    /// Close the handle and remove whatever was written.
    pub async fn discard(mut self) -> VaultResult<()> {
        if let Some((path, file)) = self.dest.take() {
            drop(file);
            remove_bytes(&path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryFileStore;

    #[tokio::test]
    async fn test_uploader_writes_under_owner_record_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut uploader = Uploader::new(dir.path());
        uploader.open(4, 9, "notes.txt").await.unwrap();
        uploader.write(b"hello ").await.unwrap();
        uploader.write(b"world").await.unwrap();

        let (path, size) = uploader.finish().await.unwrap();
        assert_eq!(size, 11);
        assert_eq!(path, dir.path().join("4").join("9").join("notes.txt"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_uploader_strips_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let mut uploader = Uploader::new(dir.path());
        uploader.open(1, 2, "../../evil.txt").await.unwrap();
        uploader.write(b"x").await.unwrap();
        let (path, _) = uploader.finish().await.unwrap();
        assert_eq!(path, dir.path().join("1").join("2").join("evil.txt"));
    }

    #[tokio::test]
    async fn test_uploader_discard_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut uploader = Uploader::new(dir.path());
        uploader.open(1, 2, "partial.bin").await.unwrap();
        uploader.write(b"half").await.unwrap();
        let path = dir.path().join("1").join("2").join("partial.bin");
        assert!(path.exists());

        uploader.discard().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_save_insert_then_replace_deletes_old_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let service = FileService::new(Arc::new(MemoryFileStore::new()));

        let old_path = dir.path().join("v1.bin");
        tokio::fs::write(&old_path, b"old").await.unwrap();
        let mut file = FileAttachment {
            id: 0,
            name: "v1.bin".into(),
            path: old_path.clone(),
        };
        service.save(&mut file).await.unwrap();
        assert_ne!(file.id, 0);

        let new_path = dir.path().join("v2.bin");
        tokio::fs::write(&new_path, b"new").await.unwrap();
        let mut replacement = FileAttachment {
            id: file.id,
            name: "v2.bin".into(),
            path: new_path.clone(),
        };
        service.save(&mut replacement).await.unwrap();

        assert!(!old_path.exists(), "superseded bytes must be deleted");
        assert!(new_path.exists());
        assert_eq!(service.get(file.id).await.unwrap().name, "v2.bin");
    }

    #[tokio::test]
    async fn test_replace_onto_same_path_keeps_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let service = FileService::new(Arc::new(MemoryFileStore::new()));

        let path = dir.path().join("same.bin");
        tokio::fs::write(&path, b"v1").await.unwrap();
        let mut file = FileAttachment {
            id: 0,
            name: "same.bin".into(),
            path: path.clone(),
        };
        service.save(&mut file).await.unwrap();

        // Re-upload with the same leaf name lands on the same path; the
        // fresh bytes must survive the replace.
        tokio::fs::write(&path, b"v2").await.unwrap();
        let mut replacement = file.clone();
        service.save(&mut replacement).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_delete_missing_bytes_still_drops_row() {
        let service = FileService::new(Arc::new(MemoryFileStore::new()));
        let mut file = FileAttachment {
            id: 0,
            name: "ghost.bin".into(),
            path: "/nonexistent/ghost.bin".into(),
        };
        service.save(&mut file).await.unwrap();

        service.delete(file.id).await.unwrap();
        assert!(matches!(
            service.get(file.id).await.unwrap_err(),
            VaultError::NotFound
        ));
    }

    #[tokio::test]
    async fn test_delete_unknown_row_is_not_found() {
        let service = FileService::new(Arc::new(MemoryFileStore::new()));
        assert!(matches!(
            service.delete(42).await.unwrap_err(),
            VaultError::NotFound
        ));
    }
}
