use farm_core::{ChannelKey, ConnectionHandle, Error, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// An inbound channel being received chunk by chunk. Lives only under
/// `<cache>/staging` and is invisible to readers until published.
#[derive(Debug)]
pub struct StagedTransfer {
    pub key: ChannelKey,
    pub owner: Option<ConnectionHandle>,
    pub path: PathBuf,
    written: u64,
    limit: u64,
    hasher: Sha256,
    updated: Instant,
    closed: bool,
}

impl StagedTransfer {
    pub async fn create(
        staging_dir: &Path,
        key: ChannelKey,
        owner: Option<ConnectionHandle>,
        limit: u64,
    ) -> Result<Self> {
        let path = staging_path(staging_dir);
        tokio::fs::File::create(&path).await?;
        Ok(Self {
            key,
            owner,
            path,
            written: 0,
            limit,
            hasher: Sha256::new(),
            updated: Instant::now(),
            closed: false,
        })
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Appends `data` at `offset`, which must equal the bytes written so far.
    /// A transfer may never grow past `limit` bytes.
    pub async fn append(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Validation(format!("transfer for {} is no longer open", self.key)));
        }
        if offset != self.written {
            return Err(Error::Validation(format!(
                "non-contiguous chunk for {}: expected offset {}, got {}",
                self.key, self.written, offset
            )));
        }
        let size = self.written + data.len() as u64;
        if size > self.limit {
            return Err(Error::Capacity(format!(
                "{} would be {} bytes, larger than the whole cache ({})",
                self.key, size, self.limit
            )));
        }
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        self.hasher.update(data);
        self.written += data.len() as u64;
        self.updated = Instant::now();
        Ok(())
    }

    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.updated.elapsed() > timeout
    }

    /// Finishes hashing and closes the transfer to further chunks. The staged
    /// file stays on disk for publication.
    pub fn finish(&mut self) -> (PathBuf, String, u64) {
        self.closed = true;
        let hash = format!("{:x}", std::mem::take(&mut self.hasher).finalize());
        (self.path.clone(), hash, self.written)
    }

    /// Deletes the staged file. A finished transfer's file belongs to the
    /// publisher and is left alone.
    pub async fn discard(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = tokio::fs::remove_file(&self.path).await;
    }
}

pub fn staging_path(staging_dir: &Path) -> PathBuf {
    staging_dir.join(format!("{}.part", Uuid::new_v4()))
}

/// Removes leftovers from a previous run.
pub fn clear_staging(staging_dir: &Path) -> std::io::Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(staging_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::content_hash;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_contiguous_appends_hash_whole_payload() {
        let dir = TempDir::new().unwrap();
        let mut t = StagedTransfer::create(dir.path(), ChannelKey::shared("x"), None, u64::MAX)
            .await
            .unwrap();
        t.append(0, b"hello ").await.unwrap();
        t.append(6, b"world").await.unwrap();
        let (path, hash, size) = t.finish();
        assert_eq!(size, 11);
        assert_eq!(hash, content_hash(b"hello world"));
        assert_eq!(std::fs::read(path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_gap_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut t = StagedTransfer::create(dir.path(), ChannelKey::shared("x"), None, u64::MAX)
            .await
            .unwrap();
        t.append(0, b"abc").await.unwrap();
        let err = t.append(5, b"def").await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(t.written(), 3);
    }

    #[tokio::test]
    async fn test_growth_past_limit_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut t = StagedTransfer::create(dir.path(), ChannelKey::shared("x"), None, 5)
            .await
            .unwrap();
        t.append(0, b"abc").await.unwrap();
        let err = t.append(3, b"def").await.unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
        assert_eq!(t.written(), 3);
        assert_eq!(std::fs::read(&t.path).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_finished_transfer_refuses_chunks_and_keeps_file() {
        let dir = TempDir::new().unwrap();
        let mut t = StagedTransfer::create(dir.path(), ChannelKey::shared("x"), None, u64::MAX)
            .await
            .unwrap();
        t.append(0, b"abc").await.unwrap();
        let (path, _, _) = t.finish();
        assert!(t.append(3, b"def").await.is_err());
        t.discard().await;
        assert!(path.exists());
    }
}
