//! Object-storage backup of the store's backing file.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::info;

use crate::copy_atomically;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupTransfer {
    pub remote_name: String,
    pub local_path: PathBuf,
    pub byte_size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupObject {
    pub remote_name: String,
    pub byte_size: u64,
    pub last_modified: DateTime<Utc>,
}

#[async_trait]
pub trait BackupStore: Send + Sync {
    /// `Ok(None)` when the remote object does not exist. The local file is
    /// replaced only after the whole object has been received.
    async fn download(
        &self,
        remote_name: &str,
        local_path: &Path,
    ) -> anyhow::Result<Option<BackupTransfer>>;

    async fn upload(&self, local_path: &Path, remote_name: &str) -> anyhow::Result<BackupTransfer>;

    async fn info(&self, remote_name: &str) -> anyhow::Result<Option<BackupObject>>;
}

/// Bucket emulated by a directory: each object is a file named after its key.
#[derive(Debug, Clone)]
pub struct DirectoryBackupStore {
    root: PathBuf,
}

impl DirectoryBackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, remote_name: &str) -> anyhow::Result<PathBuf> {
        let name = remote_name.trim();
        if name.is_empty() || name.contains(&['/', '\\'][..]) || name.starts_with('.') {
            bail!("invalid backup object name {remote_name:?}");
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl BackupStore for DirectoryBackupStore {
    async fn download(
        &self,
        remote_name: &str,
        local_path: &Path,
    ) -> anyhow::Result<Option<BackupTransfer>> {
        let object = self.object_path(remote_name)?;
        if !fs::try_exists(&object)
            .await
            .with_context(|| format!("checking backup object {}", object.display()))?
        {
            return Ok(None);
        }
        let (byte_size, sha256) = copy_atomically(&object, local_path).await?;
        info!(remote_name, local = %local_path.display(), byte_size, "backup downloaded");
        Ok(Some(BackupTransfer {
            remote_name: remote_name.to_string(),
            local_path: local_path.to_path_buf(),
            byte_size,
            sha256,
        }))
    }

    async fn upload(&self, local_path: &Path, remote_name: &str) -> anyhow::Result<BackupTransfer> {
        let object = self.object_path(remote_name)?;
        if !fs::try_exists(local_path)
            .await
            .with_context(|| format!("checking {}", local_path.display()))?
        {
            bail!("local file not found: {}", local_path.display());
        }
        let (byte_size, sha256) = copy_atomically(local_path, &object).await?;
        info!(remote_name, local = %local_path.display(), byte_size, %sha256, "backup uploaded");
        Ok(BackupTransfer {
            remote_name: remote_name.to_string(),
            local_path: local_path.to_path_buf(),
            byte_size,
            sha256,
        })
    }

    async fn info(&self, remote_name: &str) -> anyhow::Result<Option<BackupObject>> {
        let object = self.object_path(remote_name)?;
        let meta = match fs::metadata(&object).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading metadata {}", object.display()))
            }
        };
        let last_modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .with_context(|| format!("reading mtime {}", object.display()))?;
        Ok(Some(BackupObject {
            remote_name: remote_name.to_string(),
            byte_size: meta.len(),
            last_modified,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sha256_hex;
    use tempfile::tempdir;

    #[tokio::test]
    async fn upload_then_download_round_trips_the_store_file() {
        let dir = tempdir().unwrap();
        let bucket = DirectoryBackupStore::new(dir.path().join("bucket"));
        let local = dir.path().join("real_estate.db");
        std::fs::write(&local, b"sqlite bytes").unwrap();

        let up = bucket.upload(&local, "real_estate.db").await.unwrap();
        assert_eq!(up.byte_size, 12);
        assert_eq!(up.sha256, sha256_hex(b"sqlite bytes"));

        let restored = dir.path().join("restored.db");
        let down = bucket
            .download("real_estate.db", &restored)
            .await
            .unwrap()
            .expect("object exists");
        assert_eq!(down.sha256, up.sha256);
        assert_eq!(std::fs::read(&restored).unwrap(), b"sqlite bytes");

        let info = bucket.info("real_estate.db").await.unwrap().unwrap();
        assert_eq!(info.byte_size, 12);
    }

    #[tokio::test]
    async fn missing_object_leaves_local_file_untouched() {
        let dir = tempdir().unwrap();
        let bucket = DirectoryBackupStore::new(dir.path().join("bucket"));
        let local = dir.path().join("real_estate.db");
        std::fs::write(&local, b"local copy").unwrap();

        assert!(bucket.download("real_estate.db", &local).await.unwrap().is_none());
        assert_eq!(std::fs::read(&local).unwrap(), b"local copy");
        assert!(bucket.info("real_estate.db").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upload_of_missing_file_fails_and_rejects_bad_names() {
        let dir = tempdir().unwrap();
        let bucket = DirectoryBackupStore::new(dir.path());
        assert!(bucket.upload(&dir.path().join("nope.db"), "x.db").await.is_err());
        assert!(bucket.info("../escape.db").await.is_err());
    }
}
