//! Local filesystem access for synced content.

use async_trait::async_trait;
use mbx_core::MbxResult;
use std::path::{Path, PathBuf};
use tracing::warn;

#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn exists(&self, path: &Path) -> bool;

    async fn read(&self, path: &Path) -> MbxResult<Vec<u8>>;

    /// Write atomically: temp sibling first, then rename over the target.
    async fn write(&self, path: &Path, data: &[u8]) -> MbxResult<()>;

    /// Remove a file or a directory tree. Missing targets are fine.
    async fn delete(&self, path: &Path) -> MbxResult<()>;

    /// Hex BLAKE3 digest of the file contents.
    async fn checksum(&self, path: &Path) -> MbxResult<String>;

    /// Bytes occupied by a file, or by a whole tree for directories.
    async fn size(&self, path: &Path) -> MbxResult<u64>;

    async fn create_dir(&self, path: &Path) -> MbxResult<()>;

    async fn rename(&self, from: &Path, to: &Path) -> MbxResult<()>;

    async fn copy(&self, from: &Path, to: &Path) -> MbxResult<u64>;

    /// Total bytes under a directory.
    async fn total_size(&self, dir: &Path) -> MbxResult<u64>;

    /// Delete every entry under `dir`, returning the bytes freed.
    async fn clear(&self, dir: &Path) -> MbxResult<u64>;
}

#[derive(Debug, Clone, Default)]
pub struct FsLocalStore;

impl FsLocalStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LocalStore for FsLocalStore {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn read(&self, path: &Path) -> MbxResult<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn write(&self, path: &Path, data: &[u8]) -> MbxResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = path.with_extension("mbx_tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn delete(&self, path: &Path) -> MbxResult<()> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await?,
            Ok(_) => tokio::fs::remove_file(path).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn checksum(&self, path: &Path) -> MbxResult<String> {
        let data = tokio::fs::read(path).await?;
        Ok(blake3::hash(&data).to_hex().to_string())
    }

    async fn size(&self, path: &Path) -> MbxResult<u64> {
        let meta = tokio::fs::metadata(path).await?;
        if meta.is_dir() {
            self.total_size(path).await
        } else {
            Ok(meta.len())
        }
    }

    async fn create_dir(&self, path: &Path) -> MbxResult<()> {
        Ok(tokio::fs::create_dir_all(path).await?)
    }

    async fn rename(&self, from: &Path, to: &Path) -> MbxResult<()> {
        if let Some(parent) = to.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(tokio::fs::rename(from, to).await?)
    }

    async fn copy(&self, from: &Path, to: &Path) -> MbxResult<u64> {
        if let Some(parent) = to.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(tokio::fs::copy(from, to).await?)
    }

    async fn total_size(&self, dir: &Path) -> MbxResult<u64> {
        let mut total = 0u64;
        let mut stack: Vec<PathBuf> = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    stack.push(entry.path());
                } else {
                    total += meta.len();
                }
            }
        }
        Ok(total)
    }

    async fn clear(&self, dir: &Path) -> MbxResult<u64> {
        let mut freed = 0u64;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let bytes = self.size(&path).await.unwrap_or(0);
            match self.delete(&path).await {
                Ok(()) => freed += bytes,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to clear entry, skipping");
                }
            }
        }
        Ok(freed)
    }
}
