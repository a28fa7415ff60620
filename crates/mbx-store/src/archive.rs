//! Post-download archive extraction.

use async_trait::async_trait;
use mbx_core::{MbxError, MbxResult};
use std::path::Path;
use std::process::Stdio;
use tracing::debug;

/// True when the name looks like a zip archive.
pub fn is_archive(file_name: &str) -> bool {
    Path::new(file_name)
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

#[async_trait]
pub trait ArchiveExtractor: Send + Sync {
    /// Extract `src` into `dest_dir`. Returns `false` when the extractor
    /// declines the file (wrong format), `true` after a real extraction.
    async fn extract(&self, src: &Path, dest_dir: &Path, delete_after: bool) -> MbxResult<bool>;
}

/// Extractor that never extracts. Use when unzip support is disabled.
#[derive(Debug, Clone, Default)]
pub struct NoopExtractor;

#[async_trait]
impl ArchiveExtractor for NoopExtractor {
    async fn extract(&self, _src: &Path, _dest_dir: &Path, _delete_after: bool) -> MbxResult<bool> {
        Ok(false)
    }
}

/// Shells out to `unzip -o`, which is available everywhere we deploy and
/// handles zip64 without us carrying a decompression dependency.
#[derive(Debug, Clone, Default)]
pub struct UnzipCommandExtractor;

impl UnzipCommandExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ArchiveExtractor for UnzipCommandExtractor {
    async fn extract(&self, src: &Path, dest_dir: &Path, delete_after: bool) -> MbxResult<bool> {
        let name = src
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if !is_archive(&name) {
            return Ok(false);
        }

        tokio::fs::create_dir_all(dest_dir).await?;

        let status = tokio::process::Command::new("unzip")
            .arg("-o")
            .arg(src)
            .arg("-d")
            .arg(dest_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;

        if !status.success() {
            return Err(MbxError::Other(anyhow::anyhow!(
                "unzip exited with {} for {}",
                status,
                src.display()
            )));
        }

        debug!(src = %src.display(), dest = %dest_dir.display(), "extracted archive");

        if delete_after {
            tokio::fs::remove_file(src).await?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn archive_detection_is_extension_based() {
        assert!(is_archive("bundle.zip"));
        assert!(is_archive("BUNDLE.ZIP"));
        assert!(is_archive("dir.v2.zip"));
        assert!(!is_archive("notes.txt"));
        assert!(!is_archive("zip"));
        assert!(!is_archive("archive.tar.gz"));
    }

    #[tokio::test]
    async fn noop_never_extracts() {
        let dir = TempDir::new().unwrap();
        let done = NoopExtractor
            .extract(&dir.path().join("a.zip"), dir.path(), false)
            .await
            .unwrap();
        assert!(!done);
    }

    #[tokio::test]
    async fn unzip_declines_non_archives() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("plain.txt");
        tokio::fs::write(&src, b"text").await.unwrap();

        let done = UnzipCommandExtractor::new()
            .extract(&src, &dir.path().join("out"), true)
            .await
            .unwrap();

        assert!(!done);
        // Declined files are left alone even with delete_after.
        assert!(src.exists());
    }
}
