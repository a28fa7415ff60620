//! Remote storage access via OpenDAL.
//!
//! Content lives at `data/<file_id>` and a JSON manifest sidecar at
//! `meta/<file_id>.json` carries the checksum so conflict detection does not
//! have to download the payload. Backends that predate the sidecar (or had
//! content written by other tools) still answer `metadata()` from a raw stat,
//! just without a checksum.

use async_trait::async_trait;
use mbx_core::{MbxError, MbxResult, SyncConfig};
use opendal::Operator;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

const MANIFEST_VERSION: u32 = 1;

/// Bytes written to disk between progress callbacks.
const TRANSFER_CHUNK: usize = 4 * 1024 * 1024;

/// What the remote knows about a file, independent of backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFileInfo {
    pub size: u64,
    /// Unix seconds; 0 when the backend has no modification time.
    pub modified: u64,
    pub checksum: Option<String>,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Size, mtime and checksum of the remote copy, or `None` when absent.
    async fn metadata(&self, file_id: &str) -> MbxResult<Option<RemoteFileInfo>>;

    /// Fetch the remote content into `dest`, reporting `(bytes, total)`.
    async fn download(
        &self,
        file_id: &str,
        dest: &Path,
        progress: Option<&(dyn Fn(u64, u64) + Send + Sync)>,
    ) -> MbxResult<u64>;

    /// Push `src` to the remote, reporting `(bytes, total)`.
    async fn upload(
        &self,
        file_id: &str,
        src: &Path,
        progress: Option<&(dyn Fn(u64, u64) + Send + Sync)>,
    ) -> MbxResult<u64>;

    /// Remote content checksum, when the backend recorded one.
    async fn checksum(&self, file_id: &str) -> MbxResult<Option<String>>;

    /// Remove the remote copy. Absent files are fine.
    async fn delete(&self, file_id: &str) -> MbxResult<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RemoteManifest {
    version: u32,
    checksum: String,
    size: u64,
    modified: u64,
}

#[derive(Debug)]
pub struct OpendalRemoteStore {
    op: Operator,
    prefix: String,
}

impl OpendalRemoteStore {
    pub fn new(op: Operator) -> Self {
        Self::with_prefix(op, "")
    }

    pub fn with_prefix(op: Operator, prefix: impl Into<String>) -> Self {
        Self {
            op,
            prefix: prefix.into(),
        }
    }

    /// Build a store from `config.base_url`.
    ///
    /// `memory://[prefix]` keeps everything in-process, `fs:///path` uses a
    /// local directory, `s3://bucket[/prefix]` talks to S3-compatible storage
    /// with credentials from the environment.
    pub fn connect(config: &SyncConfig) -> MbxResult<Self> {
        let url = config.base_url.as_str();
        if let Some(rest) = url.strip_prefix("memory://") {
            let op = build_operator(opendal::services::Memory::default())?;
            return Ok(Self::with_prefix(op, rest.trim_matches('/')));
        }
        if let Some(root) = url.strip_prefix("fs://") {
            if root.is_empty() {
                return Err(MbxError::Config("fs:// URL needs a root path".into()));
            }
            let op = build_operator(opendal::services::Fs::default().root(root))?;
            return Ok(Self::new(op));
        }
        if let Some(rest) = url.strip_prefix("s3://") {
            let (bucket, prefix) = match rest.split_once('/') {
                Some((b, p)) => (b, p.trim_matches('/')),
                None => (rest, ""),
            };
            if bucket.is_empty() {
                return Err(MbxError::Config("s3:// URL needs a bucket".into()));
            }
            let region =
                std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string());
            let access_key = std::env::var("AWS_ACCESS_KEY_ID")
                .or_else(|_| std::env::var("MBX_ACCESS_KEY_ID"))
                .unwrap_or_default();
            let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
                .or_else(|_| std::env::var("MBX_SECRET_ACCESS_KEY"))
                .unwrap_or_default();

            // The 0.55 S3 builder consumes self on every setter; path-style
            // addressing is already the default.
            let mut builder = opendal::services::S3::default()
                .bucket(bucket)
                .region(&region)
                .access_key_id(&access_key)
                .secret_access_key(&secret_key);
            if let Ok(endpoint) = std::env::var("MBX_S3_ENDPOINT") {
                builder = builder.endpoint(&endpoint);
            }
            let op = build_operator(builder)?;
            return Ok(Self::with_prefix(op, prefix));
        }
        Err(MbxError::Config(format!(
            "unsupported base_url scheme: {url}"
        )))
    }

    fn data_key(&self, file_id: &str) -> String {
        if self.prefix.is_empty() {
            format!("data/{file_id}")
        } else {
            format!("{}/data/{file_id}", self.prefix)
        }
    }

    fn manifest_key(&self, file_id: &str) -> String {
        if self.prefix.is_empty() {
            format!("meta/{file_id}.json")
        } else {
            format!("{}/meta/{file_id}.json", self.prefix)
        }
    }

    async fn read_manifest(&self, file_id: &str) -> MbxResult<Option<RemoteManifest>> {
        match self.op.read(&self.manifest_key(file_id)).await {
            Ok(buf) => {
                let manifest = serde_json::from_slice(&buf.to_bytes()).map_err(|e| {
                    MbxError::Transfer(format!("parsing manifest for {file_id}: {e}"))
                })?;
                Ok(Some(manifest))
            }
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(transfer_err("reading manifest", file_id, e)),
        }
    }
}

fn build_operator(builder: impl opendal::Builder) -> MbxResult<Operator> {
    let op = Operator::new(builder)
        .map_err(|e| MbxError::Config(format!("creating storage operator: {e}")))?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();
    Ok(op)
}

fn transfer_err(ctx: &str, file_id: &str, e: opendal::Error) -> MbxError {
    MbxError::Transfer(format!("{ctx} for {file_id}: {e}"))
}

#[async_trait]
impl RemoteStore for OpendalRemoteStore {
    async fn metadata(&self, file_id: &str) -> MbxResult<Option<RemoteFileInfo>> {
        if let Some(manifest) = self.read_manifest(file_id).await? {
            return Ok(Some(RemoteFileInfo {
                size: manifest.size,
                modified: manifest.modified,
                checksum: Some(manifest.checksum),
            }));
        }
        // No sidecar: fall back to a raw stat of the content itself.
        match self.op.stat(&self.data_key(file_id)).await {
            Ok(stat) => Ok(Some(RemoteFileInfo {
                size: stat.content_length(),
                modified: stat
                    .last_modified()
                    .map(|t| t.into_inner().as_second().max(0) as u64)
                    .unwrap_or(0),
                checksum: None,
            })),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(transfer_err("stat", file_id, e)),
        }
    }

    async fn download(
        &self,
        file_id: &str,
        dest: &Path,
        progress: Option<&(dyn Fn(u64, u64) + Send + Sync)>,
    ) -> MbxResult<u64> {
        let key = self.data_key(file_id);
        let buf = match self.op.read(&key).await {
            Ok(buf) => buf,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => {
                return Err(MbxError::NotFound(format!("remote file {file_id}")))
            }
            Err(e) => return Err(transfer_err("download", file_id, e)),
        };
        let data = buf.to_bytes();
        let total = data.len() as u64;

        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        // Write to a temp sibling and rename, so a crash never leaves a
        // half-written file at the destination.
        let tmp = dest.with_extension("mbx_tmp");
        {
            use tokio::io::AsyncWriteExt;
            let mut out = tokio::fs::File::create(&tmp).await?;
            let mut written = 0u64;
            for chunk in data.chunks(TRANSFER_CHUNK) {
                out.write_all(chunk).await?;
                written += chunk.len() as u64;
                if let Some(cb) = progress {
                    cb(written, total);
                }
            }
            out.flush().await?;
        }
        tokio::fs::rename(&tmp, dest).await?;

        debug!(file_id, bytes = total, path = %dest.display(), "downloaded");
        Ok(total)
    }

    async fn upload(
        &self,
        file_id: &str,
        src: &Path,
        progress: Option<&(dyn Fn(u64, u64) + Send + Sync)>,
    ) -> MbxResult<u64> {
        let data = match tokio::fs::read(src).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MbxError::NotFound(format!(
                    "local file {}",
                    src.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let total = data.len() as u64;
        let checksum = blake3::hash(&data).to_hex().to_string();

        if let Some(cb) = progress {
            cb(0, total);
        }
        self.op
            .write(&self.data_key(file_id), data)
            .await
            .map_err(|e| transfer_err("upload", file_id, e))?;
        if let Some(cb) = progress {
            cb(total, total);
        }

        let manifest = RemoteManifest {
            version: MANIFEST_VERSION,
            checksum,
            size: total,
            modified: mbx_core::unix_now(),
        };
        let bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| MbxError::Transfer(format!("encoding manifest for {file_id}: {e}")))?;
        self.op
            .write(&self.manifest_key(file_id), bytes)
            .await
            .map_err(|e| transfer_err("writing manifest", file_id, e))?;

        debug!(file_id, bytes = total, "uploaded");
        Ok(total)
    }

    async fn checksum(&self, file_id: &str) -> MbxResult<Option<String>> {
        Ok(self.read_manifest(file_id).await?.map(|m| m.checksum))
    }

    async fn delete(&self, file_id: &str) -> MbxResult<()> {
        self.op
            .delete(&self.data_key(file_id))
            .await
            .map_err(|e| transfer_err("delete", file_id, e))?;
        self.op
            .delete(&self.manifest_key(file_id))
            .await
            .map_err(|e| transfer_err("deleting manifest", file_id, e))?;
        Ok(())
    }
}
