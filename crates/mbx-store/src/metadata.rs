//! Metadata store: the durable catalog of `FileMetadata` records.
//!
//! Two backends behind one trait, selected at construction: in-memory for
//! tests and ephemeral runs, JSON-on-disk for persistence. The JSON catalog
//! is flushed atomically (temp file, then rename) on every mutation. Both
//! preserve registration order, which is the stable tie-break order for
//! priority eviction. Mutations are broadcast to observers.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use mbx_core::{FileMetadata, MbxError, MbxResult, SyncStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;

const CATALOG_VERSION: u32 = 1;
const EVENT_CAPACITY: usize = 64;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, file_id: &str) -> MbxResult<Option<FileMetadata>>;

    /// Live (non-soft-deleted) records in registration order.
    async fn get_all(&self) -> MbxResult<Vec<FileMetadata>>;

    /// Live records whose status is not `Synced`, in registration order.
    async fn get_unsynced(&self) -> MbxResult<Vec<FileMetadata>>;

    /// Insert or replace a record.
    async fn save(&self, meta: &FileMetadata) -> MbxResult<()>;

    async fn update_sync_status(&self, file_id: &str, status: SyncStatus) -> MbxResult<()>;

    async fn update_download_state(
        &self,
        file_id: &str,
        downloaded: bool,
        local_checksum: Option<String>,
        file_path: Option<PathBuf>,
    ) -> MbxResult<()>;

    async fn update_upload_state(
        &self,
        file_id: &str,
        uploaded: bool,
        remote_checksum: Option<String>,
    ) -> MbxResult<()>;

    /// Physically remove the record.
    async fn delete(&self, file_id: &str) -> MbxResult<()>;

    /// Soft delete: the record stays but disappears from listing queries.
    async fn mark_deleted(&self, file_id: &str) -> MbxResult<()>;

    /// Change feed for a single record.
    fn observe(&self, file_id: &str) -> BoxStream<'static, FileMetadata>;

    /// Change feed for every record.
    fn observe_all(&self) -> BoxStream<'static, FileMetadata>;
}

// ── Shared catalog ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Catalog {
    version: u32,
    files: HashMap<String, FileMetadata>,
    /// file_ids in registration order.
    order: Vec<String>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            version: CATALOG_VERSION,
            files: HashMap::new(),
            order: Vec::new(),
        }
    }
}

impl Catalog {
    fn upsert(&mut self, meta: FileMetadata) {
        if !self.files.contains_key(&meta.file_id) {
            self.order.push(meta.file_id.clone());
        }
        self.files.insert(meta.file_id.clone(), meta);
    }

    fn remove(&mut self, file_id: &str) -> Option<FileMetadata> {
        self.order.retain(|id| id != file_id);
        self.files.remove(file_id)
    }

    fn live(&self) -> Vec<FileMetadata> {
        self.order
            .iter()
            .filter_map(|id| self.files.get(id))
            .filter(|m| !m.is_deleted)
            .cloned()
            .collect()
    }

    fn unsynced(&self) -> Vec<FileMetadata> {
        self.live()
            .into_iter()
            .filter(|m| m.sync_status != SyncStatus::Synced)
            .collect()
    }
}

fn notify(events: &broadcast::Sender<FileMetadata>, meta: &FileMetadata) {
    // No receivers is fine.
    let _ = events.send(meta.clone());
}

fn change_stream(
    events: &broadcast::Sender<FileMetadata>,
    only: Option<String>,
) -> BoxStream<'static, FileMetadata> {
    let rx = events.subscribe();
    BroadcastStream::new(rx)
        .filter_map(move |item| {
            let out = match item {
                Ok(meta) => match &only {
                    Some(id) if meta.file_id != *id => None,
                    _ => Some(meta),
                },
                // A lagged receiver skips what it missed.
                Err(_) => None,
            };
            futures::future::ready(out)
        })
        .boxed()
}

fn missing(file_id: &str) -> MbxError {
    MbxError::NotFound(format!("file {file_id}"))
}

// ── In-memory backend ─────────────────────────────────────────────────────

pub struct MemoryMetadataStore {
    inner: RwLock<Catalog>,
    events: broadcast::Sender<FileMetadata>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: RwLock::new(Catalog::default()),
            events,
        }
    }
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, file_id: &str) -> MbxResult<Option<FileMetadata>> {
        Ok(self.inner.read().await.files.get(file_id).cloned())
    }

    async fn get_all(&self) -> MbxResult<Vec<FileMetadata>> {
        Ok(self.inner.read().await.live())
    }

    async fn get_unsynced(&self) -> MbxResult<Vec<FileMetadata>> {
        Ok(self.inner.read().await.unsynced())
    }

    async fn save(&self, meta: &FileMetadata) -> MbxResult<()> {
        let mut catalog = self.inner.write().await;
        catalog.upsert(meta.clone());
        notify(&self.events, meta);
        Ok(())
    }

    async fn update_sync_status(&self, file_id: &str, status: SyncStatus) -> MbxResult<()> {
        let mut catalog = self.inner.write().await;
        let meta = catalog.files.get_mut(file_id).ok_or_else(|| missing(file_id))?;
        meta.sync_status = status;
        let snapshot = meta.clone();
        notify(&self.events, &snapshot);
        Ok(())
    }

    async fn update_download_state(
        &self,
        file_id: &str,
        downloaded: bool,
        local_checksum: Option<String>,
        file_path: Option<PathBuf>,
    ) -> MbxResult<()> {
        let mut catalog = self.inner.write().await;
        let meta = catalog.files.get_mut(file_id).ok_or_else(|| missing(file_id))?;
        meta.is_downloaded = downloaded;
        meta.local_checksum = local_checksum;
        if let Some(path) = file_path {
            meta.file_path = path;
        }
        let snapshot = meta.clone();
        notify(&self.events, &snapshot);
        Ok(())
    }

    async fn update_upload_state(
        &self,
        file_id: &str,
        uploaded: bool,
        remote_checksum: Option<String>,
    ) -> MbxResult<()> {
        let mut catalog = self.inner.write().await;
        let meta = catalog.files.get_mut(file_id).ok_or_else(|| missing(file_id))?;
        meta.is_uploaded = uploaded;
        meta.remote_checksum = remote_checksum;
        let snapshot = meta.clone();
        notify(&self.events, &snapshot);
        Ok(())
    }

    async fn delete(&self, file_id: &str) -> MbxResult<()> {
        let mut catalog = self.inner.write().await;
        let mut removed = catalog.remove(file_id).ok_or_else(|| missing(file_id))?;
        removed.is_deleted = true;
        notify(&self.events, &removed);
        Ok(())
    }

    async fn mark_deleted(&self, file_id: &str) -> MbxResult<()> {
        let mut catalog = self.inner.write().await;
        let meta = catalog.files.get_mut(file_id).ok_or_else(|| missing(file_id))?;
        meta.is_deleted = true;
        let snapshot = meta.clone();
        notify(&self.events, &snapshot);
        Ok(())
    }

    fn observe(&self, file_id: &str) -> BoxStream<'static, FileMetadata> {
        change_stream(&self.events, Some(file_id.to_string()))
    }

    fn observe_all(&self) -> BoxStream<'static, FileMetadata> {
        change_stream(&self.events, None)
    }
}

// ── JSON file backend ─────────────────────────────────────────────────────

/// Persistent catalog at a single JSON file. Every mutation rewrites the
/// file through a sibling temp file and rename, so readers never observe a
/// torn catalog.
#[derive(Debug)]
pub struct JsonMetadataStore {
    path: PathBuf,
    inner: RwLock<Catalog>,
    events: broadcast::Sender<FileMetadata>,
}

impl JsonMetadataStore {
    /// Load the catalog at `path`, or start empty when the file is absent.
    pub async fn open(path: impl Into<PathBuf>) -> MbxResult<Self> {
        let path = path.into();
        let catalog = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                MbxError::Store(format!("parsing catalog {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Catalog::default(),
            Err(e) => {
                return Err(MbxError::Store(format!(
                    "reading catalog {}: {e}",
                    path.display()
                )))
            }
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            path,
            inner: RwLock::new(catalog),
            events,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, catalog: &Catalog) -> MbxResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    MbxError::Store(format!("creating {}: {e}", parent.display()))
                })?;
            }
        }
        let bytes = serde_json::to_vec_pretty(catalog)
            .map_err(|e| MbxError::Store(format!("encoding catalog: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| MbxError::Store(format!("writing {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| MbxError::Store(format!("renaming to {}: {e}", self.path.display())))?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn get(&self, file_id: &str) -> MbxResult<Option<FileMetadata>> {
        Ok(self.inner.read().await.files.get(file_id).cloned())
    }

    async fn get_all(&self) -> MbxResult<Vec<FileMetadata>> {
        Ok(self.inner.read().await.live())
    }

    async fn get_unsynced(&self) -> MbxResult<Vec<FileMetadata>> {
        Ok(self.inner.read().await.unsynced())
    }

    async fn save(&self, meta: &FileMetadata) -> MbxResult<()> {
        let mut catalog = self.inner.write().await;
        catalog.upsert(meta.clone());
        self.flush(&catalog).await?;
        notify(&self.events, meta);
        Ok(())
    }

    async fn update_sync_status(&self, file_id: &str, status: SyncStatus) -> MbxResult<()> {
        let mut catalog = self.inner.write().await;
        let meta = catalog.files.get_mut(file_id).ok_or_else(|| missing(file_id))?;
        meta.sync_status = status;
        let snapshot = meta.clone();
        self.flush(&catalog).await?;
        notify(&self.events, &snapshot);
        Ok(())
    }

    async fn update_download_state(
        &self,
        file_id: &str,
        downloaded: bool,
        local_checksum: Option<String>,
        file_path: Option<PathBuf>,
    ) -> MbxResult<()> {
        let mut catalog = self.inner.write().await;
        let meta = catalog.files.get_mut(file_id).ok_or_else(|| missing(file_id))?;
        meta.is_downloaded = downloaded;
        meta.local_checksum = local_checksum;
        if let Some(path) = file_path {
            meta.file_path = path;
        }
        let snapshot = meta.clone();
        self.flush(&catalog).await?;
        notify(&self.events, &snapshot);
        Ok(())
    }

    async fn update_upload_state(
        &self,
        file_id: &str,
        uploaded: bool,
        remote_checksum: Option<String>,
    ) -> MbxResult<()> {
        let mut catalog = self.inner.write().await;
        let meta = catalog.files.get_mut(file_id).ok_or_else(|| missing(file_id))?;
        meta.is_uploaded = uploaded;
        meta.remote_checksum = remote_checksum;
        let snapshot = meta.clone();
        self.flush(&catalog).await?;
        notify(&self.events, &snapshot);
        Ok(())
    }

    async fn delete(&self, file_id: &str) -> MbxResult<()> {
        let mut catalog = self.inner.write().await;
        let mut removed = catalog.remove(file_id).ok_or_else(|| missing(file_id))?;
        self.flush(&catalog).await?;
        removed.is_deleted = true;
        notify(&self.events, &removed);
        Ok(())
    }

    async fn mark_deleted(&self, file_id: &str) -> MbxResult<()> {
        let mut catalog = self.inner.write().await;
        let meta = catalog.files.get_mut(file_id).ok_or_else(|| missing(file_id))?;
        meta.is_deleted = true;
        let snapshot = meta.clone();
        self.flush(&catalog).await?;
        notify(&self.events, &snapshot);
        Ok(())
    }

    fn observe(&self, file_id: &str) -> BoxStream<'static, FileMetadata> {
        change_stream(&self.events, Some(file_id.to_string()))
    }

    fn observe_all(&self) -> BoxStream<'static, FileMetadata> {
        change_stream(&self.events, None)
    }
}
