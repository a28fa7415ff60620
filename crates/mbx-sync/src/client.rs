//! The facade applications talk to.
//!
//! Owns the engine, the cache manager, the auto-sync timer, and the live
//! config. Single-file operations return a progress stream that terminates
//! with an error item on failure; registration and removal return a
//! [`SyncResult`] value instead of failing the call.
//!
//! Config reads are copy-on-read: every operation clones the config at its
//! start, so a concurrent `update_config` never mutates an in-flight run.

use crate::autosync::AutoSync;
use crate::cache::CacheManager;
use crate::engine::{SyncEngine, SyncOutcome};
use crate::gate::{self, NetworkMonitor};
use futures::stream::BoxStream;
use mbx_core::{
    BatchSyncResult, FileMetadata, MbxError, MbxResult, ProgressFn, SyncConfig, SyncProgress,
    SyncResult, SyncStatus, SyncStrategy,
};
use mbx_store::{ArchiveExtractor, LocalStore, MetadataStore, RemoteStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::{UnboundedReceiverStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Progress updates for one single-file operation. The stream ends after the
/// terminal record; a failed operation pushes the error as its last item.
pub type ProgressStream = UnboundedReceiverStream<Result<SyncProgress, MbxError>>;

pub struct SyncClient {
    engine: SyncEngine,
    cache: CacheManager,
    autosync: Arc<AutoSync>,
    metadata: Arc<dyn MetadataStore>,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    monitor: Arc<dyn NetworkMonitor>,
    config_tx: watch::Sender<SyncConfig>,
    shutdown: CancellationToken,
}

impl SyncClient {
    pub fn new(
        config: SyncConfig,
        metadata: Arc<dyn MetadataStore>,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        archive: Arc<dyn ArchiveExtractor>,
        monitor: Arc<dyn NetworkMonitor>,
    ) -> MbxResult<Self> {
        config.validate()?;
        let engine = SyncEngine::new(
            Arc::clone(&metadata),
            Arc::clone(&local),
            Arc::clone(&remote),
            archive,
            Arc::clone(&monitor),
        );
        let cache = CacheManager::new(Arc::clone(&metadata), Arc::clone(&local));
        let (config_tx, _) = watch::channel(config);
        Ok(Self {
            engine,
            cache,
            autosync: Arc::new(AutoSync::new()),
            metadata,
            local,
            remote,
            monitor,
            config_tx,
            shutdown: CancellationToken::new(),
        })
    }

    // ── Single-file operations ────────────────────────────────────────────

    pub fn sync_file(&self, file_id: &str) -> ProgressStream {
        let engine = self.engine.clone();
        let config = self.get_config();
        let file_id = file_id.to_string();
        spawn_progress(move |progress| async move {
            engine
                .sync_file(&file_id, &config, Some(&progress))
                .await
                .map(|_| ())
        })
    }

    pub fn download_file(&self, file_id: &str, dest: Option<PathBuf>) -> ProgressStream {
        let engine = self.engine.clone();
        let config = self.get_config();
        let file_id = file_id.to_string();
        spawn_progress(move |progress| async move {
            engine
                .download_file(&file_id, &config, dest, Some(&progress))
                .await
                .map(|_| ())
        })
    }

    pub fn upload_file(&self, file_id: &str, src: Option<PathBuf>) -> ProgressStream {
        let engine = self.engine.clone();
        let config = self.get_config();
        let file_id = file_id.to_string();
        spawn_progress(move |progress| async move {
            engine
                .upload_file(&file_id, &config, src, Some(&progress))
                .await
                .map(|_| ())
        })
    }

    pub async fn resolve_conflict(&self, file_id: &str, resolution: SyncStrategy) -> SyncResult {
        let config = self.get_config();
        match self
            .engine
            .resolve_conflict(file_id, resolution, &config, None)
            .await
        {
            Ok(SyncOutcome::Synced(meta)) => SyncResult::Success(meta),
            Ok(SyncOutcome::Conflict { local, remote }) => SyncResult::Conflict { local, remote },
            Err(e) => SyncResult::from_error(Some(file_id.to_string()), &e),
        }
    }

    // ── Batch operations ──────────────────────────────────────────────────

    /// Run a batch sync, streaming cumulative snapshots as files complete.
    pub fn sync_all(&self) -> UnboundedReceiverStream<BatchSyncResult> {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = self.engine.clone();
        let config = self.get_config();
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            if let Err(e) = engine.sync_all(&config, &cancel, Some(&tx)).await {
                warn!(error = %e, "batch sync failed");
            }
        });
        UnboundedReceiverStream::new(rx)
    }

    /// Run a batch sync and wait for the final result.
    pub async fn sync_all_now(&self) -> MbxResult<BatchSyncResult> {
        let config = self.get_config();
        self.engine
            .sync_all(&config, &self.shutdown.child_token(), None)
            .await
    }

    // ── Registration ──────────────────────────────────────────────────────

    /// Register a file for syncing. `auto_sync` runs one reconciliation pass
    /// immediately after registration.
    pub async fn add_file(&self, meta: FileMetadata, auto_sync: bool) -> SyncResult {
        match self.metadata.get(&meta.file_id).await {
            Ok(Some(_)) => {
                return SyncResult::Error {
                    file_id: Some(meta.file_id),
                    message: "file already registered".into(),
                    detail: None,
                }
            }
            Ok(None) => {}
            Err(e) => return SyncResult::from_error(Some(meta.file_id.clone()), &e),
        }

        let mut meta = meta;
        meta.sync_status = SyncStatus::Pending;
        meta.is_deleted = false;
        if let Err(e) = self.metadata.save(&meta).await {
            return SyncResult::from_error(Some(meta.file_id.clone()), &e);
        }
        info!(file_id = %meta.file_id, name = %meta.file_name, "file registered");

        if auto_sync {
            let config = self.get_config();
            return match self.engine.sync_file(&meta.file_id, &config, None).await {
                Ok(SyncOutcome::Synced(synced)) => SyncResult::Success(synced),
                Ok(SyncOutcome::Conflict { local, remote }) => {
                    SyncResult::Conflict { local, remote }
                }
                Err(e) => SyncResult::from_error(Some(meta.file_id.clone()), &e),
            };
        }
        SyncResult::Success(meta)
    }

    /// Remove a file from syncing. Soft delete unless both local and remote
    /// removal are requested, in which case the record goes too.
    pub async fn remove_file(
        &self,
        file_id: &str,
        delete_local: bool,
        delete_remote: bool,
    ) -> SyncResult {
        let meta = match self.metadata.get(file_id).await {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                return SyncResult::Error {
                    file_id: Some(file_id.to_string()),
                    message: format!("file {file_id} is not registered"),
                    detail: None,
                }
            }
            Err(e) => return SyncResult::from_error(Some(file_id.to_string()), &e),
        };

        if delete_local {
            if let Some(path) = meta.local_path() {
                if let Err(e) = self.local.delete(path).await {
                    return SyncResult::from_error(Some(file_id.to_string()), &e);
                }
            }
            if let Some(dir) = meta.extracted_path.as_deref() {
                if let Err(e) = self.local.delete(dir).await {
                    return SyncResult::from_error(Some(file_id.to_string()), &e);
                }
            }
        }
        if delete_remote {
            if let Err(e) = self.remote.delete(file_id).await {
                return SyncResult::from_error(Some(file_id.to_string()), &e);
            }
        }

        let outcome = if delete_local && delete_remote {
            self.metadata.delete(file_id).await
        } else {
            self.metadata.mark_deleted(file_id).await
        };
        match outcome {
            Ok(()) => {
                info!(file_id, delete_local, delete_remote, "file removed");
                let mut removed = meta;
                removed.is_deleted = true;
                SyncResult::Success(removed)
            }
            Err(e) => SyncResult::from_error(Some(file_id.to_string()), &e),
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────

    pub async fn list_files(&self) -> MbxResult<Vec<FileMetadata>> {
        self.metadata.get_all().await
    }

    pub async fn get_file(&self, file_id: &str) -> MbxResult<Option<FileMetadata>> {
        self.metadata.get(file_id).await
    }

    pub fn observe_file(&self, file_id: &str) -> BoxStream<'static, FileMetadata> {
        self.metadata.observe(file_id)
    }

    pub fn observe_files(&self) -> BoxStream<'static, FileMetadata> {
        self.metadata.observe_all()
    }

    pub fn is_network_available(&self) -> bool {
        gate::allows(
            self.config_tx.borrow().network_type,
            self.monitor.current(),
        )
    }

    // ── Config ────────────────────────────────────────────────────────────

    pub fn get_config(&self) -> SyncConfig {
        self.config_tx.borrow().clone()
    }

    /// Swap the active config. A changed auto-sync interval restarts or
    /// stops a running timer; other fields take effect on the next
    /// operation (copy-on-read).
    pub async fn update_config(&self, config: SyncConfig) -> MbxResult<()> {
        config.validate()?;
        let old_interval = self.config_tx.borrow().auto_sync_interval_secs;
        self.config_tx.send_replace(config.clone());
        info!("config updated");

        if old_interval != config.auto_sync_interval_secs {
            self.autosync
                .apply_config(&self.engine, &self.config_tx.subscribe())
                .await;
        }
        Ok(())
    }

    /// Current config, then every subsequent update.
    pub fn observe_config(&self) -> WatchStream<SyncConfig> {
        WatchStream::new(self.config_tx.subscribe())
    }

    // ── Auto-sync and cache ───────────────────────────────────────────────

    pub async fn start_auto_sync(&self) {
        self.autosync
            .start(self.engine.clone(), self.config_tx.subscribe())
            .await;
    }

    pub async fn stop_auto_sync(&self) {
        self.autosync.stop().await;
    }

    pub async fn auto_sync_running(&self) -> bool {
        self.autosync.is_running().await
    }

    /// Apply the configured eviction policy now. Returns bytes reclaimed.
    pub async fn clear_cache(&self) -> MbxResult<u64> {
        let config = self.get_config();
        self.cache.clear_cache(&config).await
    }

    /// Stop the auto-sync timer and cancel in-flight batch runs.
    pub async fn close(&self) {
        self.autosync.stop().await;
        self.shutdown.cancel();
        info!("sync client closed");
    }
}

/// Spawn `run` with a progress callback wired to the returned stream. The
/// error, if any, becomes the stream's last item.
fn spawn_progress<F, Fut>(run: F) -> ProgressStream
where
    F: FnOnce(ProgressFn) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = MbxResult<()>> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let progress_tx = tx.clone();
    let progress: ProgressFn = Box::new(move |update| {
        let _ = progress_tx.send(Ok(update));
    });
    tokio::spawn(async move {
        if let Err(e) = run(progress).await {
            let _ = tx.send(Err(e));
        }
    });
    UnboundedReceiverStream::new(rx)
}
