//! Per-file reconciliation: the sync state machine and conflict resolution.
//!
//! A file moves `Pending → {Downloading, Uploading} → {Synced, Failed,
//! Conflict}` within one pass; a conflicted file re-enters a transfer state
//! through [`SyncEngine::resolve_conflict`]. Callers must not run two
//! operations for the same `file_id` concurrently; the batch runner upholds
//! this by launching at most one task per pending file.

use crate::gate::{self, NetworkMonitor};
use mbx_core::{
    unix_now, FileMetadata, MbxError, MbxResult, ProgressFn, RetryPolicy, SyncConfig,
    SyncProgress, SyncStatus, SyncStrategy,
};
use mbx_store::{is_archive, ArchiveExtractor, LocalStore, MetadataStore, RemoteStore};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Terminal outcome of one reconciliation pass.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    Synced(FileMetadata),
    /// Both sides changed under a strategy with no tie-break; `remote`
    /// describes the server copy so callers can present the two versions.
    Conflict {
        local: FileMetadata,
        remote: FileMetadata,
    },
}

#[derive(Clone)]
pub struct SyncEngine {
    metadata: Arc<dyn MetadataStore>,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    archive: Arc<dyn ArchiveExtractor>,
    monitor: Arc<dyn NetworkMonitor>,
}

impl SyncEngine {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        archive: Arc<dyn ArchiveExtractor>,
        monitor: Arc<dyn NetworkMonitor>,
    ) -> Self {
        Self {
            metadata,
            local,
            remote,
            archive,
            monitor,
        }
    }

    pub fn monitor(&self) -> &Arc<dyn NetworkMonitor> {
        &self.monitor
    }

    pub(crate) fn metadata_store(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Reconcile one file under the configured strategy.
    pub async fn sync_file(
        &self,
        file_id: &str,
        config: &SyncConfig,
        progress: Option<&ProgressFn>,
    ) -> MbxResult<SyncOutcome> {
        let meta = self.lookup(file_id).await?;
        self.check_gate(&meta, config, progress)?;

        match self.reconcile(&meta, config, progress).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.record_failure(&meta, !meta.is_downloaded, progress).await;
                Err(e)
            }
        }
    }

    /// Force a download regardless of strategy, optionally to `dest`.
    pub async fn download_file(
        &self,
        file_id: &str,
        config: &SyncConfig,
        dest: Option<PathBuf>,
        progress: Option<&ProgressFn>,
    ) -> MbxResult<SyncOutcome> {
        let meta = self.lookup(file_id).await?;
        self.check_gate(&meta, config, progress)?;

        match self.do_download(meta.clone(), config, dest, progress).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.record_failure(&meta, true, progress).await;
                Err(e)
            }
        }
    }

    /// Force an upload regardless of strategy, optionally from `src`.
    pub async fn upload_file(
        &self,
        file_id: &str,
        config: &SyncConfig,
        src: Option<PathBuf>,
        progress: Option<&ProgressFn>,
    ) -> MbxResult<SyncOutcome> {
        let meta = self.lookup(file_id).await?;
        self.check_gate(&meta, config, progress)?;

        match self.do_upload(meta.clone(), config, src, progress).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.record_failure(&meta, false, progress).await;
                Err(e)
            }
        }
    }

    /// Resolve a conflicted file. Only the three tie-breaking strategies are
    /// valid resolutions; anything else is a `ConflictState` error, as is
    /// calling this on a file that is not conflicted.
    pub async fn resolve_conflict(
        &self,
        file_id: &str,
        resolution: SyncStrategy,
        config: &SyncConfig,
        progress: Option<&ProgressFn>,
    ) -> MbxResult<SyncOutcome> {
        let meta = self.lookup(file_id).await?;
        if meta.sync_status != SyncStatus::Conflict {
            return Err(MbxError::ConflictState(format!(
                "file {file_id} is {}, not conflicted",
                meta.sync_status.as_str()
            )));
        }
        self.check_gate(&meta, config, progress)?;

        let attempt = match resolution {
            SyncStrategy::LocalWins => self.do_upload(meta.clone(), config, None, progress).await,
            SyncStrategy::RemoteWins => {
                self.do_download(meta.clone(), config, None, progress).await
            }
            SyncStrategy::NewestWins => match self.remote.metadata(file_id).await {
                Ok(Some(info)) if meta.last_modified > info.modified => {
                    self.do_upload(meta.clone(), config, None, progress).await
                }
                Ok(Some(_)) => self.do_download(meta.clone(), config, None, progress).await,
                // Remote copy vanished since the conflict: local is all there is.
                Ok(None) => self.do_upload(meta.clone(), config, None, progress).await,
                Err(e) => Err(e),
            },
            other => {
                return Err(MbxError::ConflictState(format!(
                    "{other:?} is not a valid conflict resolution"
                )))
            }
        };

        match attempt {
            Ok(outcome) => {
                info!(file_id, resolution = ?resolution, "conflict resolved");
                Ok(outcome)
            }
            Err(e) => {
                // Leave the record conflicted so resolution can be retried.
                if let Err(update_err) = self
                    .metadata
                    .update_sync_status(file_id, SyncStatus::Conflict)
                    .await
                {
                    warn!(file_id, error = %update_err, "failed to restore conflict status");
                }
                Err(e)
            }
        }
    }

    // ── Internals ─────────────────────────────────────────────────────────

    async fn lookup(&self, file_id: &str) -> MbxResult<FileMetadata> {
        self.metadata
            .get(file_id)
            .await?
            .ok_or_else(|| MbxError::NotFound(format!("file {file_id}")))
    }

    fn check_gate(
        &self,
        meta: &FileMetadata,
        config: &SyncConfig,
        progress: Option<&ProgressFn>,
    ) -> MbxResult<()> {
        let state = self.monitor.current();
        if gate::allows(config.network_type, state) {
            return Ok(());
        }
        // One failure record, no metadata mutation.
        emit(progress, SyncProgress::failed(meta, !meta.is_downloaded));
        Err(MbxError::NetworkUnsuitable(format!(
            "{:?} transport does not satisfy {:?}",
            state.transport, config.network_type
        )))
    }

    async fn record_failure(
        &self,
        meta: &FileMetadata,
        is_download: bool,
        progress: Option<&ProgressFn>,
    ) {
        if let Err(e) = self
            .metadata
            .update_sync_status(&meta.file_id, SyncStatus::Failed)
            .await
        {
            warn!(file_id = %meta.file_id, error = %e, "failed to record failure status");
        }
        emit(progress, SyncProgress::failed(meta, is_download));
    }

    async fn reconcile(
        &self,
        meta: &FileMetadata,
        config: &SyncConfig,
        progress: Option<&ProgressFn>,
    ) -> MbxResult<SyncOutcome> {
        match config.sync_strategy {
            SyncStrategy::DownloadOnly if meta.is_downloaded => {
                self.mark_synced(meta, true, progress).await
            }
            SyncStrategy::DownloadOnly => {
                self.do_download(meta.clone(), config, None, progress).await
            }
            SyncStrategy::UploadOnly if meta.is_uploaded => {
                self.mark_synced(meta, false, progress).await
            }
            SyncStrategy::UploadOnly => self.do_upload(meta.clone(), config, None, progress).await,
            _ => self.bidirectional(meta.clone(), config, progress).await,
        }
    }

    /// Already satisfied: refresh the sync marker without transferring.
    async fn mark_synced(
        &self,
        meta: &FileMetadata,
        is_download: bool,
        progress: Option<&ProgressFn>,
    ) -> MbxResult<SyncOutcome> {
        let mut updated = meta.clone();
        updated.sync_status = SyncStatus::Synced;
        updated.last_sync_time = Some(unix_now());
        self.metadata.save(&updated).await?;
        emit(progress, SyncProgress::completed(&updated, is_download));
        Ok(SyncOutcome::Synced(updated))
    }

    async fn bidirectional(
        &self,
        meta: FileMetadata,
        config: &SyncConfig,
        progress: Option<&ProgressFn>,
    ) -> MbxResult<SyncOutcome> {
        let remote_info = self.remote.metadata(&meta.file_id).await?;

        let local_path = meta.local_path().map(|p| p.to_path_buf());
        let local_present = match local_path.as_deref() {
            Some(path) => self.local.exists(path).await,
            None => false,
        };

        let (info, local_path) = match (remote_info, local_present) {
            (None, true) => return self.do_upload(meta, config, None, progress).await,
            (Some(_), false) => return self.do_download(meta, config, None, progress).await,
            (None, false) => {
                return Err(MbxError::NotFound(format!(
                    "file {} exists neither locally nor remotely",
                    meta.file_id
                )))
            }
            (Some(info), true) => match local_path {
                Some(path) => (info, path),
                // local_present implied a path.
                None => {
                    return Err(MbxError::NotFound(format!(
                        "file {} has no local path",
                        meta.file_id
                    )))
                }
            },
        };

        // Both sides present: compare content.
        let local_sum = match meta.local_checksum.clone() {
            Some(sum) => sum,
            None => self.local.checksum(&local_path).await?,
        };
        let remote_sum = match info.checksum.clone() {
            Some(sum) => Some(sum),
            None => self.remote.checksum(&meta.file_id).await?,
        };

        if remote_sum.as_deref() == Some(local_sum.as_str()) {
            // Identical content: no transfer.
            debug!(file_id = %meta.file_id, "checksums match, already in sync");
            let mut updated = meta;
            updated.local_checksum = Some(local_sum);
            updated.remote_checksum = remote_sum;
            return self.mark_synced(&updated, true, progress).await;
        }

        debug!(file_id = %meta.file_id, strategy = ?config.sync_strategy, "checksums differ");
        match config.sync_strategy {
            SyncStrategy::LocalWins => self.do_upload(meta, config, None, progress).await,
            SyncStrategy::RemoteWins => self.do_download(meta, config, None, progress).await,
            SyncStrategy::NewestWins => {
                if meta.last_modified > info.modified {
                    self.do_upload(meta, config, None, progress).await
                } else {
                    // Remote is newer, or the timestamps tie: take the remote.
                    self.do_download(meta, config, None, progress).await
                }
            }
            _ => {
                self.metadata
                    .update_sync_status(&meta.file_id, SyncStatus::Conflict)
                    .await?;
                let mut local_view = meta;
                local_view.sync_status = SyncStatus::Conflict;
                local_view.local_checksum = Some(local_sum);

                let mut remote_view = local_view.clone();
                remote_view.file_size = info.size;
                remote_view.last_modified = info.modified;
                remote_view.remote_checksum = remote_sum;

                emit(progress, SyncProgress::conflict(&local_view));
                info!(file_id = %local_view.file_id, "conflict detected, awaiting resolution");
                Ok(SyncOutcome::Conflict {
                    local: local_view,
                    remote: remote_view,
                })
            }
        }
    }

    async fn do_download(
        &self,
        mut meta: FileMetadata,
        config: &SyncConfig,
        dest_override: Option<PathBuf>,
        progress: Option<&ProgressFn>,
    ) -> MbxResult<SyncOutcome> {
        self.metadata
            .update_sync_status(&meta.file_id, SyncStatus::Downloading)
            .await?;
        meta.sync_status = SyncStatus::Downloading;
        emit(
            progress,
            SyncProgress::transfer(&meta, 0, meta.file_size, true),
        );

        let dest = dest_override
            .or_else(|| meta.local_path().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| config.sync_dir.join(&meta.file_name));

        let policy = RetryPolicy::from_config(config);
        let bytes = with_retry(&policy, &meta.file_id, "download", || {
            let remote = Arc::clone(&self.remote);
            let dest = dest.clone();
            let snapshot = meta.clone();
            async move {
                let file_id = snapshot.file_id.clone();
                let cb = move |transferred: u64, total: u64| {
                    emit(
                        progress,
                        SyncProgress::transfer(&snapshot, transferred, total, true),
                    );
                };
                remote.download(&file_id, &dest, Some(&cb)).await
            }
        })
        .await?;

        let local_checksum = self.local.checksum(&dest).await?;
        // The downloaded bytes are the remote bytes, so a missing remote
        // manifest still yields a usable remote checksum.
        let remote_checksum = self
            .remote
            .checksum(&meta.file_id)
            .await?
            .unwrap_or_else(|| local_checksum.clone());

        meta.is_downloaded = true;
        meta.local_checksum = Some(local_checksum);
        meta.remote_checksum = Some(remote_checksum);
        meta.file_path = dest.clone();
        meta.file_size = bytes;
        meta.sync_status = SyncStatus::Synced;
        meta.last_sync_time = Some(unix_now());

        if config.unzip_files && (meta.is_zip_file || is_archive(&meta.file_name)) {
            let extract_dir = dest.with_extension("");
            match self
                .archive
                .extract(&dest, &extract_dir, config.delete_zip_after_extract)
                .await
            {
                Ok(true) => {
                    meta.extracted_path = Some(extract_dir);
                    meta.is_extracted = true;
                }
                Ok(false) => {}
                Err(e) => {
                    // The download itself succeeded; keep the archive as-is.
                    warn!(file_id = %meta.file_id, error = %e, "archive extraction failed");
                }
            }
        }

        self.metadata.save(&meta).await?;
        emit(progress, SyncProgress::completed(&meta, true));
        info!(file_id = %meta.file_id, bytes, path = %dest.display(), "download complete");
        Ok(SyncOutcome::Synced(meta))
    }

    async fn do_upload(
        &self,
        mut meta: FileMetadata,
        config: &SyncConfig,
        src_override: Option<PathBuf>,
        progress: Option<&ProgressFn>,
    ) -> MbxResult<SyncOutcome> {
        let src = match src_override.or_else(|| meta.local_path().map(|p| p.to_path_buf())) {
            Some(path) => path,
            None => {
                return Err(MbxError::NotFound(format!(
                    "no local file recorded for {}",
                    meta.file_id
                )))
            }
        };
        if !self.local.exists(&src).await {
            return Err(MbxError::NotFound(format!(
                "local file missing: {}",
                src.display()
            )));
        }

        self.metadata
            .update_sync_status(&meta.file_id, SyncStatus::Uploading)
            .await?;
        meta.sync_status = SyncStatus::Uploading;
        emit(
            progress,
            SyncProgress::transfer(&meta, 0, meta.file_size, false),
        );

        let policy = RetryPolicy::from_config(config);
        let bytes = with_retry(&policy, &meta.file_id, "upload", || {
            let remote = Arc::clone(&self.remote);
            let src = src.clone();
            let snapshot = meta.clone();
            async move {
                let file_id = snapshot.file_id.clone();
                let cb = move |transferred: u64, total: u64| {
                    emit(
                        progress,
                        SyncProgress::transfer(&snapshot, transferred, total, false),
                    );
                };
                remote.upload(&file_id, &src, Some(&cb)).await
            }
        })
        .await?;

        let checksum = self.local.checksum(&src).await?;
        meta.is_uploaded = true;
        meta.local_checksum = Some(checksum.clone());
        meta.remote_checksum = Some(checksum);
        meta.file_path = src;
        meta.file_size = bytes;
        meta.sync_status = SyncStatus::Synced;
        meta.last_sync_time = Some(unix_now());

        self.metadata.save(&meta).await?;
        emit(progress, SyncProgress::completed(&meta, false));
        info!(file_id = %meta.file_id, bytes, "upload complete");
        Ok(SyncOutcome::Synced(meta))
    }
}

pub(crate) fn emit(progress: Option<&ProgressFn>, update: SyncProgress) {
    if let Some(p) = progress {
        p(update);
    }
}

/// Run `attempt_fn` until it succeeds, the error is terminal, or the policy
/// is exhausted. Only transfer-class errors are retried.
async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    file_id: &str,
    op: &str,
    mut attempt_fn: F,
) -> MbxResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = MbxResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    file_id,
                    op,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transfer failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
