//! Core value types: per-file metadata, progress records, batch aggregates.

use crate::error::MbxError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Progress callback type invoked by the engine during single-file operations.
pub type ProgressFn = Box<dyn Fn(SyncProgress) + Send + Sync>;

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Reconciliation state of a file.
///
/// `Pending → {Downloading, Uploading} → {Synced, Failed, Conflict}`;
/// a `Conflict` re-enters a transfer state via conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Downloading,
    Uploading,
    Synced,
    Failed,
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Downloading => "downloading",
            SyncStatus::Uploading => "uploading",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
            SyncStatus::Conflict => "conflict",
        }
    }
}

/// One record per logical file, keyed by the immutable `file_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_id: String,
    pub file_name: String,
    /// Local path; empty until the first download lands (or the caller
    /// registers an existing local file).
    pub file_path: PathBuf,
    pub remote_url: String,
    /// Unix seconds; authoritative for `NEWEST_WINS`.
    pub last_modified: u64,
    pub file_size: u64,
    pub sync_status: SyncStatus,
    pub local_checksum: Option<String>,
    pub remote_checksum: Option<String>,
    pub last_sync_time: Option<u64>,
    pub is_downloaded: bool,
    pub is_uploaded: bool,
    /// Soft-delete flag; excluded from listing queries but kept on record.
    pub is_deleted: bool,
    /// Lower values are evicted first under priority caching.
    pub priority: i32,
    pub is_zip_file: bool,
    pub extracted_path: Option<PathBuf>,
    pub is_extracted: bool,
}

impl FileMetadata {
    /// Fresh `Pending` record with a generated id.
    pub fn new(file_name: impl Into<String>, remote_url: impl Into<String>) -> Self {
        Self {
            file_id: uuid::Uuid::new_v4().to_string(),
            file_name: file_name.into(),
            file_path: PathBuf::new(),
            remote_url: remote_url.into(),
            last_modified: unix_now(),
            file_size: 0,
            sync_status: SyncStatus::Pending,
            local_checksum: None,
            remote_checksum: None,
            last_sync_time: None,
            is_downloaded: false,
            is_uploaded: false,
            is_deleted: false,
            priority: 0,
            is_zip_file: false,
            extracted_path: None,
            is_extracted: false,
        }
    }

    /// The local path, if one has been assigned.
    pub fn local_path(&self) -> Option<&Path> {
        if self.file_path.as_os_str().is_empty() {
            None
        } else {
            Some(&self.file_path)
        }
    }

    /// Where the usable content lives: the extracted directory when an
    /// archive was unpacked, otherwise the downloaded file itself.
    pub fn content_path(&self) -> Option<PathBuf> {
        if self.is_extracted {
            if let Some(dir) = &self.extracted_path {
                return Some(dir.clone());
            }
        }
        self.local_path().map(Path::to_path_buf)
    }
}

/// Transient per-operation progress value, streamed to callers. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncProgress {
    pub file_id: String,
    pub file_name: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// 0.0–1.0
    pub progress: f64,
    pub status: SyncStatus,
    pub is_download: bool,
    pub file_path: Option<PathBuf>,
}

impl SyncProgress {
    fn base(meta: &FileMetadata, status: SyncStatus, is_download: bool) -> Self {
        Self {
            file_id: meta.file_id.clone(),
            file_name: meta.file_name.clone(),
            bytes_transferred: 0,
            total_bytes: meta.file_size,
            progress: 0.0,
            status,
            is_download,
            file_path: meta.content_path(),
        }
    }

    /// An in-flight transfer sample.
    pub fn transfer(meta: &FileMetadata, bytes: u64, total: u64, is_download: bool) -> Self {
        let status = if is_download {
            SyncStatus::Downloading
        } else {
            SyncStatus::Uploading
        };
        let ratio = if total == 0 {
            1.0
        } else {
            (bytes as f64 / total as f64).clamp(0.0, 1.0)
        };
        Self {
            bytes_transferred: bytes,
            total_bytes: total,
            progress: ratio,
            ..Self::base(meta, status, is_download)
        }
    }

    /// Terminal success record; `file_path` points at the final content.
    pub fn completed(meta: &FileMetadata, is_download: bool) -> Self {
        Self {
            bytes_transferred: meta.file_size,
            progress: 1.0,
            ..Self::base(meta, SyncStatus::Synced, is_download)
        }
    }

    /// Terminal failure record.
    pub fn failed(meta: &FileMetadata, is_download: bool) -> Self {
        Self::base(meta, SyncStatus::Failed, is_download)
    }

    /// Terminal conflict record (no transfer performed).
    pub fn conflict(meta: &FileMetadata) -> Self {
        Self::base(meta, SyncStatus::Conflict, true)
    }
}

/// Cumulative snapshot of a batch run.
///
/// Each recorder bumps exactly one outcome bucket plus `total_processed`, so
/// `total_processed == success_count + failed_count + conflict_count` holds at
/// every snapshot a completed run emits.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSyncResult {
    pub success_count: usize,
    pub failed_count: usize,
    pub conflict_count: usize,
    /// `(file_id, message)` in completion order.
    pub failed_files: Vec<(String, String)>,
    pub total_processed: usize,
}

impl BatchSyncResult {
    pub fn record_success(&mut self) {
        self.success_count += 1;
        self.total_processed += 1;
    }

    pub fn record_conflict(&mut self) {
        self.conflict_count += 1;
        self.total_processed += 1;
    }

    pub fn record_failure(&mut self, file_id: &str, message: impl Into<String>) {
        self.failed_count += 1;
        self.total_processed += 1;
        self.failed_files.push((file_id.to_string(), message.into()));
    }

    pub fn is_consistent(&self) -> bool {
        self.total_processed == self.success_count + self.failed_count + self.conflict_count
            && self.failed_files.len() == self.failed_count
    }
}

/// Outcome of a discrete facade operation.
#[derive(Debug, Clone)]
pub enum SyncResult {
    Success(FileMetadata),
    Error {
        file_id: Option<String>,
        message: String,
        detail: Option<String>,
    },
    Conflict {
        local: FileMetadata,
        remote: FileMetadata,
    },
}

impl SyncResult {
    pub fn from_error(file_id: Option<String>, err: &MbxError) -> Self {
        let detail = match err {
            MbxError::Io(inner) => Some(inner.kind().to_string()),
            MbxError::Other(inner) => inner.source().map(|s| s.to_string()),
            _ => None,
        };
        SyncResult::Error {
            file_id,
            message: err.to_string(),
            detail,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SyncResult::Success(_))
    }
}
