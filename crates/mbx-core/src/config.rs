//! Sync policy configuration (loaded from mirrorbox.toml).

use crate::error::{MbxError, MbxResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How a file's local and remote copies are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Fetch missing remote content only; never upload.
    DownloadOnly,
    /// Push local content only; never download.
    UploadOnly,
    /// Reconcile both directions; genuine conflicts stop and wait.
    Bidirectional,
    /// Reconcile both directions; the local copy wins conflicts.
    LocalWins,
    /// Reconcile both directions; the remote copy wins conflicts.
    RemoteWins,
    /// Reconcile both directions; the newer `last_modified` wins conflicts.
    NewestWins,
}

impl SyncStrategy {
    /// Whether this strategy can settle a detected conflict on its own.
    pub fn resolves_conflicts(&self) -> bool {
        matches!(
            self,
            SyncStrategy::LocalWins | SyncStrategy::RemoteWins | SyncStrategy::NewestWins
        )
    }
}

/// Local retention policy for downloaded content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// Evict everything on `clear_cache`.
    NoCache,
    /// Evict files whose last sync is older than `file_expiry_secs`.
    CacheRecent,
    /// Evict lowest-priority files until under `max_cache_size`.
    CachePriority,
    /// Keep everything.
    CacheAll,
}

/// Connectivity constraint checked before any transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    Any,
    WifiOnly,
    UnmeteredOnly,
    /// Explicit offline mode: the gate always allows, so local-only
    /// bookkeeping keeps working regardless of connectivity.
    None,
}

/// Process-wide sync policy. One active instance, hot-swappable; operations
/// snapshot it on entry (copy-on-read).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Remote backend location: `memory://`, `fs:///path`, or `s3://bucket[/prefix]`.
    pub base_url: String,
    /// Bearer token forwarded to backends that accept one.
    pub auth_token: Option<String>,
    pub sync_strategy: SyncStrategy,
    pub cache_strategy: CacheStrategy,
    /// Concurrency cap for batch runs (>= 1).
    pub max_concurrent_transfers: usize,
    /// Periodic batch trigger, in seconds. None disables auto-sync.
    pub auto_sync_interval_secs: Option<u64>,
    pub network_type: NetworkType,
    /// Advisory for collaborators that support transport compression.
    pub compression_enabled: bool,
    /// Unpack recognized archives after download.
    pub unzip_files: bool,
    /// Remove the archive file once extracted.
    pub delete_zip_after_extract: bool,
    /// Transfer attempts per file (1 = no retry).
    pub retry_count: u32,
    /// Base backoff delay between attempts, in milliseconds.
    pub retry_delay_ms: u64,
    /// Byte ceiling enforced by `cache_priority`.
    pub max_cache_size: Option<u64>,
    /// Age cutoff used by `cache_recent`, in seconds.
    pub file_expiry_secs: Option<u64>,
    /// Default destination directory for downloads without a local path yet.
    pub sync_dir: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "memory://".into(),
            auth_token: None,
            sync_strategy: SyncStrategy::Bidirectional,
            cache_strategy: CacheStrategy::CacheAll,
            max_concurrent_transfers: 4,
            auto_sync_interval_secs: None,
            network_type: NetworkType::Any,
            compression_enabled: false,
            unzip_files: false,
            delete_zip_after_extract: false,
            retry_count: 3,
            retry_delay_ms: 1000,
            max_cache_size: None,
            file_expiry_secs: None,
            sync_dir: PathBuf::from("~/.local/share/mirrorbox/files"),
        }
    }
}

impl SyncConfig {
    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> MbxResult<()> {
        if self.base_url.is_empty() {
            return Err(MbxError::Config("base_url must not be empty".into()));
        }
        if self.max_concurrent_transfers == 0 {
            return Err(MbxError::Config(
                "max_concurrent_transfers must be at least 1".into(),
            ));
        }
        if self.auto_sync_interval_secs == Some(0) {
            return Err(MbxError::Config(
                "auto_sync_interval_secs must be positive when set".into(),
            ));
        }
        if self.retry_count == 0 {
            return Err(MbxError::Config(
                "retry_count must be at least 1 (1 = single attempt)".into(),
            ));
        }
        if self.cache_strategy == CacheStrategy::CacheRecent && self.file_expiry_secs.is_none() {
            return Err(MbxError::Config(
                "cache_recent requires file_expiry_secs".into(),
            ));
        }
        if self.cache_strategy == CacheStrategy::CachePriority && self.max_cache_size.is_none() {
            return Err(MbxError::Config(
                "cache_priority requires max_cache_size".into(),
            ));
        }
        Ok(())
    }
}
