//! Cache eviction: bounds or clears local retention of downloaded content.
//!
//! Eviction never touches the remote copy. An evicted file drops back to
//! `Pending` with its local artifacts (file and extracted tree) removed, so
//! the next sync pass downloads it again if wanted.

use mbx_core::{
    CacheStrategy, FileMetadata, MbxError, MbxResult, SyncConfig, SyncStatus, unix_now,
};
use mbx_store::{LocalStore, MetadataStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct CacheManager {
    metadata: Arc<dyn MetadataStore>,
    local: Arc<dyn LocalStore>,
}

impl CacheManager {
    pub fn new(metadata: Arc<dyn MetadataStore>, local: Arc<dyn LocalStore>) -> Self {
        Self { metadata, local }
    }

    /// Apply the configured eviction policy. Returns bytes reclaimed.
    pub async fn clear_cache(&self, config: &SyncConfig) -> MbxResult<u64> {
        let freed = match config.cache_strategy {
            CacheStrategy::CacheAll => 0,
            CacheStrategy::NoCache => self.evict_all().await?,
            CacheStrategy::CacheRecent => self.evict_expired(config).await?,
            CacheStrategy::CachePriority => self.evict_by_priority(config).await?,
        };
        info!(strategy = ?config.cache_strategy, freed, "cache eviction pass done");
        Ok(freed)
    }

    async fn evict_all(&self) -> MbxResult<u64> {
        let mut freed = 0u64;
        for meta in self.downloaded().await? {
            freed += self.evict_one(&meta).await;
        }
        Ok(freed)
    }

    async fn evict_expired(&self, config: &SyncConfig) -> MbxResult<u64> {
        let expiry = config.file_expiry_secs.ok_or_else(|| {
            MbxError::Config("cache_strategy cache_recent requires file_expiry_secs".into())
        })?;
        let cutoff = unix_now().saturating_sub(expiry);

        let mut freed = 0u64;
        for meta in self.downloaded().await? {
            // Files that never completed a sync have no age to expire on.
            let expired = meta.last_sync_time.map(|t| t < cutoff).unwrap_or(false);
            if expired {
                freed += self.evict_one(&meta).await;
            }
        }
        Ok(freed)
    }

    async fn evict_by_priority(&self, config: &SyncConfig) -> MbxResult<u64> {
        let max = config.max_cache_size.ok_or_else(|| {
            MbxError::Config("cache_strategy cache_priority requires max_cache_size".into())
        })?;

        let mut sized = Vec::new();
        let mut total = 0u64;
        for meta in self.downloaded().await? {
            let bytes = self.occupancy(&meta).await;
            total += bytes;
            sized.push(meta);
        }
        if total <= max {
            debug!(total, max, "cache within budget, nothing to evict");
            return Ok(0);
        }

        // Stable sort: ties keep registration order.
        sized.sort_by_key(|meta| meta.priority);

        let mut freed = 0u64;
        for meta in sized {
            if total.saturating_sub(freed) <= max {
                break;
            }
            freed += self.evict_one(&meta).await;
        }
        Ok(freed)
    }

    async fn downloaded(&self) -> MbxResult<Vec<FileMetadata>> {
        Ok(self
            .metadata
            .get_all()
            .await?
            .into_iter()
            .filter(|m| m.is_downloaded)
            .collect())
    }

    async fn occupancy(&self, meta: &FileMetadata) -> u64 {
        let mut bytes = 0u64;
        if let Some(path) = meta.local_path() {
            bytes += self.local.size(path).await.unwrap_or(0);
        }
        if let Some(dir) = meta.extracted_path.as_deref() {
            bytes += self.local.size(dir).await.unwrap_or(0);
        }
        bytes
    }

    /// Delete one file's local artifacts and reset its record to `Pending`.
    /// A failed eviction is logged and contributes zero reclaimed bytes.
    async fn evict_one(&self, meta: &FileMetadata) -> u64 {
        let bytes = self.occupancy(meta).await;

        if let Some(path) = meta.local_path() {
            if let Err(e) = self.local.delete(path).await {
                warn!(file_id = %meta.file_id, error = %e, "eviction failed, skipping file");
                return 0;
            }
        }
        if let Some(dir) = meta.extracted_path.as_deref() {
            if let Err(e) = self.local.delete(dir).await {
                warn!(file_id = %meta.file_id, error = %e, "failed to remove extracted tree");
                return 0;
            }
        }

        let mut reset = meta.clone();
        reset.is_downloaded = false;
        reset.local_checksum = None;
        reset.sync_status = SyncStatus::Pending;
        reset.extracted_path = None;
        reset.is_extracted = false;
        if let Err(e) = self.metadata.save(&reset).await {
            warn!(file_id = %meta.file_id, error = %e, "failed to reset evicted record");
            return 0;
        }

        debug!(file_id = %meta.file_id, bytes, "evicted");
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbx_store::{FsLocalStore, MemoryMetadataStore};
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        manager: CacheManager,
        metadata: Arc<MemoryMetadataStore>,
        local: Arc<FsLocalStore>,
        dir: TempDir,
    }

    fn fixture() -> Fixture {
        let metadata = Arc::new(MemoryMetadataStore::new());
        let local = Arc::new(FsLocalStore::new());
        let manager = CacheManager::new(metadata.clone(), local.clone());
        Fixture {
            manager,
            metadata,
            local,
            dir: TempDir::new().unwrap(),
        }
    }

    async fn add_downloaded(fx: &Fixture, id: &str, size: usize, priority: i32) -> FileMetadata {
        let mut meta = FileMetadata::new(format!("{id}.bin"), "memory://");
        meta.file_id = id.to_string();
        meta.priority = priority;
        meta.file_path = fx.dir.path().join(format!("{id}.bin"));
        meta.is_downloaded = true;
        meta.sync_status = SyncStatus::Synced;
        meta.last_sync_time = Some(unix_now());
        meta.local_checksum = Some("dummy".into());
        fx.local.write(&meta.file_path, &vec![0u8; size]).await.unwrap();
        fx.metadata.save(&meta).await.unwrap();
        meta
    }

    async fn still_on_disk(fx: &Fixture, path: &Path) -> bool {
        fx.local.exists(path).await
    }

    fn config_with(strategy: CacheStrategy) -> SyncConfig {
        SyncConfig {
            cache_strategy: strategy,
            ..SyncConfig::default()
        }
    }

    #[tokio::test]
    async fn cache_all_never_evicts() {
        let fx = fixture();
        let meta = add_downloaded(&fx, "f1", 128, 0).await;

        let freed = fx
            .manager
            .clear_cache(&config_with(CacheStrategy::CacheAll))
            .await
            .unwrap();

        assert_eq!(freed, 0);
        assert!(still_on_disk(&fx, &meta.file_path).await);
    }

    #[tokio::test]
    async fn no_cache_evicts_everything_and_resets_records() {
        let fx = fixture();
        let a = add_downloaded(&fx, "a", 100, 0).await;
        let b = add_downloaded(&fx, "b", 50, 0).await;

        let freed = fx
            .manager
            .clear_cache(&config_with(CacheStrategy::NoCache))
            .await
            .unwrap();

        assert_eq!(freed, 150);
        assert!(!still_on_disk(&fx, &a.file_path).await);
        assert!(!still_on_disk(&fx, &b.file_path).await);

        let reset = fx.metadata.get("a").await.unwrap().unwrap();
        assert!(!reset.is_downloaded);
        assert_eq!(reset.sync_status, SyncStatus::Pending);
        assert!(reset.local_checksum.is_none());
    }

    #[tokio::test]
    async fn no_cache_removes_extracted_trees_too() {
        let fx = fixture();
        let mut meta = add_downloaded(&fx, "zipped", 60, 0).await;
        let extracted = fx.dir.path().join("zipped");
        fx.local
            .write(&extracted.join("inner.txt"), &vec![1u8; 40])
            .await
            .unwrap();
        meta.is_extracted = true;
        meta.extracted_path = Some(extracted.clone());
        fx.metadata.save(&meta).await.unwrap();

        let freed = fx
            .manager
            .clear_cache(&config_with(CacheStrategy::NoCache))
            .await
            .unwrap();

        assert_eq!(freed, 100);
        assert!(!still_on_disk(&fx, &extracted).await);
        let reset = fx.metadata.get("zipped").await.unwrap().unwrap();
        assert!(!reset.is_extracted);
        assert!(reset.extracted_path.is_none());
    }

    #[tokio::test]
    async fn recent_policy_evicts_only_expired_files() {
        let fx = fixture();
        let old = add_downloaded(&fx, "old", 100, 0).await;
        let fresh = add_downloaded(&fx, "fresh", 100, 0).await;
        let never = add_downloaded(&fx, "never", 100, 0).await;

        let mut expired = old.clone();
        expired.last_sync_time = Some(unix_now() - 7200);
        fx.metadata.save(&expired).await.unwrap();
        let mut unsynced = never.clone();
        unsynced.last_sync_time = None;
        fx.metadata.save(&unsynced).await.unwrap();

        let mut config = config_with(CacheStrategy::CacheRecent);
        config.file_expiry_secs = Some(3600);

        let freed = fx.manager.clear_cache(&config).await.unwrap();

        assert_eq!(freed, 100);
        assert!(!still_on_disk(&fx, &old.file_path).await);
        assert!(still_on_disk(&fx, &fresh.file_path).await);
        assert!(still_on_disk(&fx, &never.file_path).await);
    }

    #[tokio::test]
    async fn recent_policy_requires_expiry_setting() {
        let fx = fixture();
        let err = fx
            .manager
            .clear_cache(&config_with(CacheStrategy::CacheRecent))
            .await
            .unwrap_err();
        assert!(matches!(err, MbxError::Config(_)));
    }

    #[tokio::test]
    async fn priority_policy_is_noop_under_budget() {
        let fx = fixture();
        add_downloaded(&fx, "f1", 100, 0).await;

        let mut config = config_with(CacheStrategy::CachePriority);
        config.max_cache_size = Some(1000);

        assert_eq!(fx.manager.clear_cache(&config).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn priority_policy_evicts_lowest_priority_until_under_budget() {
        let fx = fixture();
        let keep = add_downloaded(&fx, "keep", 100, 5).await;
        let first_out = add_downloaded(&fx, "first_out", 100, 1).await;
        let second_out = add_downloaded(&fx, "second_out", 100, 3).await;

        let mut config = config_with(CacheStrategy::CachePriority);
        config.max_cache_size = Some(150);

        let freed = fx.manager.clear_cache(&config).await.unwrap();

        // 300 total, budget 150: the two lowest priorities go.
        assert_eq!(freed, 200);
        assert!(still_on_disk(&fx, &keep.file_path).await);
        assert!(!still_on_disk(&fx, &first_out.file_path).await);
        assert!(!still_on_disk(&fx, &second_out.file_path).await);
    }

    #[tokio::test]
    async fn priority_ties_evict_in_registration_order() {
        let fx = fixture();
        let a = add_downloaded(&fx, "a", 100, 0).await;
        let b = add_downloaded(&fx, "b", 100, 0).await;
        let c = add_downloaded(&fx, "c", 100, 0).await;

        let mut config = config_with(CacheStrategy::CachePriority);
        config.max_cache_size = Some(250);

        let freed = fx.manager.clear_cache(&config).await.unwrap();

        assert_eq!(freed, 100);
        assert!(!still_on_disk(&fx, &a.file_path).await);
        assert!(still_on_disk(&fx, &b.file_path).await);
        assert!(still_on_disk(&fx, &c.file_path).await);
    }

    #[tokio::test]
    async fn priority_policy_requires_size_budget() {
        let fx = fixture();
        let err = fx
            .manager
            .clear_cache(&config_with(CacheStrategy::CachePriority))
            .await
            .unwrap_err();
        assert!(matches!(err, MbxError::Config(_)));
    }

    #[tokio::test]
    async fn undownloaded_files_are_never_candidates() {
        let fx = fixture();
        let mut meta = FileMetadata::new("pending.bin", "memory://");
        meta.file_id = "pending".into();
        fx.metadata.save(&meta).await.unwrap();

        let freed = fx
            .manager
            .clear_cache(&config_with(CacheStrategy::NoCache))
            .await
            .unwrap();
        assert_eq!(freed, 0);
        assert_eq!(
            fx.metadata.get("pending").await.unwrap().unwrap().sync_status,
            SyncStatus::Pending
        );
    }
}
