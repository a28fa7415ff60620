//! Integration tests for the batch orchestrator: failure isolation, the
//! concurrency cap, snapshot monotonicity, gating, and cancellation.

use mbx_core::{BatchSyncResult, FileMetadata, MbxError, MbxResult, SyncConfig, SyncStatus};
use mbx_store::{
    FsLocalStore, LocalStore, MemoryMetadataStore, MetadataStore, NoopExtractor,
    OpendalRemoteStore, RemoteFileInfo, RemoteStore,
};
use mbx_sync::engine::SyncEngine;
use mbx_sync::gate::{NetworkState, StaticNetworkMonitor};
use opendal::Operator;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn memory_operator() -> Operator {
    Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish()
}

struct Fixture {
    metadata: Arc<MemoryMetadataStore>,
    local: Arc<FsLocalStore>,
    remote: Arc<OpendalRemoteStore>,
    monitor: Arc<StaticNetworkMonitor>,
    config: SyncConfig,
    dir: TempDir,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let config = SyncConfig {
        sync_dir: dir.path().join("files"),
        retry_count: 1,
        retry_delay_ms: 1,
        ..SyncConfig::default()
    };
    Fixture {
        metadata: Arc::new(MemoryMetadataStore::new()),
        local: Arc::new(FsLocalStore::new()),
        remote: Arc::new(OpendalRemoteStore::new(memory_operator())),
        monitor: Arc::new(StaticNetworkMonitor::new(NetworkState::wifi())),
        config,
        dir,
    }
}

impl Fixture {
    fn engine_over(&self, remote: Arc<dyn RemoteStore>) -> SyncEngine {
        SyncEngine::new(
            self.metadata.clone(),
            self.local.clone(),
            remote,
            Arc::new(NoopExtractor),
            self.monitor.clone(),
        )
    }

    fn engine(&self) -> SyncEngine {
        self.engine_over(self.remote.clone())
    }

    /// Register `count` pending files, each with content seeded remotely.
    async fn seed_batch(&self, count: usize) -> Vec<String> {
        let mut ids = Vec::new();
        for i in 1..=count {
            let id = format!("f{i}");
            let scratch = self.dir.path().join("seed").join(&id);
            tokio::fs::create_dir_all(scratch.parent().unwrap())
                .await
                .unwrap();
            tokio::fs::write(&scratch, format!("content of {id}"))
                .await
                .unwrap();
            self.remote.upload(&id, &scratch, None).await.unwrap();

            let mut meta = FileMetadata::new(format!("{id}.txt"), "memory://");
            meta.file_id = id.clone();
            self.metadata.save(&meta).await.unwrap();
            ids.push(id);
        }
        ids
    }
}

/// Forwards to the wrapped remote, failing downloads for chosen ids.
struct SelectiveFailRemote {
    inner: Arc<OpendalRemoteStore>,
    fail_ids: HashSet<String>,
}

#[async_trait::async_trait]
impl RemoteStore for SelectiveFailRemote {
    async fn metadata(&self, file_id: &str) -> MbxResult<Option<RemoteFileInfo>> {
        self.inner.metadata(file_id).await
    }

    async fn download(
        &self,
        file_id: &str,
        dest: &Path,
        progress: Option<&(dyn Fn(u64, u64) + Send + Sync)>,
    ) -> MbxResult<u64> {
        if self.fail_ids.contains(file_id) {
            return Err(MbxError::Transfer(format!("injected failure for {file_id}")));
        }
        self.inner.download(file_id, dest, progress).await
    }

    async fn upload(
        &self,
        file_id: &str,
        src: &Path,
        progress: Option<&(dyn Fn(u64, u64) + Send + Sync)>,
    ) -> MbxResult<u64> {
        self.inner.upload(file_id, src, progress).await
    }

    async fn checksum(&self, file_id: &str) -> MbxResult<Option<String>> {
        self.inner.checksum(file_id).await
    }

    async fn delete(&self, file_id: &str) -> MbxResult<()> {
        self.inner.delete(file_id).await
    }
}

/// Tracks the peak number of concurrent downloads.
struct GaugeRemote {
    inner: Arc<OpendalRemoteStore>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait::async_trait]
impl RemoteStore for GaugeRemote {
    async fn metadata(&self, file_id: &str) -> MbxResult<Option<RemoteFileInfo>> {
        self.inner.metadata(file_id).await
    }

    async fn download(
        &self,
        file_id: &str,
        dest: &Path,
        progress: Option<&(dyn Fn(u64, u64) + Send + Sync)>,
    ) -> MbxResult<u64> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = self.inner.download(file_id, dest, progress).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn upload(
        &self,
        file_id: &str,
        src: &Path,
        progress: Option<&(dyn Fn(u64, u64) + Send + Sync)>,
    ) -> MbxResult<u64> {
        self.inner.upload(file_id, src, progress).await
    }

    async fn checksum(&self, file_id: &str) -> MbxResult<Option<String>> {
        self.inner.checksum(file_id).await
    }

    async fn delete(&self, file_id: &str) -> MbxResult<()> {
        self.inner.delete(file_id).await
    }
}

/// Forwards metadata but parks downloads for chosen ids until cancelled.
struct StallingRemote {
    inner: Arc<OpendalRemoteStore>,
    stall_ids: HashSet<String>,
}

#[async_trait::async_trait]
impl RemoteStore for StallingRemote {
    async fn metadata(&self, file_id: &str) -> MbxResult<Option<RemoteFileInfo>> {
        self.inner.metadata(file_id).await
    }

    async fn download(
        &self,
        file_id: &str,
        dest: &Path,
        progress: Option<&(dyn Fn(u64, u64) + Send + Sync)>,
    ) -> MbxResult<u64> {
        if self.stall_ids.contains(file_id) {
            futures::future::pending::<()>().await;
        }
        self.inner.download(file_id, dest, progress).await
    }

    async fn upload(
        &self,
        file_id: &str,
        src: &Path,
        progress: Option<&(dyn Fn(u64, u64) + Send + Sync)>,
    ) -> MbxResult<u64> {
        self.inner.upload(file_id, src, progress).await
    }

    async fn checksum(&self, file_id: &str) -> MbxResult<Option<String>> {
        self.inner.checksum(file_id).await
    }

    async fn delete(&self, file_id: &str) -> MbxResult<()> {
        self.inner.delete(file_id).await
    }
}

// ── Failure isolation ─────────────────────────────────────────────────────

#[tokio::test]
async fn one_failing_file_does_not_stop_the_batch() {
    let fx = fixture();
    fx.seed_batch(10).await;

    let remote = Arc::new(SelectiveFailRemote {
        inner: fx.remote.clone(),
        fail_ids: HashSet::from(["f5".to_string()]),
    });
    let engine = fx.engine_over(remote);

    let result = engine
        .sync_all(&fx.config, &CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(result.total_processed, 10);
    assert_eq!(result.success_count, 9);
    assert_eq!(result.failed_count, 1);
    assert_eq!(result.conflict_count, 0);
    assert!(result.is_consistent());
    assert_eq!(result.failed_files.len(), 1);
    assert_eq!(result.failed_files[0].0, "f5");
    assert!(result.failed_files[0].1.contains("injected failure"));

    // The failure is recorded on the file itself; the rest are synced.
    assert_eq!(
        fx.metadata.get("f5").await.unwrap().unwrap().sync_status,
        SyncStatus::Failed
    );
    assert_eq!(
        fx.metadata.get("f1").await.unwrap().unwrap().sync_status,
        SyncStatus::Synced
    );
}

#[tokio::test]
async fn conflicts_are_counted_separately() {
    let fx = fixture();
    fx.seed_batch(3).await;

    // Give f2 a divergent local copy so bidirectional sync conflicts.
    let local_path = fx.dir.path().join("divergent.txt");
    fx.local.write(&local_path, b"divergent").await.unwrap();
    let mut meta = fx.metadata.get("f2").await.unwrap().unwrap();
    meta.file_path = local_path;
    meta.is_downloaded = true;
    fx.metadata.save(&meta).await.unwrap();

    let result = fx
        .engine()
        .sync_all(&fx.config, &CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(result.total_processed, 3);
    assert_eq!(result.success_count, 2);
    assert_eq!(result.conflict_count, 1);
    assert!(result.is_consistent());
    assert_eq!(
        fx.metadata.get("f2").await.unwrap().unwrap().sync_status,
        SyncStatus::Conflict
    );
}

// ── Concurrency cap ───────────────────────────────────────────────────────

#[tokio::test]
async fn transfers_never_exceed_the_configured_cap() {
    let fx = fixture();
    fx.seed_batch(10).await;

    let remote = Arc::new(GaugeRemote {
        inner: fx.remote.clone(),
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let engine = fx.engine_over(remote.clone());

    let config = SyncConfig {
        max_concurrent_transfers: 3,
        ..fx.config.clone()
    };
    let result = engine
        .sync_all(&config, &CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(result.success_count, 10);
    assert!(remote.peak.load(Ordering::SeqCst) <= 3);
    // More than one file actually ran at a time.
    assert!(remote.peak.load(Ordering::SeqCst) >= 2);
}

// ── Snapshot stream ───────────────────────────────────────────────────────

#[tokio::test]
async fn snapshots_grow_monotonically_to_the_final_result() {
    let fx = fixture();
    fx.seed_batch(6).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let result = fx
        .engine()
        .sync_all(&fx.config, &CancellationToken::new(), Some(&tx))
        .await
        .unwrap();
    drop(tx);

    let mut snapshots = Vec::new();
    while let Some(snapshot) = rx.recv().await {
        snapshots.push(snapshot);
    }

    assert!(!snapshots.is_empty());
    for pair in snapshots.windows(2) {
        assert!(pair[1].total_processed >= pair[0].total_processed);
    }
    for snapshot in &snapshots {
        assert!(snapshot.is_consistent());
    }
    assert_eq!(snapshots.last().unwrap(), &result);
    assert_eq!(result.total_processed, 6);
}

// ── Gating and trivial batches ────────────────────────────────────────────

#[tokio::test]
async fn unsuitable_network_yields_an_empty_result() {
    let fx = fixture();
    fx.seed_batch(4).await;
    fx.monitor.set(NetworkState::offline());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let result = fx
        .engine()
        .sync_all(&fx.config, &CancellationToken::new(), Some(&tx))
        .await
        .unwrap();
    drop(tx);

    assert_eq!(result, BatchSyncResult::default());
    // Nothing was touched.
    assert_eq!(
        fx.metadata.get("f1").await.unwrap().unwrap().sync_status,
        SyncStatus::Pending
    );
    // Observers still get a terminal snapshot.
    assert_eq!(rx.recv().await, Some(BatchSyncResult::default()));
}

#[tokio::test]
async fn empty_registry_completes_immediately() {
    let fx = fixture();
    let result = fx
        .engine()
        .sync_all(&fx.config, &CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(result, BatchSyncResult::default());
}

#[tokio::test]
async fn synced_files_are_not_reprocessed() {
    let fx = fixture();
    fx.seed_batch(3).await;

    let engine = fx.engine();
    let first = engine
        .sync_all(&fx.config, &CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(first.success_count, 3);

    // Everything is synced now, so a second run has nothing to do.
    let second = engine
        .sync_all(&fx.config, &CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(second, BatchSyncResult::default());
}

// ── Cancellation ──────────────────────────────────────────────────────────

#[tokio::test]
async fn cancellation_stops_the_run_with_a_partial_result() {
    let fx = fixture();
    fx.seed_batch(8).await;

    // f1 and f2 complete instantly; everything else parks until cancelled.
    let stall_ids: HashSet<String> = (3..=8).map(|i| format!("f{i}")).collect();
    let remote = Arc::new(StallingRemote {
        inner: fx.remote.clone(),
        stall_ids,
    });
    let engine = fx.engine_over(remote);

    let config = SyncConfig {
        max_concurrent_transfers: 2,
        ..fx.config.clone()
    };
    let cancel = CancellationToken::new();
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.sync_all(&config, &cancel, None).await })
    };

    // Let the fast files finish, then pull the plug on the stalled ones.
    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("batch run should stop after cancellation")
        .unwrap()
        .unwrap();

    assert!(result.total_processed < 8);
    assert!(result.is_consistent());
    assert_eq!(result.failed_count, 0);
}
