//! Periodic batch sync on a fixed interval.
//!
//! One timer task at a time. `stop` is deterministic: it cancels the task
//! and awaits it, so no tick can fire after `stop` returns.

use crate::engine::SyncEngine;
use crate::gate;
use mbx_core::SyncConfig;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct RunningTimer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    interval_secs: u64,
}

#[derive(Default)]
pub struct AutoSync {
    inner: tokio::sync::Mutex<Option<RunningTimer>>,
}

impl AutoSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the periodic trigger from the interval in the current config.
    /// No interval configured means no-op. An already-running timer is
    /// replaced.
    pub async fn start(&self, engine: SyncEngine, config_rx: watch::Receiver<SyncConfig>) {
        let interval_secs = match config_rx.borrow().auto_sync_interval_secs {
            Some(n) if n > 0 => n,
            _ => {
                debug!("auto-sync not started: no interval configured");
                return;
            }
        };

        self.stop().await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_timer(
            engine,
            config_rx,
            cancel.clone(),
            interval_secs,
        ));
        *self.inner.lock().await = Some(RunningTimer {
            cancel,
            handle,
            interval_secs,
        });
        info!(interval_secs, "auto-sync started");
    }

    /// Cancel the trigger and wait for the timer task to finish. After this
    /// returns, no further batch run will be launched.
    pub async fn stop(&self) {
        let timer = self.inner.lock().await.take();
        if let Some(timer) = timer {
            timer.cancel.cancel();
            let _ = timer.handle.await;
            info!("auto-sync stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    pub async fn interval_secs(&self) -> Option<u64> {
        self.inner.lock().await.as_ref().map(|t| t.interval_secs)
    }

    /// React to a config change: a removed interval stops a running timer, a
    /// changed interval restarts it. A stopped timer stays stopped.
    pub async fn apply_config(&self, engine: &SyncEngine, config_rx: &watch::Receiver<SyncConfig>) {
        let new_interval = config_rx.borrow().auto_sync_interval_secs;
        let current = self.interval_secs().await;
        match (current, new_interval) {
            (Some(_), None) | (Some(_), Some(0)) => self.stop().await,
            (Some(old), Some(new)) if old != new => {
                self.start(engine.clone(), config_rx.clone()).await;
            }
            _ => {}
        }
    }
}

async fn run_timer(
    engine: SyncEngine,
    config_rx: watch::Receiver<SyncConfig>,
    cancel: CancellationToken,
    interval_secs: u64,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick is immediate; the first sync should wait a full period.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let config = config_rx.borrow().clone();
                if !gate::allows(config.network_type, engine.monitor().current()) {
                    debug!("auto-sync tick skipped, network unsuitable");
                    continue;
                }
                match engine.sync_all(&config, &cancel, None).await {
                    Ok(result) => info!(
                        success = result.success_count,
                        failed = result.failed_count,
                        conflicts = result.conflict_count,
                        "auto-sync pass complete"
                    ),
                    Err(e) => warn!(error = %e, "auto-sync pass failed"),
                }
            }
        }
    }
    debug!("auto-sync timer exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{NetworkState, StaticNetworkMonitor};
    use mbx_core::{FileMetadata, SyncStatus};
    use mbx_store::{
        FsLocalStore, MemoryMetadataStore, MetadataStore, NoopExtractor, OpendalRemoteStore,
        RemoteStore,
    };
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        engine: SyncEngine,
        metadata: Arc<MemoryMetadataStore>,
        remote: Arc<OpendalRemoteStore>,
        dir: TempDir,
    }

    fn fixture() -> Fixture {
        let metadata = Arc::new(MemoryMetadataStore::new());
        let local = Arc::new(FsLocalStore::new());
        let op = opendal::Operator::new(opendal::services::Memory::default())
            .expect("memory operator")
            .finish();
        let remote = Arc::new(OpendalRemoteStore::new(op));
        let monitor = Arc::new(StaticNetworkMonitor::new(NetworkState::wifi()));
        let engine = SyncEngine::new(
            metadata.clone(),
            local,
            remote.clone(),
            Arc::new(NoopExtractor),
            monitor,
        );
        Fixture {
            engine,
            metadata,
            remote,
            dir: TempDir::new().unwrap(),
        }
    }

    fn config_rx(config: SyncConfig) -> (watch::Sender<SyncConfig>, watch::Receiver<SyncConfig>) {
        watch::channel(config)
    }

    #[tokio::test]
    async fn start_without_interval_is_a_noop() {
        let fx = fixture();
        let auto = AutoSync::new();
        let (_tx, rx) = config_rx(SyncConfig::default());

        auto.start(fx.engine.clone(), rx).await;

        assert!(!auto.is_running().await);
    }

    #[tokio::test]
    async fn stop_is_deterministic() {
        let fx = fixture();
        let auto = AutoSync::new();
        let mut config = SyncConfig::default();
        config.auto_sync_interval_secs = Some(3600);
        let (_tx, rx) = config_rx(config);

        auto.start(fx.engine.clone(), rx).await;
        assert!(auto.is_running().await);
        assert_eq!(auto.interval_secs().await, Some(3600));

        auto.stop().await;
        assert!(!auto.is_running().await);
        // Stopping twice is fine.
        auto.stop().await;
    }

    #[tokio::test]
    async fn config_change_restarts_with_new_interval() {
        let fx = fixture();
        let auto = AutoSync::new();
        let mut config = SyncConfig::default();
        config.auto_sync_interval_secs = Some(3600);
        let (tx, rx) = config_rx(config.clone());

        auto.start(fx.engine.clone(), rx.clone()).await;
        assert_eq!(auto.interval_secs().await, Some(3600));

        config.auto_sync_interval_secs = Some(1800);
        tx.send_replace(config.clone());
        auto.apply_config(&fx.engine, &rx).await;
        assert_eq!(auto.interval_secs().await, Some(1800));

        config.auto_sync_interval_secs = None;
        tx.send_replace(config);
        auto.apply_config(&fx.engine, &rx).await;
        assert!(!auto.is_running().await);
    }

    #[tokio::test]
    async fn config_change_does_not_start_a_stopped_timer() {
        let fx = fixture();
        let auto = AutoSync::new();
        let mut config = SyncConfig::default();
        config.auto_sync_interval_secs = Some(60);
        let (_tx, rx) = config_rx(config);

        auto.apply_config(&fx.engine, &rx).await;

        assert!(!auto.is_running().await);
    }

    #[tokio::test]
    async fn tick_syncs_pending_files() {
        let fx = fixture();

        // Seed one remote file and register it as pending.
        let seed = fx.dir.path().join("seed.bin");
        tokio::fs::write(&seed, b"auto-sync me").await.unwrap();
        fx.remote.upload("f1", &seed, None).await.unwrap();
        let mut meta = FileMetadata::new("seed.bin", "memory://");
        meta.file_id = "f1".into();
        fx.metadata.save(&meta).await.unwrap();

        let mut config = SyncConfig::default();
        config.auto_sync_interval_secs = Some(1);
        config.sync_dir = fx.dir.path().join("files");
        let (_tx, rx) = config_rx(config);

        let auto = AutoSync::new();
        auto.start(fx.engine.clone(), rx).await;

        // First tick lands after one full interval.
        tokio::time::sleep(Duration::from_millis(1600)).await;
        auto.stop().await;

        let synced = fx.metadata.get("f1").await.unwrap().unwrap();
        assert_eq!(synced.sync_status, SyncStatus::Synced);
        assert!(synced.is_downloaded);
    }
}
