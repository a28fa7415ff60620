//! Batch reconciliation: every pending file, bounded concurrency, isolated
//! failures, cumulative snapshots.

use crate::engine::{SyncEngine, SyncOutcome};
use crate::gate;
use mbx_core::{BatchSyncResult, MbxResult, SyncConfig};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl SyncEngine {
    /// Reconcile every file whose status is not `Synced`.
    ///
    /// At most `config.max_concurrent_transfers` files are in flight at once.
    /// One file failing is recorded and counted, never fatal to the batch.
    /// Each completed file pushes a cumulative [`BatchSyncResult`] snapshot
    /// into `updates` (the snapshots are non-decreasing in every counter);
    /// the final snapshot is also the return value.
    ///
    /// Cancelling stops new launches immediately and aborts in-flight files;
    /// aborted files are not counted in the result.
    pub async fn sync_all(
        &self,
        config: &SyncConfig,
        cancel: &CancellationToken,
        updates: Option<&mpsc::UnboundedSender<BatchSyncResult>>,
    ) -> MbxResult<BatchSyncResult> {
        let tx = updates.cloned();

        if !gate::allows(config.network_type, self.monitor().current()) {
            info!(required = ?config.network_type, "batch sync skipped, network unsuitable");
            let result = BatchSyncResult::default();
            if let Some(tx) = &tx {
                let _ = tx.send(result.clone());
            }
            return Ok(result);
        }

        let pending = self.metadata_store().get_unsynced().await?;
        if pending.is_empty() {
            debug!("batch sync: nothing pending");
            let result = BatchSyncResult::default();
            if let Some(tx) = &tx {
                let _ = tx.send(result.clone());
            }
            return Ok(result);
        }

        info!(
            files = pending.len(),
            cap = config.max_concurrent_transfers,
            "batch sync starting"
        );

        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_transfers));
        let aggregate = Arc::new(Mutex::new(BatchSyncResult::default()));
        let mut handles = Vec::with_capacity(pending.len());

        for meta in pending {
            // Acquire before spawning so cancellation can stop the launch
            // loop while transfers are still draining.
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => {
                    permit.expect("semaphore closed")
                }
            };

            let engine = self.clone();
            let config = config.clone();
            let cancel = cancel.clone();
            let aggregate = Arc::clone(&aggregate);
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let file_id = meta.file_id.clone();

                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    outcome = engine.sync_file(&file_id, &config, None) => outcome,
                };

                if let Err(e) = &outcome {
                    warn!(file_id, error = %e, "file failed during batch sync");
                }

                // Record and snapshot under the same lock so observers see
                // the snapshots in recording order.
                let snapshot = {
                    let mut agg = aggregate.lock().expect("batch aggregate lock poisoned");
                    match outcome {
                        Ok(SyncOutcome::Synced(_)) => agg.record_success(),
                        Ok(SyncOutcome::Conflict { .. }) => agg.record_conflict(),
                        Err(e) => agg.record_failure(&file_id, e.to_string()),
                    }
                    let snapshot = agg.clone();
                    if let Some(tx) = &tx {
                        let _ = tx.send(snapshot.clone());
                    }
                    snapshot
                };
                debug!(
                    file_id,
                    processed = snapshot.total_processed,
                    "batch progress"
                );
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        let result = aggregate
            .lock()
            .expect("batch aggregate lock poisoned")
            .clone();
        if let Some(tx) = &tx {
            let _ = tx.send(result.clone());
        }
        info!(
            success = result.success_count,
            failed = result.failed_count,
            conflicts = result.conflict_count,
            processed = result.total_processed,
            "batch sync finished"
        );
        Ok(result)
    }
}
