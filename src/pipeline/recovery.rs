//! Startup recovery: requeue batches left `processing` by a dead owner.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::DatabaseError;
use crate::pipeline::types::Stage;
use crate::store::traits::DurableStore;

/// What a recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Orphans replaced by a fresh pending batch.
    pub requeued: u32,
    /// Orphans that had used up their attempts.
    pub abandoned: u32,
}

/// Finds orphaned batches and puts their items back in the queue.
pub struct RecoveryManager {
    store: Arc<dyn DurableStore>,
    max_attempts: u32,
}

impl RecoveryManager {
    pub fn new(store: Arc<dyn DurableStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts,
        }
    }

    /// Reconcile every stage. Must finish before the coordinator admits work.
    pub async fn recover(&self) -> Result<RecoveryReport, DatabaseError> {
        let mut report = RecoveryReport::default();
        for stage in Stage::ALL {
            let stage_report = self.recover_stage(stage).await?;
            report.requeued += stage_report.requeued;
            report.abandoned += stage_report.abandoned;
        }
        if report != RecoveryReport::default() {
            info!(
                requeued = report.requeued,
                abandoned = report.abandoned,
                "Recovery complete"
            );
        }
        Ok(report)
    }

    /// Reconcile one stage.
    pub async fn recover_stage(&self, stage: Stage) -> Result<RecoveryReport, DatabaseError> {
        let mut report = RecoveryReport::default();
        for orphan in self.store.reconcile_orphans(stage).await? {
            match self.store.requeue_orphan(&orphan, self.max_attempts).await {
                Ok(Some(replacement)) => {
                    info!(
                        stage = %stage,
                        orphan = %orphan.batch_id,
                        batch_id = %replacement.batch_id,
                        attempt = replacement.attempt,
                        "Requeued orphaned batch"
                    );
                    report.requeued += 1;
                }
                Ok(None) => {
                    warn!(
                        stage = %stage,
                        batch_id = %orphan.batch_id,
                        attempt = orphan.attempt,
                        "Orphaned batch out of attempts"
                    );
                    report.abandoned += 1;
                }
                // Another instance settled it first.
                Err(DatabaseError::Conflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::pipeline::types::{BatchStatus, QueueItem, WorkItem};
    use crate::store::{LibSqlBackend, StoreOptions};

    #[tokio::test]
    async fn requeues_batches_of_a_dead_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("curator.db");
        let options = StoreOptions {
            orphan_lease: Duration::ZERO,
            ..StoreOptions::default()
        };

        let (run_id, orphan_id) = {
            let crashed = LibSqlBackend::new_local(&path).await.unwrap();
            let run = crashed.create_run().await.unwrap();
            crashed
                .create_batch(
                    run.run_id,
                    Stage::Ingest,
                    vec![QueueItem::Work(WorkItem::new("m1", "test", json!({}), Utc::now()))],
                )
                .await
                .unwrap();
            let claimed = crashed.claim_next_batch(Stage::Ingest).await.unwrap().unwrap();
            crashed.release().await.unwrap();
            (run.run_id, claimed.batch_id)
        };

        let store: Arc<dyn DurableStore> = Arc::new(
            LibSqlBackend::new_local(&path)
                .await
                .unwrap()
                .with_options(options),
        );
        let report = RecoveryManager::new(store.clone(), 5).recover().await.unwrap();
        assert_eq!(report, RecoveryReport { requeued: 1, abandoned: 0 });

        let orphan = store.get_batch(orphan_id).await.unwrap().unwrap();
        assert_eq!(orphan.status, BatchStatus::Failed);
        assert!(orphan.requeued_as.is_some());
        assert_eq!(store.peek_depth(Stage::Ingest).await.unwrap(), 1);
        assert_eq!(store.list_batches(run_id, Stage::Ingest).await.unwrap().len(), 2);

        // A second pass finds nothing left to do.
        let again = RecoveryManager::new(store, 5).recover().await.unwrap();
        assert_eq!(again, RecoveryReport::default());
    }
}
