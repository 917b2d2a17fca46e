//! Stage worker pool: claim → process → commit loops for one stage.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{DatabaseError, PipelineError};
use crate::pipeline::types::{Batch, BatchOutcome, BatchStatus, ItemOutcome, Stage};
use crate::store::traits::DurableStore;
use crate::worker::stage::StageHandler;

/// Loop tuning shared by every worker of a pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Items of one batch processed concurrently.
    pub item_concurrency: usize,
    /// Consecutive empty claims after which a worker exits.
    pub empty_polls: u32,
    /// Sleep between empty claims.
    pub poll_interval: Duration,
}

impl From<&PipelineConfig> for PoolSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            item_concurrency: config.item_concurrency,
            empty_polls: config.empty_polls,
            poll_interval: config.poll_interval,
        }
    }
}

/// What the workers of one `run` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub claimed: u32,
    pub completed: u32,
    pub failed: u32,
    pub requeued: u32,
    /// Commits refused because the batch was no longer ours.
    pub conflicts: u32,
}

impl PoolReport {
    fn absorb(&mut self, other: PoolReport) {
        self.claimed += other.claimed;
        self.completed += other.completed;
        self.failed += other.failed;
        self.requeued += other.requeued;
        self.conflicts += other.conflicts;
    }
}

/// Runs stage handlers against claimed batches.
#[derive(Clone)]
pub struct StageWorkerPool {
    store: Arc<dyn DurableStore>,
    settings: PoolSettings,
    cancel: CancellationToken,
}

impl StageWorkerPool {
    pub fn new(
        store: Arc<dyn DurableStore>,
        settings: PoolSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            settings,
            cancel,
        }
    }

    /// Spawn `concurrency` workers for `stage` and wait for all of them.
    ///
    /// Workers exit once the stage looks quiescent (`empty_polls` empty
    /// claims in a row) or the cancellation token fires. Cancellation is
    /// only observed between batches, so every claimed batch is committed.
    pub async fn run(
        &self,
        stage: Stage,
        handler: Arc<dyn StageHandler>,
        concurrency: usize,
    ) -> Result<PoolReport, PipelineError> {
        if handler.stage() != stage {
            return Err(PipelineError::Worker(format!(
                "handler for {} cannot serve {stage}",
                handler.stage()
            )));
        }

        let mut workers = JoinSet::new();
        for worker_id in 0..concurrency.max(1) {
            let store = self.store.clone();
            let handler = handler.clone();
            let settings = self.settings.clone();
            let cancel = self.cancel.clone();
            workers.spawn(async move {
                worker_loop(worker_id, stage, store, handler, settings, cancel).await
            });
        }

        let mut report = PoolReport::default();
        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(worker_report)) => report.absorb(worker_report),
                Ok(Err(e)) => {
                    warn!(stage = %stage, error = %e, "Worker stopped on store error");
                    first_error.get_or_insert(PipelineError::Database(e));
                }
                Err(e) => {
                    warn!(stage = %stage, error = %e, "Worker task panicked");
                    first_error.get_or_insert(PipelineError::Worker(e.to_string()));
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        debug!(stage = %stage, ?report, "Workers quiescent");
        Ok(report)
    }
}

async fn worker_loop(
    worker_id: usize,
    stage: Stage,
    store: Arc<dyn DurableStore>,
    handler: Arc<dyn StageHandler>,
    settings: PoolSettings,
    cancel: CancellationToken,
) -> Result<PoolReport, DatabaseError> {
    let mut report = PoolReport::default();
    let mut empty = 0u32;

    loop {
        if cancel.is_cancelled() {
            debug!(worker_id, stage = %stage, "Worker cancelled");
            break;
        }

        let Some(batch) = store.claim_next_batch(stage).await? else {
            empty += 1;
            if empty >= settings.empty_polls {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(settings.poll_interval) => {}
            }
            continue;
        };

        empty = 0;
        report.claimed += 1;
        execute_batch(worker_id, &batch, store.as_ref(), handler.as_ref(), &settings, &mut report)
            .await?;
    }

    Ok(report)
}

async fn execute_batch(
    worker_id: usize,
    batch: &Batch,
    store: &dyn DurableStore,
    handler: &dyn StageHandler,
    settings: &PoolSettings,
    report: &mut PoolReport,
) -> Result<(), DatabaseError> {
    let items = store.load_items(batch).await?;
    let outcomes: Vec<ItemOutcome> = stream::iter(items)
        .map(|item| async move { handler.process_item(&item).await })
        .buffered(settings.item_concurrency.max(1))
        .collect()
        .await;

    match store
        .commit_batch_result(batch.batch_id, BatchOutcome::new(outcomes))
        .await
    {
        Ok(commit) => {
            match commit.status {
                BatchStatus::Completed => report.completed += 1,
                _ => report.failed += 1,
            }
            if commit.requeued.is_some() {
                report.requeued += 1;
            }
            info!(
                worker_id,
                batch_id = %batch.batch_id,
                stage = %batch.stage,
                attempt = batch.attempt,
                status = %commit.status,
                succeeded = commit.succeeded,
                skipped = commit.skipped.len(),
                requeued = commit.requeued.is_some(),
                "Batch settled"
            );
            Ok(())
        }
        Err(e @ DatabaseError::Conflict { .. }) => {
            warn!(worker_id, batch_id = %batch.batch_id, error = %e, "Commit conflict");
            report.conflicts += 1;
            store.fail_batch(batch.batch_id, &e.to_string()).await
        }
        Err(e) => {
            if let Err(fail_err) = store.fail_batch(batch.batch_id, &e.to_string()).await {
                warn!(
                    worker_id,
                    batch_id = %batch.batch_id,
                    error = %fail_err,
                    "Failed to mark batch failed"
                );
            }
            Err(e)
        }
    }
}
