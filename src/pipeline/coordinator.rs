//! Pipeline coordinator: drives one run through its stages.
//!
//! For the current phase it admits the stage's work as batches (once per
//! run), lets a worker pool drain them, checks the failure ratio, and moves
//! the run forward. After `generate` drains it renders the document once.
//! Every decision reads durable state, so a restarted process resumes the
//! active run where the previous one stopped.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::{IngestionSource, MetadataSource};
use crate::client::RateLimitedClient;
use crate::config::PipelineConfig;
use crate::error::{ClientError, DatabaseError, PipelineError};
use crate::pipeline::queue::BatchQueue;
use crate::pipeline::recovery::RecoveryManager;
use crate::pipeline::render::DocumentRenderer;
use crate::pipeline::rules::Classifier;
use crate::pipeline::stages::{ClassifyHandler, ExtractHandler, GenerateHandler, IngestHandler};
use crate::pipeline::state::RunPhase;
use crate::pipeline::types::{EntityKind, EntityStatus, QueueItem, RunState, RunSummary, Stage};
use crate::store::traits::DurableStore;
use crate::worker::{PoolSettings, StageHandler, StageWorkerPool};

const RENDERED_EVENT: &str = "document_rendered";

/// External dependencies, each paired with its own rate-limited client.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn IngestionSource>,
    pub source_client: Arc<RateLimitedClient>,
    pub metadata: Arc<dyn MetadataSource>,
    pub metadata_client: Arc<RateLimitedClient>,
    pub classifier: Arc<dyn Classifier>,
    pub classifier_client: Arc<RateLimitedClient>,
    pub renderer: Arc<dyn DocumentRenderer>,
}

/// Sequences the stages of a run.
pub struct PipelineCoordinator {
    store: Arc<dyn DurableStore>,
    queue: BatchQueue,
    pool: StageWorkerPool,
    recovery: RecoveryManager,
    handlers: HashMap<Stage, Arc<dyn StageHandler>>,
    collaborators: Collaborators,
    config: PipelineConfig,
    cancel: CancellationToken,
}

impl PipelineCoordinator {
    pub fn new(
        store: Arc<dyn DurableStore>,
        config: PipelineConfig,
        collaborators: Collaborators,
        cancel: CancellationToken,
    ) -> Self {
        let mut handlers: HashMap<Stage, Arc<dyn StageHandler>> = HashMap::new();
        handlers.insert(Stage::Ingest, Arc::new(IngestHandler));
        handlers.insert(Stage::Extract, Arc::new(ExtractHandler));
        handlers.insert(
            Stage::Classify,
            Arc::new(ClassifyHandler::new(
                collaborators.metadata.clone(),
                collaborators.metadata_client.clone(),
                collaborators.classifier.clone(),
                collaborators.classifier_client.clone(),
            )),
        );
        handlers.insert(Stage::Generate, Arc::new(GenerateHandler));

        Self {
            queue: BatchQueue::new(store.clone()),
            pool: StageWorkerPool::new(store.clone(), PoolSettings::from(&config), cancel.clone()),
            recovery: RecoveryManager::new(store.clone(), config.max_item_attempts),
            store,
            handlers,
            collaborators,
            config,
            cancel,
        }
    }

    /// Resume the active run, or start one, and drive it to a terminal phase.
    ///
    /// Returns the run summary once the run is `Done` or `Error`. Returns
    /// `Err` when the run stopped but stays resumable: on cancellation, on a
    /// retryable source failure, or when the store itself fails.
    pub async fn run_once(&self) -> Result<RunSummary, PipelineError> {
        self.store.heartbeat().await?;
        let run = match self.store.active_run().await? {
            Some(run) => {
                info!(run_id = %run.run_id, phase = %run.phase, "Resuming run");
                run
            }
            None => {
                let run = self.store.create_run().await?;
                info!(run_id = %run.run_id, "Starting run");
                run
            }
        };
        let run_id = run.run_id;

        let heartbeat = self.cancel.child_token();
        let _stop_heartbeat = heartbeat.clone().drop_guard();
        tokio::spawn(heartbeat_loop(
            self.store.clone(),
            heartbeat_interval(self.config.orphan_lease),
            heartbeat,
        ));

        match self.drive(run).await {
            Ok(run) => {
                info!(run_id = %run_id, phase = %run.phase, "Run finished");
            }
            Err(PipelineError::Cancelled) => {
                info!(run_id = %run_id, "Run cancelled, will resume on next start");
                return Err(PipelineError::Cancelled);
            }
            Err(e) if resumable(&e) => {
                warn!(run_id = %run_id, error = %e, "Run interrupted, will resume on next start");
                return Err(e);
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Run failed");
                self.store
                    .set_run_phase(run_id, RunPhase::Error, Some(&e.to_string()))
                    .await?;
            }
        }

        Ok(self.store.run_summary(run_id).await?)
    }

    async fn drive(&self, mut run: RunState) -> Result<RunState, PipelineError> {
        while let Some(stage) = run.phase.stage() {
            self.check_cancelled()?;
            self.admit(run.run_id, stage).await?;
            self.drain(stage).await?;

            let summary = self.store.stage_summary(run.run_id, stage).await?;
            let ratio = summary.failure_ratio();
            info!(
                run_id = %run.run_id,
                stage = %stage,
                completed = summary.completed,
                failed = summary.failed,
                retried = summary.retried,
                items_succeeded = summary.items_succeeded,
                items_skipped = summary.items_skipped,
                "Stage drained"
            );

            if ratio > self.config.failure_ratio_threshold {
                let reason = format!(
                    "{stage}: {} of {} batches failed (ratio {ratio:.2} > {:.2})",
                    summary.failed,
                    summary.completed + summary.failed,
                    self.config.failure_ratio_threshold
                );
                warn!(run_id = %run.run_id, stage = %stage, %reason, "Failure ratio exceeded");
                return Ok(self
                    .store
                    .set_run_phase(run.run_id, RunPhase::Error, Some(&reason))
                    .await?);
            }

            if stage == Stage::Generate {
                self.render(run.run_id).await?;
            }
            let Some(next) = run.phase.after_drain() else {
                break;
            };
            run = self.store.set_run_phase(run.run_id, next, None).await?;
        }
        Ok(run)
    }

    /// Admit the stage's input once per run.
    async fn admit(&self, run_id: Uuid, stage: Stage) -> Result<(), PipelineError> {
        if self.store.is_stage_admitted(run_id, stage).await? {
            debug!(run_id = %run_id, stage = %stage, "Stage already admitted");
            return Ok(());
        }

        let (items, cursor) = match stage.previous() {
            None => {
                let since = self.store.ingest_cursor().await?;
                let c = &self.collaborators;
                let fetched = c
                    .source_client
                    .call(|| c.source.fetch_new(since.as_deref()))
                    .await
                    .map_err(|e| match e {
                        ClientError::Permanent { .. } => PipelineError::Ingestion(e.to_string()),
                        retryable => PipelineError::Client(retryable),
                    })?;
                info!(
                    run_id = %run_id,
                    source = c.source.name(),
                    items = fetched.items.len(),
                    "Fetched new items"
                );
                let items = fetched.items.into_iter().map(QueueItem::Work).collect();
                (items, fetched.cursor)
            }
            Some(previous) => {
                let keys = self.store.list_stage_outputs(run_id, previous).await?;
                let items = keys.into_iter().map(QueueItem::Entity).collect();
                (items, None)
            }
        };

        match self
            .queue
            .enqueue(run_id, stage, items, self.config.max_batch_size, cursor)
            .await
        {
            Ok(batches) => {
                info!(run_id = %run_id, stage = %stage, batches = batches.len(), "Stage admitted");
                Ok(())
            }
            // Another instance admitted it between our check and the insert.
            Err(DatabaseError::Conflict { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Run workers until the stage has no pending and no processing batches.
    ///
    /// Pools exit once claims come back empty, which also happens while
    /// retry batches wait out their delay or another owner still holds a
    /// batch; those cases wait and go around again.
    async fn drain(&self, stage: Stage) -> Result<(), PipelineError> {
        let handler = self
            .handlers
            .get(&stage)
            .cloned()
            .ok_or_else(|| PipelineError::Worker(format!("no handler for {stage}")))?;

        loop {
            self.check_cancelled()?;
            let report = self
                .pool
                .run(stage, handler.clone(), self.config.concurrency)
                .await?;
            self.check_cancelled()?;

            let pending = self.store.peek_depth(stage).await?;
            let processing = self.store.processing_count(stage).await?;
            if pending == 0 && processing == 0 {
                return Ok(());
            }
            debug!(stage = %stage, pending, processing, ?report, "Stage not drained yet");

            if processing > 0 {
                self.recovery.recover_stage(stage).await?;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Render the document once per run.
    async fn render(&self, run_id: Uuid) -> Result<(), PipelineError> {
        let history = self.store.run_history(run_id).await?;
        if history.iter().any(|event| event.event == RENDERED_EVENT) {
            debug!(run_id = %run_id, "Document already rendered for this run");
            return Ok(());
        }

        let entities: Vec<_> = self
            .store
            .list_classified_entities(EntityKind::Repository)
            .await?
            .into_iter()
            .filter(|e| e.entity.status == EntityStatus::Active && !e.classifications.is_empty())
            .collect();
        let bytes = self.collaborators.renderer.render(&entities)?;
        write_atomically(&self.config.output_path, &bytes)
            .await
            .map_err(|e| {
                PipelineError::Render(format!("{}: {e}", self.config.output_path.display()))
            })?;

        let detail = format!(
            "{} repositories, {} bytes to {}",
            entities.len(),
            bytes.len(),
            self.config.output_path.display()
        );
        info!(run_id = %run_id, %detail, "Document rendered");
        self.store
            .append_history(run_id, RENDERED_EVENT, Some(Stage::Generate), Some(&detail))
            .await?;
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Errors after which the run should be retried later rather than failed.
fn resumable(e: &PipelineError) -> bool {
    match e {
        PipelineError::Client(c) => c.is_retryable(),
        PipelineError::Database(DatabaseError::Pool(_) | DatabaseError::Query(_)) => true,
        _ => false,
    }
}

fn heartbeat_interval(lease: Duration) -> Duration {
    (lease / 3).max(Duration::from_secs(1))
}

async fn heartbeat_loop(
    store: Arc<dyn DurableStore>,
    every: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = store.heartbeat().await {
                    warn!(error = %e, "Heartbeat failed");
                }
            }
        }
    }
}

/// Write to a sibling temp file, then rename over the target.
async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".into());
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}
