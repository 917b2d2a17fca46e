//! `DurableStore` trait: single async interface for all pipeline persistence.
//!
//! The store owns every row. Callers get copies (`Batch`, `StageItem`,
//! `Entity`) and hand back outcomes the store applies transactionally.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::state::RunPhase;
use crate::pipeline::types::{
    Batch, BatchCommit, BatchOutcome, Classification, ClassifiedEntity, Entity, EntityKind,
    NewBatches, QueueItem, RunState, RunSummary, Stage, StageItem, StageSummary,
};

/// One row of the append-only run history.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEvent {
    pub run_id: Uuid,
    pub event: String,
    pub stage: Option<Stage>,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Backend-agnostic persistence for runs, batches, entities and classifications.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Identity of this store instance; stamped on every batch it claims.
    fn owner_id(&self) -> Uuid;

    /// Refresh this instance's liveness record.
    async fn heartbeat(&self) -> Result<(), DatabaseError>;

    /// Drop this instance's liveness record; its `processing` batches become orphans.
    async fn release(&self) -> Result<(), DatabaseError>;

    // ── Runs ────────────────────────────────────────────────────────

    /// Create a new run in the initial phase.
    async fn create_run(&self) -> Result<RunState, DatabaseError>;

    /// The most recent run that has not finished, if any.
    async fn active_run(&self) -> Result<Option<RunState>, DatabaseError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunState>, DatabaseError>;

    /// Move a run to `phase`. Terminal phases stamp `finished_at`.
    ///
    /// Fails with `Validation` if the transition is not allowed.
    async fn set_run_phase(
        &self,
        run_id: Uuid,
        phase: RunPhase,
        last_error: Option<&str>,
    ) -> Result<RunState, DatabaseError>;

    /// Append an event to the run history. History rows are never updated.
    async fn append_history(
        &self,
        run_id: Uuid,
        event: &str,
        stage: Option<Stage>,
        detail: Option<&str>,
    ) -> Result<(), DatabaseError>;

    async fn run_history(&self, run_id: Uuid) -> Result<Vec<HistoryEvent>, DatabaseError>;

    async fn stage_summary(&self, run_id: Uuid, stage: Stage)
    -> Result<StageSummary, DatabaseError>;

    /// Summary of a run, available from any phase.
    async fn run_summary(&self, run_id: Uuid) -> Result<RunSummary, DatabaseError>;

    // ── Batches ─────────────────────────────────────────────────────

    /// Create one pending batch. Returns `None` when every item was merged
    /// into an existing work item (ingest) or `items` is empty.
    async fn create_batch(
        &self,
        run_id: Uuid,
        stage: Stage,
        items: Vec<QueueItem>,
    ) -> Result<Option<Batch>, DatabaseError>;

    /// Admit a stage: create every chunk as a batch, record the admission
    /// marker and the source cursor, all in one transaction.
    async fn create_batches(&self, new: NewBatches) -> Result<Vec<Batch>, DatabaseError>;

    /// Whether `create_batches` already ran for this run and stage.
    async fn is_stage_admitted(&self, run_id: Uuid, stage: Stage) -> Result<bool, DatabaseError>;

    /// Cursor persisted by the last ingest admission.
    async fn ingest_cursor(&self) -> Result<Option<String>, DatabaseError>;

    /// Atomically move the oldest claimable pending batch to `processing`.
    async fn claim_next_batch(&self, stage: Stage) -> Result<Option<Batch>, DatabaseError>;

    /// Copies of the batch's items, in batch order.
    async fn load_items(&self, batch: &Batch) -> Result<Vec<StageItem>, DatabaseError>;

    /// Apply a batch's writes and mark it terminal in one transaction.
    ///
    /// Returns `Conflict` if the batch is no longer `processing` under this
    /// owner. Returns the failed commit (no writes) if any write is invalid.
    async fn commit_batch_result(
        &self,
        batch_id: Uuid,
        outcome: BatchOutcome,
    ) -> Result<BatchCommit, DatabaseError>;

    /// Mark a `processing` batch failed without retry. No-op otherwise.
    async fn fail_batch(&self, batch_id: Uuid, reason: &str) -> Result<(), DatabaseError>;

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<Batch>, DatabaseError>;

    async fn list_batches(&self, run_id: Uuid, stage: Stage) -> Result<Vec<Batch>, DatabaseError>;

    /// Pending batches for a stage.
    async fn peek_depth(&self, stage: Stage) -> Result<u32, DatabaseError>;

    /// Batches of a stage currently claimed by some owner.
    async fn processing_count(&self, stage: Stage) -> Result<u32, DatabaseError>;

    /// `processing` batches whose owner is not this instance and is no longer alive.
    async fn reconcile_orphans(&self, stage: Stage) -> Result<Vec<Batch>, DatabaseError>;

    /// Mark an orphan failed and, while under `max_attempts`, replace it
    /// with a pending batch holding the same items.
    async fn requeue_orphan(
        &self,
        orphan: &Batch,
        max_attempts: u32,
    ) -> Result<Option<Batch>, DatabaseError>;

    // ── Entities ────────────────────────────────────────────────────

    /// Entity keys a stage produced within a run.
    async fn list_stage_outputs(
        &self,
        run_id: Uuid,
        stage: Stage,
    ) -> Result<Vec<String>, DatabaseError>;

    async fn get_entity(&self, key: &str) -> Result<Option<Entity>, DatabaseError>;

    async fn count_entities(&self, kind: EntityKind) -> Result<u32, DatabaseError>;

    /// Entities of `kind` with their current classifications.
    async fn list_classified_entities(
        &self,
        kind: EntityKind,
    ) -> Result<Vec<ClassifiedEntity>, DatabaseError>;

    /// All classifications of an entity, superseded ones included, oldest first.
    async fn classification_history(&self, key: &str)
    -> Result<Vec<Classification>, DatabaseError>;

    // ── Maintenance ─────────────────────────────────────────────────

    /// Clear runs, batches and stage bookkeeping. Entities survive.
    async fn reset_pipeline_state(&self) -> Result<(), DatabaseError>;
}
