//! Shared types for the batch pipeline.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ClientError;
use crate::pipeline::state::RunPhase;

// ── Stages ──────────────────────────────────────────────────────────

/// One phase of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    Extract,
    Classify,
    Generate,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 4] = [Stage::Ingest, Stage::Extract, Stage::Classify, Stage::Generate];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Extract => "extract",
            Self::Classify => "classify",
            Self::Generate => "generate",
        }
    }

    /// The stage that consumes this stage's output, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Ingest => Some(Self::Extract),
            Self::Extract => Some(Self::Classify),
            Self::Classify => Some(Self::Generate),
            Self::Generate => None,
        }
    }

    /// The stage whose output feeds this one.
    pub fn previous(&self) -> Option<Stage> {
        match self {
            Self::Ingest => None,
            Self::Extract => Some(Self::Ingest),
            Self::Classify => Some(Self::Extract),
            Self::Generate => Some(Self::Classify),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingest" => Ok(Self::Ingest),
            "extract" => Ok(Self::Extract),
            "classify" => Ok(Self::Classify),
            "generate" => Ok(Self::Generate),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

// ── Work items & entities ───────────────────────────────────────────

/// A raw unit entering the pipeline from a source collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Stable, source-provided identifier (e.g. a Message-ID).
    pub external_id: String,
    /// Source name ("maildir", "imap", ...).
    pub source: String,
    /// Opaque payload handed to the ingest stage.
    pub payload: serde_json::Value,
    /// When the source first saw the item.
    pub discovered_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(
        external_id: impl Into<String>,
        source: impl Into<String>,
        payload: serde_json::Value,
        discovered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            source: source.into(),
            payload,
            discovered_at,
        }
    }
}

/// What kind of record an entity is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Newsletter,
    Repository,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Newsletter => "newsletter",
            Self::Repository => "repository",
        }
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newsletter" => Ok(Self::Newsletter),
            "repository" => Ok(Self::Repository),
            other => Err(format!("unknown entity kind: {other}")),
        }
    }
}

/// Lifecycle of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    #[default]
    Active,
    Archived,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }
}

impl FromStr for EntityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown entity status: {other}")),
        }
    }
}

/// A durable, deduplicated record produced by processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub canonical_key: String,
    pub kind: EntityKind,
    pub payload: serde_json::Value,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub mention_count: u32,
    pub status: EntityStatus,
    /// Opaque reference into a secondary embedding store.
    pub vector_ref: Option<String>,
}

/// Assignment of an entity to a category within one scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub entity_key: String,
    /// Category scheme (taxonomy version). One current row per (entity, scheme).
    pub scheme: String,
    pub category: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    /// Set when a newer classification in the same scheme replaced this one.
    pub superseded_at: Option<DateTime<Utc>>,
}

impl Classification {
    pub fn new(
        entity_key: impl Into<String>,
        scheme: impl Into<String>,
        category: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            entity_key: entity_key.into(),
            scheme: scheme.into(),
            category: category.into(),
            confidence,
            created_at: Utc::now(),
            superseded_at: None,
        }
    }

    pub fn is_current(&self) -> bool {
        self.superseded_at.is_none()
    }
}

/// An entity together with its current classifications.
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedEntity {
    pub entity: Entity,
    pub classifications: Vec<Classification>,
}

impl ClassifiedEntity {
    /// Highest-confidence current category, if any.
    pub fn primary_category(&self) -> Option<&str> {
        self.classifications
            .iter()
            .filter(|c| c.is_current())
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .map(|c| c.category.as_str())
    }
}

// ── Batches ─────────────────────────────────────────────────────────

/// Status of a batch. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: BatchStatus) -> bool {
        use BatchStatus::*;

        matches!(
            (self, target),
            (Pending, Processing) | (Processing, Completed) | (Processing, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown batch status: {other}")),
        }
    }
}

/// An item a batch finished without, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedItem {
    pub key: String,
    pub reason: String,
}

/// A bounded, independently-retryable group of items for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: Uuid,
    pub run_id: Uuid,
    pub stage: Stage,
    pub status: BatchStatus,
    /// Item keys in arrival order (work item ids for ingest, entity keys after).
    pub items: Vec<String>,
    pub attempt: u32,
    /// The batch this one retries, if any.
    pub parent_batch_id: Option<Uuid>,
    /// The batch that replaced this one after failure, if any.
    pub requeued_as: Option<Uuid>,
    /// Store instance that claimed the batch.
    pub owner_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    /// Earliest time the batch may be claimed.
    pub available_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub succeeded: u32,
    pub skipped: Vec<SkippedItem>,
    pub last_error: Option<String>,
}

/// An item queued for a stage.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem {
    /// A raw work item (ingest stage only).
    Work(WorkItem),
    /// An entity produced by the previous stage.
    Entity(String),
}

/// Several batches admitted to one stage in a single transaction.
#[derive(Debug, Clone)]
pub struct NewBatches {
    pub run_id: Uuid,
    pub stage: Stage,
    /// One entry per batch, items in arrival order.
    pub chunks: Vec<Vec<QueueItem>>,
    /// Ingestion cursor to persist together with the batches.
    pub source_cursor: Option<String>,
}

/// Copy of one batch item handed to a stage handler.
#[derive(Debug, Clone)]
pub struct StageItem {
    pub key: String,
    /// Work item payload (ingest) or entity payload (later stages).
    pub payload: serde_json::Value,
    /// Mentions recorded for the work item (ingest only, else 0).
    pub mentions: u32,
    /// When the item was first seen.
    pub seen_at: DateTime<Utc>,
    /// Snapshot of the entity, for stages after ingest.
    pub entity: Option<Entity>,
    /// Current classifications of the entity.
    pub classifications: Vec<Classification>,
}

// ── Outcomes ────────────────────────────────────────────────────────

/// A write a stage handler asks the store to apply at commit.
///
/// Upserts by `canonical_key`: a missing entity is created (requires
/// `kind`); an existing one gets `add_mentions` added, `last_seen`
/// bumped, and `payload` merged key by key.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityWrite {
    pub canonical_key: String,
    pub kind: Option<EntityKind>,
    pub payload: Option<serde_json::Value>,
    pub add_mentions: u32,
    pub seen_at: DateTime<Utc>,
    pub status: Option<EntityStatus>,
    pub vector_ref: Option<String>,
    /// Classifications that supersede the current ones in their schemes.
    pub classifications: Vec<Classification>,
}

impl EntityWrite {
    /// A mention of `key`: create it or bump its counters.
    pub fn mention(
        key: impl Into<String>,
        kind: EntityKind,
        payload: serde_json::Value,
        mentions: u32,
        seen_at: DateTime<Utc>,
    ) -> Self {
        Self {
            canonical_key: key.into(),
            kind: Some(kind),
            payload: Some(payload),
            add_mentions: mentions,
            seen_at,
            status: None,
            vector_ref: None,
            classifications: Vec::new(),
        }
    }

    /// An update to an existing entity that records no new mention.
    pub fn update(key: impl Into<String>) -> Self {
        Self {
            canonical_key: key.into(),
            kind: None,
            payload: None,
            add_mentions: 0,
            seen_at: Utc::now(),
            status: None,
            vector_ref: None,
            classifications: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_status(mut self, status: EntityStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_classifications(mut self, classifications: Vec<Classification>) -> Self {
        self.classifications = classifications;
        self
    }

    /// Check the write before it touches the store.
    pub fn validate(&self) -> Result<(), String> {
        if self.canonical_key.trim().is_empty() {
            return Err("entity write with empty canonical key".into());
        }
        let mut schemes = std::collections::HashSet::new();
        for c in &self.classifications {
            if c.entity_key != self.canonical_key {
                return Err(format!(
                    "classification for {} attached to {}",
                    c.entity_key, self.canonical_key
                ));
            }
            if c.scheme.trim().is_empty() || c.category.trim().is_empty() {
                return Err(format!(
                    "classification for {} has empty scheme or category",
                    self.canonical_key
                ));
            }
            if !(0.0..=1.0).contains(&c.confidence) {
                return Err(format!(
                    "confidence {} for {} outside [0, 1]",
                    c.confidence, self.canonical_key
                ));
            }
            if !schemes.insert(c.scheme.as_str()) {
                return Err(format!(
                    "two classifications in scheme {} for {}",
                    c.scheme, self.canonical_key
                ));
            }
        }
        Ok(())
    }
}

/// Why an item should be tried again later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryKind {
    RateLimited,
    Transient,
}

/// Result of processing one item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemResult {
    /// Processed; apply these writes.
    Succeeded { writes: Vec<EntityWrite> },
    /// Permanent failure; record and move on.
    Skipped { reason: String },
    /// Retryable failure; requeue unless attempts are exhausted.
    Retry {
        kind: RetryKind,
        reason: String,
        retry_after: Option<Duration>,
    },
}

/// Outcome of one item within a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    pub key: String,
    pub result: ItemResult,
}

impl ItemOutcome {
    pub fn succeeded(key: impl Into<String>, writes: Vec<EntityWrite>) -> Self {
        Self {
            key: key.into(),
            result: ItemResult::Succeeded { writes },
        }
    }

    pub fn skipped(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            result: ItemResult::Skipped {
                reason: reason.into(),
            },
        }
    }

    /// Map a client failure to the matching item outcome.
    pub fn from_client_error(key: impl Into<String>, err: &ClientError) -> Self {
        let result = match err {
            ClientError::Permanent { .. } => ItemResult::Skipped {
                reason: err.to_string(),
            },
            ClientError::RateLimited { retry_after, .. } => ItemResult::Retry {
                kind: RetryKind::RateLimited,
                reason: err.to_string(),
                retry_after: *retry_after,
            },
            ClientError::Transient { .. } => ItemResult::Retry {
                kind: RetryKind::Transient,
                reason: err.to_string(),
                retry_after: None,
            },
        };
        Self {
            key: key.into(),
            result,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.result, ItemResult::Succeeded { .. })
    }
}

/// Per-item outcomes of a batch, handed to the store at commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub items: Vec<ItemOutcome>,
}

impl BatchOutcome {
    pub fn new(items: Vec<ItemOutcome>) -> Self {
        Self { items }
    }

    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|o| o.is_success()).count()
    }

    /// Longest retry hint among retryable items.
    pub fn max_retry_after(&self) -> Option<Duration> {
        self.items
            .iter()
            .filter_map(|o| match &o.result {
                ItemResult::Retry { retry_after, .. } => *retry_after,
                _ => None,
            })
            .max()
    }
}

/// What `commit_batch_result` did.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchCommit {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub succeeded: u32,
    pub skipped: Vec<SkippedItem>,
    /// Follow-up batch holding the retryable items, if any.
    pub requeued: Option<Batch>,
}

// ── Runs ────────────────────────────────────────────────────────────

/// Process-wide lifecycle record for one pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Uuid,
    /// Stage currently admitting batches, or a terminal phase.
    pub phase: RunPhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl RunState {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Batch and item counts for one stage of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageSummary {
    pub pending: u32,
    pub processing: u32,
    pub completed: u32,
    /// Failed batches whose items were not requeued.
    pub failed: u32,
    /// Failed batches whose items live on in a retry batch.
    pub retried: u32,
    pub items_succeeded: u32,
    pub items_skipped: u32,
}

impl StageSummary {
    /// Ratio of failed batches to batches that reached a final state.
    pub fn failure_ratio(&self) -> f64 {
        let settled = self.completed + self.failed;
        if settled == 0 {
            0.0
        } else {
            f64::from(self.failed) / f64::from(settled)
        }
    }

    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}

/// Summary of a run, producible from any phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run: RunState,
    pub stages: Vec<(Stage, StageSummary)>,
}

impl RunSummary {
    pub fn stage(&self, stage: Stage) -> Option<&StageSummary> {
        self.stages.iter().find(|(s, _)| *s == stage).map(|(_, s)| s)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run {}: {}", self.run.run_id, self.run.phase)?;
        for (stage, s) in &self.stages {
            writeln!(
                f,
                "  {stage:<9} items ok={} skipped={}  batches completed={} failed={} retried={}",
                s.items_succeeded, s.items_skipped, s.completed, s.failed, s.retried
            )?;
        }
        if let Some(err) = &self.run.last_error {
            writeln!(f, "  error: {err}")?;
        }
        Ok(())
    }
}
