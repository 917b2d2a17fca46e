//! libSQL backend: async `DurableStore` implementation.
//!
//! One connection per store instance. Writers serialize on a write gate and
//! readers share it, so a read never observes an open transaction. Local
//! file and in-memory databases are supported.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::DatabaseError;
use crate::pipeline::state::RunPhase;
use crate::pipeline::types::{
    Batch, BatchCommit, BatchOutcome, BatchStatus, Classification, ClassifiedEntity, Entity,
    EntityKind, EntityWrite, ItemResult, NewBatches, QueueItem, RetryKind, RunState,
    RunSummary, SkippedItem, Stage, StageItem, StageSummary,
};
use crate::store::migrations;
use crate::store::traits::{DurableStore, HistoryEvent};

const INGEST_CURSOR_KEY: &str = "ingest_cursor";

const BATCH_COLUMNS: &str = "batch_id, run_id, stage, status, items, attempt, parent_batch_id, \
     requeued_as, owner_id, created_at, available_at, started_at, completed_at, succeeded, \
     skipped, last_error";

const ENTITY_COLUMNS: &str =
    "canonical_key, kind, payload, first_seen, last_seen, mention_count, status, vector_ref";

const RUN_COLUMNS: &str = "run_id, phase, started_at, finished_at, last_error";

/// Knobs the store needs to settle batches on its own.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Heartbeat age after which another owner's `processing` batch is an orphan.
    pub orphan_lease: Duration,
    /// Transient retries of a batch at this attempt are skipped instead of
    /// requeued. Rate-limited items are always requeued.
    pub max_item_attempts: u32,
    /// Minimum delay before a retry batch may be claimed.
    pub requeue_delay: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        let config = PipelineConfig::default();
        Self::from(&config)
    }
}

impl From<&PipelineConfig> for StoreOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            orphan_lease: config.orphan_lease,
            max_item_attempts: config.max_item_attempts,
            requeue_delay: config.requeue_delay,
        }
    }
}

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    gate: RwLock<()>,
    owner_id: Uuid,
    /// This host's boot id. Pids of owners recorded under it are checked in /proc.
    boot_id: Option<String>,
    options: StoreOptions,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), owner_id = %backend.owner_id, "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            gate: RwLock::new(()),
            boot_id: current_boot_id().await,
            owner_id: Uuid::new_v4(),
            options: StoreOptions::default(),
        };
        migrations::run_migrations(&backend.conn).await?;
        backend.register_owner().await?;
        Ok(backend)
    }

    /// Replace the settlement options.
    pub fn with_options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    async fn register_owner(&self) -> Result<(), DatabaseError> {
        let now = now_ts();
        self.conn
            .execute(
                "INSERT OR REPLACE INTO owners (owner_id, pid, boot_id, started_at, heartbeat_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![
                    self.owner_id.to_string(),
                    i64::from(std::process::id()),
                    opt_text(self.boot_id.as_deref()),
                    now
                ],
            )
            .await
            .map_err(|e| query_error("register_owner", e))?;
        Ok(())
    }

    /// Other owners that still count as alive: heartbeat within the lease,
    /// and, when registered under this boot, a process that still exists.
    async fn live_owners(&self, cutoff: DateTime<Utc>) -> Result<HashSet<Uuid>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT owner_id, pid, boot_id, heartbeat_at FROM owners WHERE owner_id != ?1",
                params![self.owner_id.to_string()],
            )
            .await
            .map_err(|e| query_error("live_owners", e))?;

        let mut live = HashSet::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| query_error("live_owners: next", e))?
        {
            let owner_id = parse_uuid(&row.get::<String>(0).map_err(decode_error)?)?;
            let pid: i64 = row.get(1).map_err(decode_error)?;
            let boot_id: Option<String> = row.get(2).map_err(decode_error)?;
            let heartbeat_at = parse_datetime(&row.get::<String>(3).map_err(decode_error)?);

            if heartbeat_at < cutoff {
                continue;
            }
            let same_boot = self.boot_id.is_some() && boot_id == self.boot_id;
            if same_boot && !process_exists(pid).await {
                debug!(owner_id = %owner_id, pid, "Owner process is gone");
                continue;
            }
            live.insert(owner_id);
        }
        Ok(live)
    }

    async fn commit_locked(
        &self,
        batch_id: Uuid,
        outcome: &BatchOutcome,
    ) -> Result<BatchCommit, DatabaseError> {
        let batch = fetch_batch(&self.conn, batch_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "batch".into(),
                id: batch_id.to_string(),
            })?;
        if batch.status != BatchStatus::Processing || batch.owner_id != Some(self.owner_id) {
            return Err(conflict(
                batch_id,
                format!(
                    "batch is {} under owner {:?}, not processing under {}",
                    batch.status, batch.owner_id, self.owner_id
                ),
            ));
        }

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| query_error("commit_batch_result: begin", e))?;
        match apply_outcome(&tx, &batch, outcome, self.owner_id, &self.options).await {
            Ok(commit) => {
                tx.commit()
                    .await
                    .map_err(|e| query_error("commit_batch_result: commit", e))?;
                Ok(commit)
            }
            Err(DatabaseError::Validation(reason)) => {
                let _ = tx.rollback().await;
                warn!(batch_id = %batch_id, %reason, "Rejected batch writes");
                let skipped: Vec<SkippedItem> = batch
                    .items
                    .iter()
                    .map(|key| SkippedItem {
                        key: key.clone(),
                        reason: format!("invalid write: {reason}"),
                    })
                    .collect();
                mark_terminal(
                    &self.conn,
                    &batch,
                    self.owner_id,
                    BatchStatus::Failed,
                    0,
                    &skipped,
                    None,
                    Some(&reason),
                )
                .await?;
                Ok(BatchCommit {
                    batch_id,
                    status: BatchStatus::Failed,
                    succeeded: 0,
                    skipped,
                    requeued: None,
                })
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width UTC timestamp so stored values sort lexicographically.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_ts() -> String {
    ts(Utc::now())
}

async fn current_boot_id() -> Option<String> {
    tokio::fs::read_to_string("/proc/sys/kernel/random/boot_id")
        .await
        .ok()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

async fn process_exists(pid: i64) -> bool {
    tokio::fs::try_exists(format!("/proc/{pid}"))
        .await
        .unwrap_or(true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(3650))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn query_error(context: &str, e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("{context}: {e}"))
}

fn decode_error(e: libsql::Error) -> DatabaseError {
    DatabaseError::Serialization(format!("row decode: {e}"))
}

fn conflict(batch_id: Uuid, reason: String) -> DatabaseError {
    DatabaseError::Conflict {
        entity: "batch".into(),
        id: batch_id.to_string(),
        reason,
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s:?}: {e}")))
}

fn parse_opt_uuid(s: Option<String>) -> Result<Option<Uuid>, DatabaseError> {
    s.as_deref().map(parse_uuid).transpose()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Shallow merge: object keys from `update` overwrite `existing`, any other
/// shape replaces it.
fn merge_payload(existing: &mut serde_json::Value, update: serde_json::Value) {
    if let (Some(base), serde_json::Value::Object(patch)) = (existing.as_object_mut(), &update) {
        for (k, v) in patch {
            base.insert(k.clone(), v.clone());
        }
        return;
    }
    *existing = update;
}

fn row_to_batch(row: &libsql::Row) -> Result<Batch, DatabaseError> {
    let stage: String = row.get(2).map_err(decode_error)?;
    let status: String = row.get(3).map_err(decode_error)?;
    let items: String = row.get(4).map_err(decode_error)?;
    let skipped: String = row.get(14).map_err(decode_error)?;
    Ok(Batch {
        batch_id: parse_uuid(&row.get::<String>(0).map_err(decode_error)?)?,
        run_id: parse_uuid(&row.get::<String>(1).map_err(decode_error)?)?,
        stage: stage.parse().map_err(DatabaseError::Serialization)?,
        status: status.parse().map_err(DatabaseError::Serialization)?,
        items: from_json(&items)?,
        attempt: row.get::<i64>(5).map_err(decode_error)? as u32,
        parent_batch_id: parse_opt_uuid(row.get(6).map_err(decode_error)?)?,
        requeued_as: parse_opt_uuid(row.get(7).map_err(decode_error)?)?,
        owner_id: parse_opt_uuid(row.get(8).map_err(decode_error)?)?,
        created_at: parse_datetime(&row.get::<String>(9).map_err(decode_error)?),
        available_at: parse_datetime(&row.get::<String>(10).map_err(decode_error)?),
        started_at: parse_optional_datetime(&row.get(11).map_err(decode_error)?),
        completed_at: parse_optional_datetime(&row.get(12).map_err(decode_error)?),
        succeeded: row.get::<i64>(13).map_err(decode_error)? as u32,
        skipped: from_json(&skipped)?,
        last_error: row.get(15).map_err(decode_error)?,
    })
}

fn row_to_entity(row: &libsql::Row) -> Result<Entity, DatabaseError> {
    let kind: String = row.get(1).map_err(decode_error)?;
    let payload: String = row.get(2).map_err(decode_error)?;
    let status: String = row.get(6).map_err(decode_error)?;
    Ok(Entity {
        canonical_key: row.get(0).map_err(decode_error)?,
        kind: kind.parse().map_err(DatabaseError::Serialization)?,
        payload: from_json(&payload)?,
        first_seen: parse_datetime(&row.get::<String>(3).map_err(decode_error)?),
        last_seen: parse_datetime(&row.get::<String>(4).map_err(decode_error)?),
        mention_count: row.get::<i64>(5).map_err(decode_error)? as u32,
        status: status.parse().map_err(DatabaseError::Serialization)?,
        vector_ref: row.get(7).map_err(decode_error)?,
    })
}

fn row_to_run(row: &libsql::Row) -> Result<RunState, DatabaseError> {
    let phase: String = row.get(1).map_err(decode_error)?;
    Ok(RunState {
        run_id: parse_uuid(&row.get::<String>(0).map_err(decode_error)?)?,
        phase: phase.parse().map_err(DatabaseError::Serialization)?,
        started_at: parse_datetime(&row.get::<String>(2).map_err(decode_error)?),
        finished_at: parse_optional_datetime(&row.get(3).map_err(decode_error)?),
        last_error: row.get(4).map_err(decode_error)?,
    })
}

/// Columns: entity_key, scheme, category, confidence, created_at, superseded_at.
fn row_to_classification(row: &libsql::Row) -> Result<Classification, DatabaseError> {
    Ok(Classification {
        entity_key: row.get(0).map_err(decode_error)?,
        scheme: row.get(1).map_err(decode_error)?,
        category: row.get(2).map_err(decode_error)?,
        confidence: row.get::<f64>(3).map_err(decode_error)?,
        created_at: parse_datetime(&row.get::<String>(4).map_err(decode_error)?),
        superseded_at: parse_optional_datetime(&row.get(5).map_err(decode_error)?),
    })
}

async fn collect_batches(mut rows: libsql::Rows) -> Result<Vec<Batch>, DatabaseError> {
    let mut batches = Vec::new();
    while let Some(row) = rows.next().await.map_err(decode_error)? {
        batches.push(row_to_batch(&row)?);
    }
    Ok(batches)
}

async fn count(
    conn: &Connection,
    sql: &str,
    args: impl libsql::params::IntoParams,
) -> Result<u32, DatabaseError> {
    let mut rows = conn
        .query(sql, args)
        .await
        .map_err(|e| query_error("count", e))?;
    match rows.next().await.map_err(decode_error)? {
        Some(row) => Ok(row.get::<i64>(0).map_err(decode_error)? as u32),
        None => Ok(0),
    }
}

async fn fetch_batch(conn: &Connection, batch_id: Uuid) -> Result<Option<Batch>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {BATCH_COLUMNS} FROM batches WHERE batch_id = ?1"),
            params![batch_id.to_string()],
        )
        .await
        .map_err(|e| query_error("get_batch", e))?;
    match rows.next().await.map_err(decode_error)? {
        Some(row) => Ok(Some(row_to_batch(&row)?)),
        None => Ok(None),
    }
}

async fn fetch_entity(conn: &Connection, key: &str) -> Result<Option<Entity>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE canonical_key = ?1"),
            params![key],
        )
        .await
        .map_err(|e| query_error("get_entity", e))?;
    match rows.next().await.map_err(decode_error)? {
        Some(row) => Ok(Some(row_to_entity(&row)?)),
        None => Ok(None),
    }
}

async fn fetch_current_classifications(
    conn: &Connection,
    key: &str,
) -> Result<Vec<Classification>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT entity_key, scheme, category, confidence, created_at, superseded_at
             FROM classifications WHERE entity_key = ?1 AND superseded_at IS NULL
             ORDER BY scheme",
            params![key],
        )
        .await
        .map_err(|e| query_error("current_classifications", e))?;
    let mut current = Vec::new();
    while let Some(row) = rows.next().await.map_err(decode_error)? {
        current.push(row_to_classification(&row)?);
    }
    Ok(current)
}

async fn fetch_run(conn: &Connection, run_id: Uuid) -> Result<Option<RunState>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
            params![run_id.to_string()],
        )
        .await
        .map_err(|e| query_error("get_run", e))?;
    match rows.next().await.map_err(decode_error)? {
        Some(row) => Ok(Some(row_to_run(&row)?)),
        None => Ok(None),
    }
}

async fn insert_history(
    conn: &Connection,
    run_id: Uuid,
    event: &str,
    stage: Option<Stage>,
    detail: Option<&str>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO run_history (run_id, event, stage, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            run_id.to_string(),
            event,
            opt_text(stage.map(|s| s.as_str())),
            opt_text(detail),
            now_ts()
        ],
    )
    .await
    .map_err(|e| query_error("append_history", e))?;
    Ok(())
}

/// Insert a pending batch row and return its in-memory copy.
#[allow(clippy::too_many_arguments)]
async fn insert_batch(
    conn: &Connection,
    run_id: Uuid,
    stage: Stage,
    items: Vec<String>,
    attempt: u32,
    parent_batch_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
) -> Result<Batch, DatabaseError> {
    let batch_id = Uuid::new_v4();
    let parent = parent_batch_id.map(|id| id.to_string());
    conn.execute(
        "INSERT INTO batches (batch_id, seq, run_id, stage, status, items, attempt,
                              parent_batch_id, created_at, available_at)
         VALUES (?1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM batches), ?2, ?3, 'pending',
                 ?4, ?5, ?6, ?7, ?8)",
        params![
            batch_id.to_string(),
            run_id.to_string(),
            stage.as_str(),
            to_json(&items)?,
            i64::from(attempt),
            opt_text(parent.as_deref()),
            ts(created_at),
            ts(available_at)
        ],
    )
    .await
    .map_err(|e| query_error("insert_batch", e))?;

    debug!(
        batch_id = %batch_id,
        run_id = %run_id,
        stage = %stage,
        attempt,
        items = items.len(),
        "Batch created"
    );

    Ok(Batch {
        batch_id,
        run_id,
        stage,
        status: BatchStatus::Pending,
        items,
        attempt,
        parent_batch_id,
        requeued_as: None,
        owner_id: None,
        created_at,
        available_at,
        started_at: None,
        completed_at: None,
        succeeded: 0,
        skipped: Vec::new(),
        last_error: None,
    })
}

/// Turn queue items into batch keys. Work items already known to the store
/// are merged (mention counters bumped) and left out of the batch.
async fn admit_items(
    conn: &Connection,
    items: Vec<QueueItem>,
) -> Result<Vec<String>, DatabaseError> {
    let mut keys = Vec::with_capacity(items.len());
    for item in items {
        match item {
            QueueItem::Entity(key) => keys.push(key),
            QueueItem::Work(work) => {
                let now = now_ts();
                let merged = conn
                    .execute(
                        "UPDATE work_items SET mentions = mentions + 1, updated_at = ?2
                         WHERE external_id = ?1",
                        params![work.external_id.as_str(), now.as_str()],
                    )
                    .await
                    .map_err(|e| query_error("merge_work_item", e))?;
                if merged > 0 {
                    let seen = ts(work.discovered_at);
                    conn.execute(
                        "UPDATE entities SET mention_count = mention_count + 1,
                             last_seen = MAX(last_seen, ?2), updated_at = ?3
                         WHERE canonical_key = ?1",
                        params![work.external_id.as_str(), seen, now.as_str()],
                    )
                    .await
                    .map_err(|e| query_error("merge_work_item: entity", e))?;
                    debug!(external_id = %work.external_id, "Merged duplicate work item");
                    continue;
                }
                conn.execute(
                    "INSERT INTO work_items (external_id, source, payload, discovered_at,
                                             mentions, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
                    params![
                        work.external_id.as_str(),
                        work.source.as_str(),
                        to_json(&work.payload)?,
                        ts(work.discovered_at),
                        now
                    ],
                )
                .await
                .map_err(|e| query_error("insert_work_item", e))?;
                keys.push(work.external_id);
            }
        }
    }
    Ok(keys)
}

async fn admit_chunk(
    conn: &Connection,
    run_id: Uuid,
    stage: Stage,
    items: Vec<QueueItem>,
) -> Result<Option<Batch>, DatabaseError> {
    let keys = admit_items(conn, items).await?;
    if keys.is_empty() {
        return Ok(None);
    }
    let now = Utc::now();
    insert_batch(conn, run_id, stage, keys, 1, None, now, now)
        .await
        .map(Some)
}

/// Upsert one entity and supersede its classifications.
async fn apply_entity_write(
    conn: &Connection,
    write: &EntityWrite,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let now_str = ts(now);
    match fetch_entity(conn, &write.canonical_key).await? {
        None => {
            let kind = write.kind.ok_or_else(|| {
                DatabaseError::Validation(format!(
                    "write to unknown entity {} carries no kind",
                    write.canonical_key
                ))
            })?;
            let payload = write
                .payload
                .clone()
                .unwrap_or_else(|| serde_json::json!({}));
            let seen = ts(write.seen_at);
            conn.execute(
                "INSERT INTO entities (canonical_key, kind, payload, first_seen, last_seen,
                                       mention_count, status, vector_ref, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6, ?7, ?8)",
                params![
                    write.canonical_key.as_str(),
                    kind.as_str(),
                    to_json(&payload)?,
                    seen,
                    i64::from(write.add_mentions),
                    write.status.unwrap_or_default().as_str(),
                    opt_text(write.vector_ref.as_deref()),
                    now_str.as_str()
                ],
            )
            .await
            .map_err(|e| query_error("insert_entity", e))?;
        }
        Some(mut entity) => {
            if let Some(payload) = write.payload.clone() {
                merge_payload(&mut entity.payload, payload);
            }
            if write.add_mentions > 0 {
                entity.mention_count += write.add_mentions;
                entity.last_seen = entity.last_seen.max(write.seen_at);
            }
            if let Some(status) = write.status {
                entity.status = status;
            }
            if write.vector_ref.is_some() {
                entity.vector_ref = write.vector_ref.clone();
            }
            conn.execute(
                "UPDATE entities SET payload = ?2, last_seen = ?3, mention_count = ?4,
                     status = ?5, vector_ref = ?6, updated_at = ?7
                 WHERE canonical_key = ?1",
                params![
                    write.canonical_key.as_str(),
                    to_json(&entity.payload)?,
                    ts(entity.last_seen),
                    i64::from(entity.mention_count),
                    entity.status.as_str(),
                    opt_text(entity.vector_ref.as_deref()),
                    now_str.as_str()
                ],
            )
            .await
            .map_err(|e| query_error("update_entity", e))?;
        }
    }

    for c in &write.classifications {
        conn.execute(
            "UPDATE classifications SET superseded_at = ?3
             WHERE entity_key = ?1 AND scheme = ?2 AND superseded_at IS NULL",
            params![c.entity_key.as_str(), c.scheme.as_str(), now_str.as_str()],
        )
        .await
        .map_err(|e| query_error("supersede_classification", e))?;
        conn.execute(
            "INSERT INTO classifications (id, entity_key, scheme, category, confidence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                c.entity_key.as_str(),
                c.scheme.as_str(),
                c.category.as_str(),
                c.confidence,
                ts(c.created_at)
            ],
        )
        .await
        .map_err(|e| query_error("insert_classification", e))?;
    }
    Ok(())
}

/// Set a batch's terminal status. Fails with `Conflict` if it is no longer
/// `processing` under `owner_id`.
#[allow(clippy::too_many_arguments)]
async fn mark_terminal(
    conn: &Connection,
    batch: &Batch,
    owner_id: Uuid,
    status: BatchStatus,
    succeeded: u32,
    skipped: &[SkippedItem],
    requeued_as: Option<Uuid>,
    last_error: Option<&str>,
) -> Result<(), DatabaseError> {
    let requeued = requeued_as.map(|id| id.to_string());
    let updated = conn
        .execute(
            "UPDATE batches SET status = ?3, completed_at = ?4, succeeded = ?5, skipped = ?6,
                 requeued_as = ?7, last_error = ?8
             WHERE batch_id = ?1 AND status = 'processing' AND owner_id = ?2",
            params![
                batch.batch_id.to_string(),
                owner_id.to_string(),
                status.as_str(),
                now_ts(),
                i64::from(succeeded),
                to_json(&skipped)?,
                opt_text(requeued.as_deref()),
                opt_text(last_error)
            ],
        )
        .await
        .map_err(|e| query_error("mark_terminal", e))?;
    if updated == 0 {
        return Err(conflict(
            batch.batch_id,
            "batch left processing before commit".into(),
        ));
    }
    Ok(())
}

/// Apply every write of a batch outcome, settle retryable items and mark the
/// batch terminal. Callers run this inside a transaction.
async fn apply_outcome(
    conn: &Connection,
    batch: &Batch,
    outcome: &BatchOutcome,
    owner_id: Uuid,
    options: &StoreOptions,
) -> Result<BatchCommit, DatabaseError> {
    for item in &outcome.items {
        if let ItemResult::Succeeded { writes } = &item.result {
            for write in writes {
                write.validate().map_err(DatabaseError::Validation)?;
            }
        }
    }

    let now = Utc::now();
    let results: HashMap<&str, &ItemResult> = outcome
        .items
        .iter()
        .map(|o| (o.key.as_str(), &o.result))
        .collect();

    let mut succeeded = 0u32;
    let mut skipped = Vec::new();
    let mut retry_keys = Vec::new();
    let mut spends_attempt = false;
    let mut last_reason: Option<String> = None;

    for key in &batch.items {
        match results.get(key.as_str()) {
            Some(ItemResult::Succeeded { writes }) => {
                for write in writes {
                    apply_entity_write(conn, write, now).await?;
                    conn.execute(
                        "INSERT OR IGNORE INTO stage_outputs (run_id, stage, entity_key, created_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![
                            batch.run_id.to_string(),
                            batch.stage.as_str(),
                            write.canonical_key.as_str(),
                            ts(now)
                        ],
                    )
                    .await
                    .map_err(|e| query_error("insert_stage_output", e))?;
                }
                succeeded += 1;
            }
            Some(ItemResult::Skipped { reason }) => {
                last_reason = Some(reason.clone());
                skipped.push(SkippedItem {
                    key: key.clone(),
                    reason: reason.clone(),
                });
            }
            // Quota refusals are never final; only transient failures
            // spend the attempt budget.
            Some(ItemResult::Retry {
                kind: RetryKind::RateLimited,
                reason,
                ..
            }) => {
                last_reason = Some(reason.clone());
                retry_keys.push(key.clone());
            }
            Some(ItemResult::Retry { reason, .. }) => {
                last_reason = Some(reason.clone());
                if batch.attempt < options.max_item_attempts {
                    spends_attempt = true;
                    retry_keys.push(key.clone());
                } else {
                    skipped.push(SkippedItem {
                        key: key.clone(),
                        reason: format!("attempts exhausted: {reason}"),
                    });
                }
            }
            None => {
                let reason = "no outcome reported".to_string();
                last_reason = Some(reason.clone());
                skipped.push(SkippedItem {
                    key: key.clone(),
                    reason,
                });
            }
        }
    }

    let requeued = if retry_keys.is_empty() {
        None
    } else {
        let delay = outcome
            .max_retry_after()
            .unwrap_or_default()
            .max(options.requeue_delay);
        Some(
            insert_batch(
                conn,
                batch.run_id,
                batch.stage,
                retry_keys,
                if spends_attempt {
                    batch.attempt + 1
                } else {
                    batch.attempt
                },
                Some(batch.batch_id),
                now,
                after(now, delay),
            )
            .await?,
        )
    };

    let status = if succeeded == 0 {
        BatchStatus::Failed
    } else {
        BatchStatus::Completed
    };
    let last_error = if status == BatchStatus::Failed {
        last_reason
    } else {
        None
    };
    mark_terminal(
        conn,
        batch,
        owner_id,
        status,
        succeeded,
        &skipped,
        requeued.as_ref().map(|b| b.batch_id),
        last_error.as_deref(),
    )
    .await?;

    Ok(BatchCommit {
        batch_id: batch.batch_id,
        status,
        succeeded,
        skipped,
        requeued,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl DurableStore for LibSqlBackend {
    fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    async fn heartbeat(&self) -> Result<(), DatabaseError> {
        let _gate = self.gate.write().await;
        let updated = self
            .conn
            .execute(
                "UPDATE owners SET heartbeat_at = ?2 WHERE owner_id = ?1",
                params![self.owner_id.to_string(), now_ts()],
            )
            .await
            .map_err(|e| query_error("heartbeat", e))?;
        if updated == 0 {
            self.register_owner().await?;
        }
        Ok(())
    }

    async fn release(&self) -> Result<(), DatabaseError> {
        let _gate = self.gate.write().await;
        self.conn
            .execute(
                "DELETE FROM owners WHERE owner_id = ?1",
                params![self.owner_id.to_string()],
            )
            .await
            .map_err(|e| query_error("release", e))?;
        Ok(())
    }

    // ── Runs ────────────────────────────────────────────────────────

    async fn create_run(&self) -> Result<RunState, DatabaseError> {
        let _gate = self.gate.write().await;
        let run = RunState {
            run_id: Uuid::new_v4(),
            phase: RunPhase::INITIAL,
            started_at: Utc::now(),
            finished_at: None,
            last_error: None,
        };
        self.conn
            .execute(
                "INSERT INTO runs (run_id, phase, started_at) VALUES (?1, ?2, ?3)",
                params![
                    run.run_id.to_string(),
                    run.phase.as_str(),
                    ts(run.started_at)
                ],
            )
            .await
            .map_err(|e| query_error("create_run", e))?;
        insert_history(&self.conn, run.run_id, "run_started", None, None).await?;
        info!(run_id = %run.run_id, "Run created");
        Ok(run)
    }

    async fn active_run(&self) -> Result<Option<RunState>, DatabaseError> {
        let _gate = self.gate.read().await;
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE finished_at IS NULL
                     ORDER BY started_at DESC LIMIT 1"
                ),
                (),
            )
            .await
            .map_err(|e| query_error("active_run", e))?;
        match rows.next().await.map_err(decode_error)? {
            Some(row) => Ok(Some(row_to_run(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunState>, DatabaseError> {
        let _gate = self.gate.read().await;
        fetch_run(&self.conn, run_id).await
    }

    async fn set_run_phase(
        &self,
        run_id: Uuid,
        phase: RunPhase,
        last_error: Option<&str>,
    ) -> Result<RunState, DatabaseError> {
        let _gate = self.gate.write().await;
        let mut run = fetch_run(&self.conn, run_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "run".into(),
                id: run_id.to_string(),
            })?;
        if !run.phase.can_transition_to(phase) {
            return Err(DatabaseError::Validation(format!(
                "run {run_id} cannot move from {} to {phase}",
                run.phase
            )));
        }

        let from = run.phase;
        run.phase = phase;
        if last_error.is_some() {
            run.last_error = last_error.map(str::to_string);
        }
        if phase.is_terminal() {
            run.finished_at = Some(Utc::now());
        }
        let finished = run.finished_at.map(ts);

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| query_error("set_run_phase: begin", e))?;
        let applied = async {
            tx.execute(
                "UPDATE runs SET phase = ?2, finished_at = ?3, last_error = ?4 WHERE run_id = ?1",
                params![
                    run_id.to_string(),
                    phase.as_str(),
                    opt_text(finished.as_deref()),
                    opt_text(run.last_error.as_deref())
                ],
            )
            .await
            .map_err(|e| query_error("set_run_phase", e))?;
            let detail = format!("{from} -> {phase}");
            insert_history(&tx, run_id, "phase_changed", phase.stage(), Some(&detail)).await
        }
        .await;
        match applied {
            Ok(()) => tx
                .commit()
                .await
                .map_err(|e| query_error("set_run_phase: commit", e))?,
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        }

        info!(run_id = %run_id, from = %from, to = %phase, "Run phase changed");
        Ok(run)
    }

    async fn append_history(
        &self,
        run_id: Uuid,
        event: &str,
        stage: Option<Stage>,
        detail: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let _gate = self.gate.write().await;
        insert_history(&self.conn, run_id, event, stage, detail).await
    }

    async fn run_history(&self, run_id: Uuid) -> Result<Vec<HistoryEvent>, DatabaseError> {
        let _gate = self.gate.read().await;
        let mut rows = self
            .conn
            .query(
                "SELECT run_id, event, stage, detail, created_at FROM run_history
                 WHERE run_id = ?1 ORDER BY id",
                params![run_id.to_string()],
            )
            .await
            .map_err(|e| query_error("run_history", e))?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await.map_err(decode_error)? {
            let stage: Option<String> = row.get(2).map_err(decode_error)?;
            events.push(HistoryEvent {
                run_id: parse_uuid(&row.get::<String>(0).map_err(decode_error)?)?,
                event: row.get(1).map_err(decode_error)?,
                stage: stage
                    .map(|s| s.parse())
                    .transpose()
                    .map_err(DatabaseError::Serialization)?,
                detail: row.get(3).map_err(decode_error)?,
                created_at: parse_datetime(&row.get::<String>(4).map_err(decode_error)?),
            });
        }
        Ok(events)
    }

    async fn stage_summary(
        &self,
        run_id: Uuid,
        stage: Stage,
    ) -> Result<StageSummary, DatabaseError> {
        let _gate = self.gate.read().await;
        let mut rows = self
            .conn
            .query(
                "SELECT status, requeued_as IS NOT NULL, COUNT(*),
                        COALESCE(SUM(succeeded), 0),
                        COALESCE(SUM(json_array_length(skipped)), 0)
                 FROM batches WHERE run_id = ?1 AND stage = ?2
                 GROUP BY status, requeued_as IS NOT NULL",
                params![run_id.to_string(), stage.as_str()],
            )
            .await
            .map_err(|e| query_error("stage_summary", e))?;

        let mut summary = StageSummary::default();
        while let Some(row) = rows.next().await.map_err(decode_error)? {
            let status: String = row.get(0).map_err(decode_error)?;
            let requeued = row.get::<i64>(1).map_err(decode_error)? != 0;
            let batches = row.get::<i64>(2).map_err(decode_error)? as u32;
            summary.items_succeeded += row.get::<i64>(3).map_err(decode_error)? as u32;
            summary.items_skipped += row.get::<i64>(4).map_err(decode_error)? as u32;
            match status.parse::<BatchStatus>().map_err(DatabaseError::Serialization)? {
                BatchStatus::Pending => summary.pending += batches,
                BatchStatus::Processing => summary.processing += batches,
                BatchStatus::Completed => summary.completed += batches,
                BatchStatus::Failed if requeued => summary.retried += batches,
                BatchStatus::Failed => summary.failed += batches,
            }
        }
        Ok(summary)
    }

    async fn run_summary(&self, run_id: Uuid) -> Result<RunSummary, DatabaseError> {
        let run = self
            .get_run(run_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "run".into(),
                id: run_id.to_string(),
            })?;
        let mut stages = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            stages.push((stage, self.stage_summary(run_id, stage).await?));
        }
        Ok(RunSummary { run, stages })
    }

    // ── Batches ─────────────────────────────────────────────────────

    async fn create_batch(
        &self,
        run_id: Uuid,
        stage: Stage,
        items: Vec<QueueItem>,
    ) -> Result<Option<Batch>, DatabaseError> {
        let _gate = self.gate.write().await;
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| query_error("create_batch: begin", e))?;
        match admit_chunk(&tx, run_id, stage, items).await {
            Ok(batch) => {
                tx.commit()
                    .await
                    .map_err(|e| query_error("create_batch: commit", e))?;
                Ok(batch)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn create_batches(&self, new: NewBatches) -> Result<Vec<Batch>, DatabaseError> {
        let _gate = self.gate.write().await;
        let NewBatches {
            run_id,
            stage,
            chunks,
            source_cursor,
        } = new;

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| query_error("create_batches: begin", e))?;
        let applied = async {
            let admitted = count(
                &tx,
                "SELECT COUNT(*) FROM stage_admissions WHERE run_id = ?1 AND stage = ?2",
                params![run_id.to_string(), stage.as_str()],
            )
            .await?;
            if admitted > 0 {
                return Err(DatabaseError::Conflict {
                    entity: "stage".into(),
                    id: format!("{run_id}/{stage}"),
                    reason: "stage already admitted".into(),
                });
            }

            let mut batches = Vec::new();
            for chunk in chunks {
                if let Some(batch) = admit_chunk(&tx, run_id, stage, chunk).await? {
                    batches.push(batch);
                }
            }

            tx.execute(
                "INSERT INTO stage_admissions (run_id, stage, batch_count, admitted_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    run_id.to_string(),
                    stage.as_str(),
                    batches.len() as i64,
                    now_ts()
                ],
            )
            .await
            .map_err(|e| query_error("insert_stage_admission", e))?;

            if let Some(cursor) = &source_cursor {
                tx.execute(
                    "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                    updated_at = excluded.updated_at",
                    params![INGEST_CURSOR_KEY, cursor.as_str(), now_ts()],
                )
                .await
                .map_err(|e| query_error("save_cursor", e))?;
            }

            let detail = format!("{} batches", batches.len());
            insert_history(&tx, run_id, "stage_admitted", Some(stage), Some(&detail)).await?;
            Ok(batches)
        }
        .await;

        match applied {
            Ok(batches) => {
                tx.commit()
                    .await
                    .map_err(|e| query_error("create_batches: commit", e))?;
                info!(run_id = %run_id, stage = %stage, batches = batches.len(), "Stage admitted");
                Ok(batches)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn is_stage_admitted(&self, run_id: Uuid, stage: Stage) -> Result<bool, DatabaseError> {
        let _gate = self.gate.read().await;
        let n = count(
            &self.conn,
            "SELECT COUNT(*) FROM stage_admissions WHERE run_id = ?1 AND stage = ?2",
            params![run_id.to_string(), stage.as_str()],
        )
        .await?;
        Ok(n > 0)
    }

    async fn ingest_cursor(&self) -> Result<Option<String>, DatabaseError> {
        let _gate = self.gate.read().await;
        let mut rows = self
            .conn
            .query(
                "SELECT value FROM settings WHERE key = ?1",
                params![INGEST_CURSOR_KEY],
            )
            .await
            .map_err(|e| query_error("ingest_cursor", e))?;
        match rows.next().await.map_err(decode_error)? {
            Some(row) => Ok(Some(row.get(0).map_err(decode_error)?)),
            None => Ok(None),
        }
    }

    async fn claim_next_batch(&self, stage: Stage) -> Result<Option<Batch>, DatabaseError> {
        let _gate = self.gate.write().await;
        let rows = self
            .conn
            .query(
                &format!(
                    "UPDATE batches SET status = 'processing', owner_id = ?1, started_at = ?2
                     WHERE batch_id = (
                         SELECT batch_id FROM batches
                         WHERE stage = ?3 AND status = 'pending' AND available_at <= ?2
                         ORDER BY seq LIMIT 1
                     ) AND status = 'pending'
                     RETURNING {BATCH_COLUMNS}"
                ),
                params![self.owner_id.to_string(), now_ts(), stage.as_str()],
            )
            .await
            .map_err(|e| query_error("claim_next_batch", e))?;
        let batch = collect_batches(rows).await?.into_iter().next();
        if let Some(batch) = &batch {
            debug!(
                batch_id = %batch.batch_id,
                stage = %stage,
                attempt = batch.attempt,
                "Batch claimed"
            );
        }
        Ok(batch)
    }

    async fn load_items(&self, batch: &Batch) -> Result<Vec<StageItem>, DatabaseError> {
        let _gate = self.gate.read().await;
        let mut items = Vec::with_capacity(batch.items.len());
        for key in &batch.items {
            if batch.stage == Stage::Ingest {
                let mut rows = self
                    .conn
                    .query(
                        "SELECT payload, mentions, discovered_at FROM work_items
                         WHERE external_id = ?1",
                        params![key.as_str()],
                    )
                    .await
                    .map_err(|e| query_error("load_items", e))?;
                match rows.next().await.map_err(decode_error)? {
                    Some(row) => {
                        let payload: String = row.get(0).map_err(decode_error)?;
                        items.push(StageItem {
                            key: key.clone(),
                            payload: from_json(&payload)?,
                            mentions: row.get::<i64>(1).map_err(decode_error)? as u32,
                            seen_at: parse_datetime(
                                &row.get::<String>(2).map_err(decode_error)?,
                            ),
                            entity: None,
                            classifications: Vec::new(),
                        });
                    }
                    None => warn!(batch_id = %batch.batch_id, key = %key, "Work item missing"),
                }
            } else {
                match fetch_entity(&self.conn, key).await? {
                    Some(entity) => items.push(StageItem {
                        key: key.clone(),
                        payload: entity.payload.clone(),
                        mentions: 0,
                        seen_at: entity.last_seen,
                        entity: Some(entity),
                        classifications: fetch_current_classifications(&self.conn, key).await?,
                    }),
                    None => warn!(batch_id = %batch.batch_id, key = %key, "Entity missing"),
                }
            }
        }
        Ok(items)
    }

    async fn commit_batch_result(
        &self,
        batch_id: Uuid,
        outcome: BatchOutcome,
    ) -> Result<BatchCommit, DatabaseError> {
        let _gate = self.gate.write().await;
        let commit = self.commit_locked(batch_id, &outcome).await?;
        debug!(
            batch_id = %batch_id,
            status = %commit.status,
            succeeded = commit.succeeded,
            skipped = commit.skipped.len(),
            requeued = commit.requeued.is_some(),
            "Batch committed"
        );
        Ok(commit)
    }

    async fn fail_batch(&self, batch_id: Uuid, reason: &str) -> Result<(), DatabaseError> {
        let _gate = self.gate.write().await;
        let updated = self
            .conn
            .execute(
                "UPDATE batches SET status = 'failed', completed_at = ?2, last_error = ?3
                 WHERE batch_id = ?1 AND status = 'processing'",
                params![batch_id.to_string(), now_ts(), reason],
            )
            .await
            .map_err(|e| query_error("fail_batch", e))?;
        if updated > 0 {
            warn!(batch_id = %batch_id, %reason, "Batch failed");
        }
        Ok(())
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<Batch>, DatabaseError> {
        let _gate = self.gate.read().await;
        fetch_batch(&self.conn, batch_id).await
    }

    async fn list_batches(&self, run_id: Uuid, stage: Stage) -> Result<Vec<Batch>, DatabaseError> {
        let _gate = self.gate.read().await;
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {BATCH_COLUMNS} FROM batches WHERE run_id = ?1 AND stage = ?2
                     ORDER BY seq"
                ),
                params![run_id.to_string(), stage.as_str()],
            )
            .await
            .map_err(|e| query_error("list_batches", e))?;
        collect_batches(rows).await
    }

    async fn peek_depth(&self, stage: Stage) -> Result<u32, DatabaseError> {
        let _gate = self.gate.read().await;
        count(
            &self.conn,
            "SELECT COUNT(*) FROM batches WHERE stage = ?1 AND status = 'pending'",
            params![stage.as_str()],
        )
        .await
    }

    async fn processing_count(&self, stage: Stage) -> Result<u32, DatabaseError> {
        let _gate = self.gate.read().await;
        count(
            &self.conn,
            "SELECT COUNT(*) FROM batches WHERE stage = ?1 AND status = 'processing'",
            params![stage.as_str()],
        )
        .await
    }

    async fn reconcile_orphans(&self, stage: Stage) -> Result<Vec<Batch>, DatabaseError> {
        let _gate = self.gate.read().await;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.options.orphan_lease)
                .unwrap_or_else(|_| chrono::Duration::days(3650));
        let live = self.live_owners(cutoff).await?;

        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {BATCH_COLUMNS} FROM batches
                     WHERE stage = ?1 AND status = 'processing' AND owner_id IS NOT ?2
                     ORDER BY seq"
                ),
                params![stage.as_str(), self.owner_id.to_string()],
            )
            .await
            .map_err(|e| query_error("reconcile_orphans", e))?;
        let orphans = collect_batches(rows)
            .await?
            .into_iter()
            .filter(|b| b.owner_id.is_none_or(|owner| !live.contains(&owner)))
            .collect();
        Ok(orphans)
    }

    async fn requeue_orphan(
        &self,
        orphan: &Batch,
        max_attempts: u32,
    ) -> Result<Option<Batch>, DatabaseError> {
        let _gate = self.gate.write().await;
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| query_error("requeue_orphan: begin", e))?;
        let applied = async {
            let now = Utc::now();
            let replacement = if orphan.attempt < max_attempts {
                Some(
                    insert_batch(
                        &tx,
                        orphan.run_id,
                        orphan.stage,
                        orphan.items.clone(),
                        orphan.attempt + 1,
                        Some(orphan.batch_id),
                        now,
                        now,
                    )
                    .await?,
                )
            } else {
                None
            };

            let owner = orphan.owner_id.map(|id| id.to_string());
            let reason = format!(
                "orphaned: owner {} presumed dead",
                owner.as_deref().unwrap_or("unknown")
            );
            let requeued = replacement.as_ref().map(|b| b.batch_id.to_string());
            let updated = tx
                .execute(
                    "UPDATE batches SET status = 'failed', completed_at = ?3, requeued_as = ?4,
                         last_error = ?5
                     WHERE batch_id = ?1 AND status = 'processing' AND owner_id IS ?2",
                    params![
                        orphan.batch_id.to_string(),
                        opt_text(owner.as_deref()),
                        ts(now),
                        opt_text(requeued.as_deref()),
                        reason.as_str()
                    ],
                )
                .await
                .map_err(|e| query_error("requeue_orphan", e))?;
            if updated == 0 {
                return Err(conflict(
                    orphan.batch_id,
                    "orphan already settled by another owner".into(),
                ));
            }

            let event = if replacement.is_some() {
                "orphan_requeued"
            } else {
                "orphan_abandoned"
            };
            let detail = format!("batch {} attempt {}", orphan.batch_id, orphan.attempt);
            insert_history(&tx, orphan.run_id, event, Some(orphan.stage), Some(&detail)).await?;
            Ok(replacement)
        }
        .await;

        match applied {
            Ok(replacement) => {
                tx.commit()
                    .await
                    .map_err(|e| query_error("requeue_orphan: commit", e))?;
                Ok(replacement)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    // ── Entities ────────────────────────────────────────────────────

    async fn list_stage_outputs(
        &self,
        run_id: Uuid,
        stage: Stage,
    ) -> Result<Vec<String>, DatabaseError> {
        let _gate = self.gate.read().await;
        let mut rows = self
            .conn
            .query(
                "SELECT entity_key FROM stage_outputs WHERE run_id = ?1 AND stage = ?2
                 ORDER BY rowid",
                params![run_id.to_string(), stage.as_str()],
            )
            .await
            .map_err(|e| query_error("list_stage_outputs", e))?;
        let mut keys = Vec::new();
        while let Some(row) = rows.next().await.map_err(decode_error)? {
            keys.push(row.get(0).map_err(decode_error)?);
        }
        Ok(keys)
    }

    async fn get_entity(&self, key: &str) -> Result<Option<Entity>, DatabaseError> {
        let _gate = self.gate.read().await;
        fetch_entity(&self.conn, key).await
    }

    async fn count_entities(&self, kind: EntityKind) -> Result<u32, DatabaseError> {
        let _gate = self.gate.read().await;
        count(
            &self.conn,
            "SELECT COUNT(*) FROM entities WHERE kind = ?1",
            params![kind.as_str()],
        )
        .await
    }

    async fn list_classified_entities(
        &self,
        kind: EntityKind,
    ) -> Result<Vec<ClassifiedEntity>, DatabaseError> {
        let _gate = self.gate.read().await;

        let mut rows = self
            .conn
            .query(
                "SELECT c.entity_key, c.scheme, c.category, c.confidence, c.created_at,
                        c.superseded_at
                 FROM classifications c JOIN entities e ON e.canonical_key = c.entity_key
                 WHERE e.kind = ?1 AND c.superseded_at IS NULL
                 ORDER BY c.scheme",
                params![kind.as_str()],
            )
            .await
            .map_err(|e| query_error("list_classified_entities", e))?;
        let mut current: HashMap<String, Vec<Classification>> = HashMap::new();
        while let Some(row) = rows.next().await.map_err(decode_error)? {
            let c = row_to_classification(&row)?;
            current.entry(c.entity_key.clone()).or_default().push(c);
        }

        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ENTITY_COLUMNS} FROM entities WHERE kind = ?1
                     ORDER BY canonical_key"
                ),
                params![kind.as_str()],
            )
            .await
            .map_err(|e| query_error("list_classified_entities", e))?;
        let mut entities = Vec::new();
        while let Some(row) = rows.next().await.map_err(decode_error)? {
            let entity = row_to_entity(&row)?;
            let classifications = current.remove(&entity.canonical_key).unwrap_or_default();
            entities.push(ClassifiedEntity {
                entity,
                classifications,
            });
        }
        Ok(entities)
    }

    async fn classification_history(
        &self,
        key: &str,
    ) -> Result<Vec<Classification>, DatabaseError> {
        let _gate = self.gate.read().await;
        let mut rows = self
            .conn
            .query(
                "SELECT entity_key, scheme, category, confidence, created_at, superseded_at
                 FROM classifications WHERE entity_key = ?1 ORDER BY rowid",
                params![key],
            )
            .await
            .map_err(|e| query_error("classification_history", e))?;
        let mut history = Vec::new();
        while let Some(row) = rows.next().await.map_err(decode_error)? {
            history.push(row_to_classification(&row)?);
        }
        Ok(history)
    }

    // ── Maintenance ─────────────────────────────────────────────────

    async fn reset_pipeline_state(&self) -> Result<(), DatabaseError> {
        let _gate = self.gate.write().await;
        let now = now_ts();
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| query_error("reset_pipeline_state: begin", e))?;
        let applied = async {
            for sql in [
                "DELETE FROM batches",
                "DELETE FROM stage_outputs",
                "DELETE FROM stage_admissions",
            ] {
                tx.execute(sql, ())
                    .await
                    .map_err(|e| query_error("reset_pipeline_state", e))?;
            }
            tx.execute(
                "DELETE FROM settings WHERE key = ?1",
                params![INGEST_CURSOR_KEY],
            )
            .await
            .map_err(|e| query_error("reset_pipeline_state", e))?;
            tx.execute(
                "UPDATE runs SET phase = 'error', finished_at = ?1,
                     last_error = COALESCE(last_error, 'pipeline state reset')
                 WHERE finished_at IS NULL",
                params![now.as_str()],
            )
            .await
            .map_err(|e| query_error("reset_pipeline_state", e))?;
            Ok::<(), DatabaseError>(())
        }
        .await;

        match applied {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(|e| query_error("reset_pipeline_state: commit", e))?;
                warn!("Pipeline state reset");
                Ok(())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::pipeline::types::{ItemOutcome, RetryKind, WorkItem};

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn work(id: &str) -> QueueItem {
        QueueItem::Work(WorkItem::new(
            id,
            "test",
            json!({ "subject": id }),
            Utc::now(),
        ))
    }

    fn repo(key: &str) -> EntityWrite {
        EntityWrite::mention(key, EntityKind::Repository, json!({ "url": key }), 1, Utc::now())
    }

    fn no_requeue_delay() -> StoreOptions {
        StoreOptions {
            requeue_delay: Duration::ZERO,
            ..StoreOptions::default()
        }
    }

    // ── Runs ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn run_lifecycle_records_history() {
        let db = test_db().await;
        let run = db.create_run().await.unwrap();
        assert_eq!(db.active_run().await.unwrap().unwrap().run_id, run.run_id);

        db.set_run_phase(run.run_id, RunPhase::Extract, None)
            .await
            .unwrap();
        let err = db
            .set_run_phase(run.run_id, RunPhase::Ingest, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Validation(_)));

        db.set_run_phase(run.run_id, RunPhase::Error, Some("boom"))
            .await
            .unwrap();
        let stored = db.get_run(run.run_id).await.unwrap().unwrap();
        assert!(stored.is_finished());
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
        assert!(db.active_run().await.unwrap().is_none());

        let events: Vec<String> = db
            .run_history(run.run_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(events, vec!["run_started", "phase_changed", "phase_changed"]);
    }

    // ── Batches ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn duplicate_work_items_merge_instead_of_batching() {
        let db = test_db().await;
        let run = db.create_run().await.unwrap();

        let batches = db
            .create_batches(NewBatches {
                run_id: run.run_id,
                stage: Stage::Ingest,
                chunks: vec![vec![work("a"), work("a")], vec![work("b")]],
                source_cursor: Some("cursor-1".into()),
            })
            .await
            .unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].items, vec!["a"]);
        assert_eq!(batches[1].items, vec!["b"]);
        assert_eq!(db.ingest_cursor().await.unwrap().as_deref(), Some("cursor-1"));
        assert!(db.is_stage_admitted(run.run_id, Stage::Ingest).await.unwrap());

        let claimed = db.claim_next_batch(Stage::Ingest).await.unwrap().unwrap();
        let items = db.load_items(&claimed).await.unwrap();
        assert_eq!(items[0].mentions, 2);
    }

    #[tokio::test]
    async fn stage_admission_happens_once() {
        let db = test_db().await;
        let run = db.create_run().await.unwrap();
        let new = NewBatches {
            run_id: run.run_id,
            stage: Stage::Extract,
            chunks: vec![vec![QueueItem::Entity("n1".into())]],
            source_cursor: None,
        };
        db.create_batches(new.clone()).await.unwrap();
        let err = db.create_batches(new).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict { .. }));
        assert_eq!(db.peek_depth(Stage::Extract).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn claim_is_exclusive_and_ordered() {
        let db = test_db().await;
        let run = db.create_run().await.unwrap();
        let first = db
            .create_batch(run.run_id, Stage::Ingest, vec![work("a")])
            .await
            .unwrap()
            .unwrap();
        let second = db
            .create_batch(run.run_id, Stage::Ingest, vec![work("b")])
            .await
            .unwrap()
            .unwrap();

        let c1 = db.claim_next_batch(Stage::Ingest).await.unwrap().unwrap();
        let c2 = db.claim_next_batch(Stage::Ingest).await.unwrap().unwrap();
        assert_eq!(c1.batch_id, first.batch_id);
        assert_eq!(c2.batch_id, second.batch_id);
        assert_eq!(c1.status, BatchStatus::Processing);
        assert_eq!(c1.owner_id, Some(db.owner_id()));
        assert!(db.claim_next_batch(Stage::Ingest).await.unwrap().is_none());
        assert!(db.claim_next_batch(Stage::Extract).await.unwrap().is_none());
        assert_eq!(db.processing_count(Stage::Ingest).await.unwrap(), 2);
        assert_eq!(db.peek_depth(Stage::Ingest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn commit_applies_writes_and_outputs() {
        let db = test_db().await;
        let run = db.create_run().await.unwrap();
        db.create_batch(run.run_id, Stage::Ingest, vec![work("n1"), work("n2")])
            .await
            .unwrap();
        let batch = db.claim_next_batch(Stage::Ingest).await.unwrap().unwrap();

        let outcome = BatchOutcome::new(vec![
            ItemOutcome::succeeded(
                "n1",
                vec![EntityWrite::mention(
                    "n1",
                    EntityKind::Newsletter,
                    json!({ "subject": "hello" }),
                    1,
                    Utc::now(),
                )],
            ),
            ItemOutcome::skipped("n2", "empty body"),
        ]);
        let commit = db.commit_batch_result(batch.batch_id, outcome).await.unwrap();
        assert_eq!(commit.status, BatchStatus::Completed);
        assert_eq!(commit.succeeded, 1);
        assert_eq!(commit.skipped.len(), 1);

        let entity = db.get_entity("n1").await.unwrap().unwrap();
        assert_eq!(entity.kind, EntityKind::Newsletter);
        assert_eq!(entity.mention_count, 1);
        assert_eq!(
            db.list_stage_outputs(run.run_id, Stage::Ingest).await.unwrap(),
            vec!["n1"]
        );

        let stored = db.get_batch(batch.batch_id).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Completed);
        assert!(stored.completed_at.is_some());

        let summary = db.stage_summary(run.run_id, Stage::Ingest).await.unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.items_succeeded, 1);
        assert_eq!(summary.items_skipped, 1);
    }

    #[tokio::test]
    async fn commit_twice_is_a_conflict() {
        let db = test_db().await;
        let run = db.create_run().await.unwrap();
        db.create_batch(run.run_id, Stage::Extract, vec![QueueItem::Entity("x".into())])
            .await
            .unwrap();
        let batch = db.claim_next_batch(Stage::Extract).await.unwrap().unwrap();
        let outcome = BatchOutcome::new(vec![ItemOutcome::succeeded("x", vec![])]);
        db.commit_batch_result(batch.batch_id, outcome.clone())
            .await
            .unwrap();

        let err = db
            .commit_batch_result(batch.batch_id, outcome)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict { .. }));
    }

    #[tokio::test]
    async fn invalid_write_fails_batch_without_partial_writes() {
        let db = test_db().await;
        let run = db.create_run().await.unwrap();
        db.create_batch(
            run.run_id,
            Stage::Extract,
            vec![QueueItem::Entity("n1".into()), QueueItem::Entity("n2".into())],
        )
        .await
        .unwrap();
        let batch = db.claim_next_batch(Stage::Extract).await.unwrap().unwrap();

        let outcome = BatchOutcome::new(vec![
            ItemOutcome::succeeded("n1", vec![repo("https://github.com/a/good")]),
            // An update without kind on an unknown entity is only caught in the transaction.
            ItemOutcome::succeeded("n2", vec![EntityWrite::update("https://github.com/a/ghost")]),
        ]);
        let commit = db.commit_batch_result(batch.batch_id, outcome).await.unwrap();
        assert_eq!(commit.status, BatchStatus::Failed);
        assert!(commit.requeued.is_none());
        assert!(db.get_entity("https://github.com/a/good").await.unwrap().is_none());
        assert!(
            db.list_stage_outputs(run.run_id, Stage::Extract)
                .await
                .unwrap()
                .is_empty()
        );
        let stored = db.get_batch(batch.batch_id).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Failed);
        assert!(stored.last_error.unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn retryable_items_move_to_a_child_batch() {
        let db = test_db().await.with_options(no_requeue_delay());
        let run = db.create_run().await.unwrap();
        db.create_batch(
            run.run_id,
            Stage::Extract,
            vec![QueueItem::Entity("a".into()), QueueItem::Entity("b".into())],
        )
        .await
        .unwrap();
        let batch = db.claim_next_batch(Stage::Extract).await.unwrap().unwrap();

        let outcome = BatchOutcome::new(vec![
            ItemOutcome::succeeded("a", vec![]),
            ItemOutcome {
                key: "b".into(),
                result: ItemResult::Retry {
                    kind: RetryKind::Transient,
                    reason: "timeout".into(),
                    retry_after: None,
                },
            },
        ]);
        let commit = db.commit_batch_result(batch.batch_id, outcome).await.unwrap();
        assert_eq!(commit.status, BatchStatus::Completed);
        let child = commit.requeued.unwrap();
        assert_eq!(child.items, vec!["b"]);
        assert_eq!(child.attempt, 2);
        assert_eq!(child.parent_batch_id, Some(batch.batch_id));

        let claimed = db.claim_next_batch(Stage::Extract).await.unwrap().unwrap();
        assert_eq!(claimed.batch_id, child.batch_id);
    }

    #[tokio::test]
    async fn retry_after_delays_the_child_batch() {
        let db = test_db().await.with_options(no_requeue_delay());
        let run = db.create_run().await.unwrap();
        db.create_batch(run.run_id, Stage::Classify, vec![QueueItem::Entity("a".into())])
            .await
            .unwrap();
        let batch = db.claim_next_batch(Stage::Classify).await.unwrap().unwrap();

        let outcome = BatchOutcome::new(vec![ItemOutcome {
            key: "a".into(),
            result: ItemResult::Retry {
                kind: RetryKind::RateLimited,
                reason: "quota".into(),
                retry_after: Some(Duration::from_secs(60)),
            },
        }]);
        let commit = db.commit_batch_result(batch.batch_id, outcome).await.unwrap();
        assert_eq!(commit.status, BatchStatus::Failed);
        assert!(commit.requeued.is_some());

        assert_eq!(db.peek_depth(Stage::Classify).await.unwrap(), 1);
        assert!(db.claim_next_batch(Stage::Classify).await.unwrap().is_none());

        let summary = db.stage_summary(run.run_id, Stage::Classify).await.unwrap();
        assert_eq!(summary.retried, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.pending, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_become_skips() {
        let db = test_db().await.with_options(StoreOptions {
            max_item_attempts: 1,
            ..no_requeue_delay()
        });
        let run = db.create_run().await.unwrap();
        db.create_batch(run.run_id, Stage::Classify, vec![QueueItem::Entity("a".into())])
            .await
            .unwrap();
        let batch = db.claim_next_batch(Stage::Classify).await.unwrap().unwrap();
        let outcome = BatchOutcome::new(vec![ItemOutcome {
            key: "a".into(),
            result: ItemResult::Retry {
                kind: RetryKind::Transient,
                reason: "502".into(),
                retry_after: None,
            },
        }]);
        let commit = db.commit_batch_result(batch.batch_id, outcome).await.unwrap();
        assert_eq!(commit.status, BatchStatus::Failed);
        assert!(commit.requeued.is_none());
        assert!(commit.skipped[0].reason.starts_with("attempts exhausted"));
    }

    #[tokio::test]
    async fn rate_limited_items_do_not_spend_attempts() {
        let db = test_db().await.with_options(StoreOptions {
            max_item_attempts: 1,
            ..no_requeue_delay()
        });
        let run = db.create_run().await.unwrap();
        db.create_batch(run.run_id, Stage::Classify, vec![QueueItem::Entity("a".into())])
            .await
            .unwrap();
        let batch = db.claim_next_batch(Stage::Classify).await.unwrap().unwrap();
        let outcome = BatchOutcome::new(vec![ItemOutcome {
            key: "a".into(),
            result: ItemResult::Retry {
                kind: RetryKind::RateLimited,
                reason: "quota".into(),
                retry_after: None,
            },
        }]);
        let commit = db.commit_batch_result(batch.batch_id, outcome).await.unwrap();
        assert!(commit.skipped.is_empty());
        let child = commit.requeued.unwrap();
        assert_eq!(child.items, vec!["a"]);
        assert_eq!(child.attempt, 1);

        let summary = db.stage_summary(run.run_id, Stage::Classify).await.unwrap();
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.retried, 1);
        assert_eq!(summary.failure_ratio(), 0.0);
    }

    #[tokio::test]
    async fn transient_retry_advances_the_child_attempt() {
        let db = test_db().await.with_options(no_requeue_delay());
        let run = db.create_run().await.unwrap();
        db.create_batch(
            run.run_id,
            Stage::Classify,
            vec![QueueItem::Entity("a".into()), QueueItem::Entity("b".into())],
        )
        .await
        .unwrap();
        let batch = db.claim_next_batch(Stage::Classify).await.unwrap().unwrap();
        let outcome = BatchOutcome::new(vec![
            ItemOutcome {
                key: "a".into(),
                result: ItemResult::Retry {
                    kind: RetryKind::RateLimited,
                    reason: "quota".into(),
                    retry_after: None,
                },
            },
            ItemOutcome {
                key: "b".into(),
                result: ItemResult::Retry {
                    kind: RetryKind::Transient,
                    reason: "502".into(),
                    retry_after: None,
                },
            },
        ]);
        let commit = db.commit_batch_result(batch.batch_id, outcome).await.unwrap();
        let child = commit.requeued.unwrap();
        assert_eq!(child.items, vec!["a", "b"]);
        assert_eq!(child.attempt, 2);
    }

    // ── Entities ────────────────────────────────────────────────────

    #[tokio::test]
    async fn repeated_mentions_merge_payload_and_count() {
        let db = test_db().await;
        let run = db.create_run().await.unwrap();
        let key = "https://github.com/tokio-rs/tokio";

        for payload in [json!({ "url": key }), json!({ "stars": 10 })] {
            db.create_batch(run.run_id, Stage::Extract, vec![QueueItem::Entity("n".into())])
                .await
                .unwrap();
            let batch = db.claim_next_batch(Stage::Extract).await.unwrap().unwrap();
            let write =
                EntityWrite::mention(key, EntityKind::Repository, payload, 1, Utc::now());
            db.commit_batch_result(
                batch.batch_id,
                BatchOutcome::new(vec![ItemOutcome::succeeded("n", vec![write])]),
            )
            .await
            .unwrap();
        }

        let entity = db.get_entity(key).await.unwrap().unwrap();
        assert_eq!(entity.mention_count, 2);
        assert_eq!(entity.payload["url"], key);
        assert_eq!(entity.payload["stars"], 10);
        assert_eq!(db.count_entities(EntityKind::Repository).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn classifications_supersede_within_scheme() {
        let db = test_db().await;
        let run = db.create_run().await.unwrap();
        let key = "https://github.com/a/b";

        for category in ["cli", "web"] {
            db.create_batch(run.run_id, Stage::Classify, vec![QueueItem::Entity(key.into())])
                .await
                .unwrap();
            let batch = db.claim_next_batch(Stage::Classify).await.unwrap().unwrap();
            let write = repo(key).with_classifications(vec![
                Classification::new(key, "topic", category, 0.8),
                Classification::new(key, "language", "rust", 0.9),
            ]);
            db.commit_batch_result(
                batch.batch_id,
                BatchOutcome::new(vec![ItemOutcome::succeeded(key, vec![write])]),
            )
            .await
            .unwrap();
        }

        let history = db.classification_history(key).await.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history.iter().filter(|c| c.is_current()).count(), 2);

        let listed = db
            .list_classified_entities(EntityKind::Repository)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        let topic = listed[0]
            .classifications
            .iter()
            .find(|c| c.scheme == "topic")
            .unwrap();
        assert_eq!(topic.category, "web");
    }

    // ── Recovery ────────────────────────────────────────────────────

    #[tokio::test]
    async fn crash_between_writes_and_commit_leaves_nothing_visible() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("curator.db");
        let key = "https://github.com/a/partial";

        let (run_id, batch_id) = {
            let crashed = LibSqlBackend::new_local(&path).await.unwrap();
            let run = crashed.create_run().await.unwrap();
            crashed
                .create_batch(run.run_id, Stage::Extract, vec![QueueItem::Entity("n".into())])
                .await
                .unwrap();
            let batch = crashed
                .claim_next_batch(Stage::Extract)
                .await
                .unwrap()
                .unwrap();

            // Apply the writes inside a transaction, then die before commit.
            let tx = crashed.conn.transaction().await.unwrap();
            tx.execute(
                "INSERT INTO entities (canonical_key, kind, first_seen, last_seen, updated_at)
                 VALUES (?1, 'repository', 't', 't', 't')",
                params![key],
            )
            .await
            .unwrap();
            drop(tx);
            (run.run_id, batch.batch_id)
        };

        let recovered = LibSqlBackend::new_local(&path)
            .await
            .unwrap()
            .with_options(StoreOptions {
                orphan_lease: Duration::ZERO,
                ..StoreOptions::default()
            });
        assert!(recovered.get_entity(key).await.unwrap().is_none());

        let orphans = recovered.reconcile_orphans(Stage::Extract).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].batch_id, batch_id);

        let replacement = recovered
            .requeue_orphan(&orphans[0], 5)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replacement.attempt, 2);
        assert_eq!(replacement.items, orphans[0].items);
        assert_eq!(replacement.run_id, run_id);

        let old = recovered.get_batch(batch_id).await.unwrap().unwrap();
        assert_eq!(old.status, BatchStatus::Failed);
        assert_eq!(old.requeued_as, Some(replacement.batch_id));
    }

    #[tokio::test]
    async fn live_owners_are_not_orphans() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("curator.db");

        let worker = LibSqlBackend::new_local(&path).await.unwrap();
        let run = worker.create_run().await.unwrap();
        worker
            .create_batch(run.run_id, Stage::Extract, vec![QueueItem::Entity("n".into())])
            .await
            .unwrap();
        worker.claim_next_batch(Stage::Extract).await.unwrap().unwrap();

        let observer = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(observer.reconcile_orphans(Stage::Extract).await.unwrap().is_empty());
        // Own batches are never orphans.
        assert!(worker.reconcile_orphans(Stage::Extract).await.unwrap().is_empty());

        worker.release().await.unwrap();
        assert_eq!(
            observer.reconcile_orphans(Stage::Extract).await.unwrap().len(),
            1
        );
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn dead_process_orphans_before_its_lease_expires() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("curator.db");

        let worker = LibSqlBackend::new_local(&path).await.unwrap();
        let run = worker.create_run().await.unwrap();
        worker
            .create_batch(run.run_id, Stage::Extract, vec![QueueItem::Entity("n".into())])
            .await
            .unwrap();
        worker.claim_next_batch(Stage::Extract).await.unwrap().unwrap();
        // Heartbeat stays fresh, but no process holds this pid.
        worker
            .conn
            .execute(
                "UPDATE owners SET pid = 4294967295 WHERE owner_id = ?1",
                params![worker.owner_id.to_string()],
            )
            .await
            .unwrap();

        let observer = LibSqlBackend::new_local(&path).await.unwrap();
        let orphans = observer.reconcile_orphans(Stage::Extract).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].owner_id, Some(worker.owner_id));
    }

    #[tokio::test]
    async fn orphan_at_attempt_cap_is_abandoned() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("curator.db");

        let first = LibSqlBackend::new_local(&path).await.unwrap();
        let run = first.create_run().await.unwrap();
        first
            .create_batch(run.run_id, Stage::Classify, vec![QueueItem::Entity("r".into())])
            .await
            .unwrap();
        first.claim_next_batch(Stage::Classify).await.unwrap().unwrap();
        first.release().await.unwrap();

        let second = LibSqlBackend::new_local(&path).await.unwrap();
        let orphans = second.reconcile_orphans(Stage::Classify).await.unwrap();
        assert!(second.requeue_orphan(&orphans[0], 1).await.unwrap().is_none());
        assert_eq!(second.peek_depth(Stage::Classify).await.unwrap(), 0);

        let summary = second.stage_summary(run.run_id, Stage::Classify).await.unwrap();
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn reset_clears_batches_but_keeps_entities() {
        let db = test_db().await;
        let run = db.create_run().await.unwrap();
        db.create_batches(NewBatches {
            run_id: run.run_id,
            stage: Stage::Ingest,
            chunks: vec![vec![work("a")]],
            source_cursor: Some("c".into()),
        })
        .await
        .unwrap();
        let batch = db.claim_next_batch(Stage::Ingest).await.unwrap().unwrap();
        db.commit_batch_result(
            batch.batch_id,
            BatchOutcome::new(vec![ItemOutcome::succeeded(
                "a",
                vec![EntityWrite::mention(
                    "a",
                    EntityKind::Newsletter,
                    json!({}),
                    1,
                    Utc::now(),
                )],
            )]),
        )
        .await
        .unwrap();

        db.reset_pipeline_state().await.unwrap();

        assert!(db.get_batch(batch.batch_id).await.unwrap().is_none());
        assert!(db.ingest_cursor().await.unwrap().is_none());
        assert!(db.active_run().await.unwrap().is_none());
        assert!(db.get_entity("a").await.unwrap().is_some());
        let archived = db.get_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(archived.phase, RunPhase::Error);
    }
}
