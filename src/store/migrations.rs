//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially, so
//! opening an existing database is always safe.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS work_items (
                external_id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                payload TEXT NOT NULL,
                discovered_at TEXT NOT NULL,
                mentions INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entities (
                canonical_key TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                mention_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'active',
                vector_ref TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_entities_kind ON entities(kind);
            CREATE INDEX IF NOT EXISTS idx_entities_status ON entities(status);

            CREATE TABLE IF NOT EXISTS classifications (
                id TEXT PRIMARY KEY,
                entity_key TEXT NOT NULL REFERENCES entities(canonical_key),
                scheme TEXT NOT NULL,
                category TEXT NOT NULL,
                confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
                created_at TEXT NOT NULL,
                superseded_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_classifications_entity
                ON classifications(entity_key);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_classifications_current
                ON classifications(entity_key, scheme) WHERE superseded_at IS NULL;

            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                phase TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                last_error TEXT
            );

            CREATE TABLE IF NOT EXISTS batches (
                batch_id TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                run_id TEXT NOT NULL REFERENCES runs(run_id),
                stage TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                items TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 1,
                parent_batch_id TEXT,
                requeued_as TEXT,
                owner_id TEXT,
                created_at TEXT NOT NULL,
                available_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                succeeded INTEGER NOT NULL DEFAULT 0,
                skipped TEXT NOT NULL DEFAULT '[]',
                last_error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_batches_stage_status ON batches(stage, status);
            CREATE INDEX IF NOT EXISTS idx_batches_run ON batches(run_id);

            CREATE TABLE IF NOT EXISTS run_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                event TEXT NOT NULL,
                stage TEXT,
                detail TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_run_history_run ON run_history(run_id);
        "#,
    },
    Migration {
        version: 2,
        name: "stage_bookkeeping",
        sql: r#"
            CREATE TABLE IF NOT EXISTS stage_outputs (
                run_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                entity_key TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (run_id, stage, entity_key)
            );

            CREATE TABLE IF NOT EXISTS stage_admissions (
                run_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                batch_count INTEGER NOT NULL,
                admitted_at TEXT NOT NULL,
                PRIMARY KEY (run_id, stage)
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 3,
        name: "owner_heartbeats",
        sql: r#"
            CREATE TABLE IF NOT EXISTS owners (
                owner_id TEXT PRIMARY KEY,
                pid INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                heartbeat_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_batches_owner ON batches(owner_id);
        "#,
    },
    Migration {
        version: 4,
        name: "owner_boot_id",
        sql: r#"
            ALTER TABLE owners ADD COLUMN boot_id TEXT;
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!(
        version = get_current_version(conn).await?,
        "Database migrations complete"
    );
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
