use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;

use crate::config::DbConfig;

/// Embedded schema, applied idempotently at pool creation.
///
/// Every statement is `IF NOT EXISTS` so re-running against an existing
/// database is a no-op.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id               TEXT PRIMARY KEY,
    name             TEXT NOT NULL,
    path             TEXT NOT NULL,
    created_at       TEXT NOT NULL,
    last_activity_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id              TEXT PRIMARY KEY,
    project_id      TEXT NOT NULL REFERENCES projects(id),
    name            TEXT NOT NULL,
    prompt          TEXT NOT NULL,
    priority        INTEGER NOT NULL DEFAULT 0,
    status          TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending','queued','blocked','running','paused',
                          'completed','failed','aborted','stuck','skipped')),
    sync_version    INTEGER NOT NULL DEFAULT 1,
    locked_by       TEXT,
    locked_at       TEXT,
    lock_expires_at TEXT,
    iteration       INTEGER NOT NULL DEFAULT 0,
    started_at      TEXT,
    completed_at    TEXT,
    config          TEXT NOT NULL DEFAULT '{}',
    result          TEXT,
    created_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_project_status
    ON tasks(project_id, status);
CREATE INDEX IF NOT EXISTS idx_tasks_queue_order
    ON tasks(project_id, status, priority, created_at);

CREATE TABLE IF NOT EXISTS task_dependencies (
    task_id    TEXT NOT NULL REFERENCES tasks(id),
    depends_on TEXT NOT NULL REFERENCES tasks(id),
    PRIMARY KEY (task_id, depends_on)
);

CREATE TABLE IF NOT EXISTS nodes (
    id            TEXT PRIMARY KEY,
    project_id    TEXT NOT NULL REFERENCES projects(id),
    node_type     TEXT NOT NULL
        CHECK (node_type IN ('plugin','dashboard','cli')),
    display_name  TEXT,
    capabilities  TEXT NOT NULL DEFAULT '[]',
    registered_at TEXT NOT NULL,
    last_seen_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_nodes_project ON nodes(project_id);

CREATE TABLE IF NOT EXISTS interventions (
    id           TEXT PRIMARY KEY,
    task_id      TEXT NOT NULL REFERENCES tasks(id),
    kind         TEXT NOT NULL
        CHECK (kind IN ('pause','abort','release_lock','force_status','retry')),
    requested_by TEXT NOT NULL,
    reason       TEXT NOT NULL,
    params       TEXT NOT NULL DEFAULT '{}',
    status       TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending','applied','rejected')),
    created_at   TEXT NOT NULL,
    applied_at   TEXT
);

CREATE INDEX IF NOT EXISTS idx_interventions_task_status
    ON interventions(task_id, status);

CREATE TABLE IF NOT EXISTS sync_log (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id    TEXT NOT NULL,
    task_id       TEXT,
    node_id       TEXT,
    operation     TEXT NOT NULL,
    old_value     TEXT,
    new_value     TEXT,
    logical_clock INTEGER NOT NULL,
    recorded_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_log_project ON sync_log(project_id, id);

CREATE TABLE IF NOT EXISTS iterations (
    task_id        TEXT NOT NULL REFERENCES tasks(id),
    seq            INTEGER NOT NULL,
    started_at     TEXT NOT NULL,
    ended_at       TEXT NOT NULL,
    duration_ms    INTEGER NOT NULL,
    token_estimate INTEGER NOT NULL,
    outcome        TEXT NOT NULL
        CHECK (outcome IN ('progress','stuck','error','gate-failed')),
    summary        TEXT NOT NULL,
    criteria       TEXT NOT NULL DEFAULT '[]',
    files_changed  TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (task_id, seq)
);
"#;

/// Create a connection pool with sensible defaults and the schema applied.
///
/// The database file is created when missing; WAL journaling keeps
/// concurrent readers off the writers' backs.
pub async fn create_pool(config: &DbConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(&config.db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .with_context(|| {
            format!("failed to open database at {}", config.db_path.display())
        })?;

    init_schema(&pool).await?;
    Ok(pool)
}

/// Apply the embedded schema to an existing pool.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .context("failed to apply database schema")?;
    info!("database schema applied");
    Ok(())
}
