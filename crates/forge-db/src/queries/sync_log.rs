//! Database query functions for the append-only `sync_log` table.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::models::SyncLogEntry;

/// Fields for a new sync-log record.
#[derive(Debug, Clone)]
pub struct NewSyncLogEntry<'a> {
    pub project_id: &'a str,
    pub task_id: Option<&'a str>,
    pub node_id: Option<&'a str>,
    pub operation: &'a str,
    pub old_value: Option<&'a Value>,
    pub new_value: Option<&'a Value>,
    pub logical_clock: i64,
}

/// Append a record to the sync log.
pub async fn append(pool: &SqlitePool, new: &NewSyncLogEntry<'_>) -> Result<i64> {
    let old_json = new.old_value.map(serde_json::to_string).transpose()?;
    let new_json = new.new_value.map(serde_json::to_string).transpose()?;

    let row: (i64,) = sqlx::query_as(
        "INSERT INTO sync_log (project_id, task_id, node_id, operation, \
                               old_value, new_value, logical_clock, recorded_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         RETURNING id",
    )
    .bind(new.project_id)
    .bind(new.task_id)
    .bind(new.node_id)
    .bind(new.operation)
    .bind(old_json)
    .bind(new_json)
    .bind(new.logical_clock)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to append sync log entry")?;

    Ok(row.0)
}

/// Read the tail of a project's sync log, newest first.
pub async fn tail(
    pool: &SqlitePool,
    project_id: &str,
    limit: i64,
) -> Result<Vec<SyncLogEntry>> {
    let entries = sqlx::query_as::<_, SyncLogEntry>(
        "SELECT * FROM sync_log WHERE project_id = ? ORDER BY id DESC LIMIT ?",
    )
    .bind(project_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to read sync log tail")?;

    Ok(entries)
}

/// The highest logical-clock value recorded so far (0 for an empty log).
/// Used to seed the in-memory clock at startup.
pub async fn max_logical_clock(pool: &SqlitePool) -> Result<i64> {
    let row: (Option<i64>,) =
        sqlx::query_as("SELECT MAX(logical_clock) FROM sync_log")
            .fetch_one(pool)
            .await
            .context("failed to read max logical clock")?;

    Ok(row.0.unwrap_or(0))
}
