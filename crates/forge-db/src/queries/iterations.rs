//! Database query functions for the `iterations` table (agent-replicated
//! iteration records).

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::IterationRow;

/// Upsert a replicated iteration record. Agents may re-deliver the same
/// sequence number after a retry; the last write wins.
pub async fn upsert_iteration(pool: &SqlitePool, row: &IterationRow) -> Result<()> {
    sqlx::query(
        "INSERT INTO iterations (task_id, seq, started_at, ended_at, duration_ms, \
                                 token_estimate, outcome, summary, criteria, files_changed) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(task_id, seq) DO UPDATE SET \
             started_at = excluded.started_at, \
             ended_at = excluded.ended_at, \
             duration_ms = excluded.duration_ms, \
             token_estimate = excluded.token_estimate, \
             outcome = excluded.outcome, \
             summary = excluded.summary, \
             criteria = excluded.criteria, \
             files_changed = excluded.files_changed",
    )
    .bind(&row.task_id)
    .bind(row.seq)
    .bind(row.started_at)
    .bind(row.ended_at)
    .bind(row.duration_ms)
    .bind(row.token_estimate)
    .bind(row.outcome)
    .bind(&row.summary)
    .bind(serde_json::to_string(&row.criteria.0)?)
    .bind(serde_json::to_string(&row.files_changed.0)?)
    .execute(pool)
    .await
    .context("failed to upsert iteration record")?;

    Ok(())
}

/// List all iteration records for a task, in sequence order.
pub async fn list_for_task(pool: &SqlitePool, task_id: &str) -> Result<Vec<IterationRow>> {
    let rows = sqlx::query_as::<_, IterationRow>(
        "SELECT * FROM iterations WHERE task_id = ? ORDER BY seq ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list iterations for task")?;

    Ok(rows)
}
