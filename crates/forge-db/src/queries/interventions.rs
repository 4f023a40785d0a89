//! Database query functions for the `interventions` table.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::models::{Intervention, InterventionKind, InterventionStatus};

/// Fields for a new intervention.
#[derive(Debug, Clone)]
pub struct NewIntervention<'a> {
    pub id: &'a str,
    pub task_id: &'a str,
    pub kind: InterventionKind,
    pub requested_by: &'a str,
    pub reason: &'a str,
    pub params: &'a Value,
}

/// Insert a new intervention in `pending` status.
pub async fn insert_intervention(
    pool: &SqlitePool,
    new: &NewIntervention<'_>,
) -> Result<Intervention> {
    let intervention = sqlx::query_as::<_, Intervention>(
        "INSERT INTO interventions (id, task_id, kind, requested_by, reason, params, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(new.id)
    .bind(new.task_id)
    .bind(new.kind)
    .bind(new.requested_by)
    .bind(new.reason)
    .bind(serde_json::to_string(new.params)?)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to insert intervention")?;

    Ok(intervention)
}

/// Atomically drain all pending interventions for a task, marking them
/// `applied` and returning them for delivery (the heartbeat command
/// channel).
pub async fn drain_pending(
    pool: &SqlitePool,
    task_id: &str,
) -> Result<Vec<Intervention>> {
    let interventions = sqlx::query_as::<_, Intervention>(
        "UPDATE interventions \
         SET status = 'applied', applied_at = ? \
         WHERE task_id = ? AND status = 'pending' \
         RETURNING *",
    )
    .bind(Utc::now())
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to drain pending interventions")?;

    Ok(interventions)
}

/// Mark a single intervention's final status.
pub async fn set_status(
    pool: &SqlitePool,
    id: &str,
    status: InterventionStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE interventions SET status = ?, applied_at = ? WHERE id = ?",
    )
    .bind(status)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to set intervention status")?;

    Ok(result.rows_affected())
}

/// List interventions for a task, newest first.
pub async fn list_for_task(
    pool: &SqlitePool,
    task_id: &str,
) -> Result<Vec<Intervention>> {
    let interventions = sqlx::query_as::<_, Intervention>(
        "SELECT * FROM interventions WHERE task_id = ? ORDER BY created_at DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list interventions for task")?;

    Ok(interventions)
}

/// Count pending interventions across a project's tasks.
pub async fn count_pending_for_project(
    pool: &SqlitePool,
    project_id: &str,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM interventions i \
         JOIN tasks t ON t.id = i.task_id \
         WHERE t.project_id = ? AND i.status = 'pending'",
    )
    .bind(project_id)
    .fetch_one(pool)
    .await
    .context("failed to count pending interventions")?;

    Ok(row.0)
}
