//! Database query functions for the `tasks` and `task_dependencies` tables.
//!
//! All mutations are conditional UPDATEs: the WHERE clause pins the expected
//! status, version, or lock owner, and callers treat `rows_affected == 0` as
//! a lost race. `sync_version` increments by one on every authoritative
//! mutation.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use crate::models::{Task, TaskStatus};

/// Fields for a new task row.
#[derive(Debug, Clone)]
pub struct NewTask<'a> {
    pub id: &'a str,
    pub project_id: &'a str,
    pub name: &'a str,
    pub prompt: &'a str,
    pub priority: i64,
    pub config: &'a Value,
}

/// Insert a new task row. Returns the inserted task with server defaults
/// (status `pending`, version 1, iteration 0).
pub async fn insert_task(pool: &SqlitePool, new: &NewTask<'_>) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (id, project_id, name, prompt, priority, config, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(new.id)
    .bind(new.project_id)
    .bind(new.name)
    .bind(new.prompt)
    .bind(new.priority)
    .bind(serde_json::to_string(new.config)?)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &SqlitePool, id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks for a project, ordered by priority then creation time.
pub async fn list_tasks_for_project(
    pool: &SqlitePool,
    project_id: &str,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE project_id = ? \
         ORDER BY priority ASC, created_at ASC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for project")?;

    Ok(tasks)
}

// -----------------------------------------------------------------------
// State transitions
// -----------------------------------------------------------------------

/// Atomically transition a task from one status to another.
///
/// The WHERE clause includes `status = from`, so the row is only updated
/// when the current status matches. Bumps the sync version. Returns the
/// number of rows affected (0 means the status did not match).
pub async fn transition_status(
    pool: &SqlitePool,
    task_id: &str,
    from: TaskStatus,
    to: TaskStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = ?, \
             sync_version = sync_version + 1, \
             started_at = COALESCE(?, started_at), \
             completed_at = COALESCE(?, completed_at) \
         WHERE id = ? AND status = ?",
    )
    .bind(to)
    .bind(started_at)
    .bind(completed_at)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Apply an accepted push update, guarded by the server version the caller
/// read. Terminal statuses clear the lock and stamp `completed_at`.
#[allow(clippy::too_many_arguments)]
pub async fn apply_push(
    pool: &SqlitePool,
    task_id: &str,
    guard_version: i64,
    to: TaskStatus,
    result: Option<&Value>,
    iteration: Option<i64>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result_json = result.map(serde_json::to_string).transpose()?;

    let rows = if to.is_terminal() {
        sqlx::query(
            "UPDATE tasks \
             SET status = ?, \
                 sync_version = sync_version + 1, \
                 result = COALESCE(?, result), \
                 iteration = COALESCE(?, iteration), \
                 locked_by = NULL, locked_at = NULL, lock_expires_at = NULL, \
                 completed_at = ? \
             WHERE id = ? AND sync_version = ?",
        )
        .bind(to)
        .bind(result_json)
        .bind(iteration)
        .bind(now)
        .bind(task_id)
        .bind(guard_version)
        .execute(pool)
        .await
    } else {
        sqlx::query(
            "UPDATE tasks \
             SET status = ?, \
                 sync_version = sync_version + 1, \
                 result = COALESCE(?, result), \
                 iteration = COALESCE(?, iteration) \
             WHERE id = ? AND sync_version = ?",
        )
        .bind(to)
        .bind(result_json)
        .bind(iteration)
        .bind(task_id)
        .bind(guard_version)
        .execute(pool)
        .await
    }
    .context("failed to apply push update")?;

    Ok(rows.rows_affected())
}

// -----------------------------------------------------------------------
// Lock & lease
// -----------------------------------------------------------------------

/// Atomically claim a queued task for `node_id`.
///
/// The guard admits unlocked `queued` rows and rows whose lease has already
/// expired (`lock_expires_at <= now` steals at the expiry instant, including
/// a `running` row the sweeper has not reached yet). Transitions to
/// `running`, stamps the lock fields, and bumps the version. Callers must
/// re-read the row afterwards to confirm ownership.
pub async fn claim_task(
    pool: &SqlitePool,
    task_id: &str,
    node_id: &str,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET locked_by = ?, locked_at = ?, lock_expires_at = ?, \
             status = 'running', \
             started_at = COALESCE(started_at, ?), \
             sync_version = sync_version + 1 \
         WHERE id = ? \
           AND (status = 'queued' \
                OR (status = 'running' AND lock_expires_at <= ?)) \
           AND (locked_by IS NULL OR lock_expires_at <= ?)",
    )
    .bind(node_id)
    .bind(now)
    .bind(expires_at)
    .bind(now)
    .bind(task_id)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to claim task")?;

    Ok(result.rows_affected())
}

/// Extend the lease on a task held by `node_id`. Lease renewal is a
/// liveness signal, not an authoritative mutation: no version bump.
pub async fn extend_lease(
    pool: &SqlitePool,
    task_id: &str,
    node_id: &str,
    expires_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET lock_expires_at = ? \
         WHERE id = ? AND locked_by = ?",
    )
    .bind(expires_at)
    .bind(task_id)
    .bind(node_id)
    .execute(pool)
    .await
    .context("failed to extend lease")?;

    Ok(result.rows_affected())
}

/// Record replicated iteration progress from the lock owner. Bumps the
/// version so observers see the mutation.
pub async fn update_progress(
    pool: &SqlitePool,
    task_id: &str,
    node_id: &str,
    iteration: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET iteration = ?, sync_version = sync_version + 1 \
         WHERE id = ? AND locked_by = ?",
    )
    .bind(iteration)
    .bind(task_id)
    .bind(node_id)
    .execute(pool)
    .await
    .context("failed to update task progress")?;

    Ok(result.rows_affected())
}

/// Voluntarily release a lock held by `node_id`.
///
/// A still-`running` task returns to `queued`: the claim is reverted at the
/// lock layer, leaving the task in its pre-claim status with a bumped
/// version.
pub async fn release_lock(
    pool: &SqlitePool,
    task_id: &str,
    node_id: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET locked_by = NULL, locked_at = NULL, lock_expires_at = NULL, \
             status = CASE WHEN status = 'running' THEN 'queued' ELSE status END, \
             sync_version = sync_version + 1 \
         WHERE id = ? AND locked_by = ?",
    )
    .bind(task_id)
    .bind(node_id)
    .execute(pool)
    .await
    .context("failed to release lock")?;

    Ok(result.rows_affected())
}

/// Clear a lock regardless of owner (the `RELEASE_LOCK` intervention).
pub async fn force_release_lock(pool: &SqlitePool, task_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET locked_by = NULL, locked_at = NULL, lock_expires_at = NULL, \
             status = CASE WHEN status = 'running' THEN 'queued' ELSE status END, \
             sync_version = sync_version + 1 \
         WHERE id = ? AND locked_by IS NOT NULL",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to force-release lock")?;

    Ok(result.rows_affected())
}

/// Mark every running task with an expired lease as `stuck`, clearing the
/// lock and bumping the version. Returns the swept tasks.
pub async fn sweep_expired(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'stuck', \
             locked_by = NULL, locked_at = NULL, lock_expires_at = NULL, \
             sync_version = sync_version + 1 \
         WHERE status = 'running' AND lock_expires_at <= ? \
         RETURNING *",
    )
    .bind(now)
    .fetch_all(pool)
    .await
    .context("failed to sweep expired locks")?;

    Ok(tasks)
}

// -----------------------------------------------------------------------
// Interventions
// -----------------------------------------------------------------------

/// Force a status, bypassing the `from` guard (the `FORCE_STATUS`
/// intervention; the caller validates the transition first).
pub async fn force_status(
    pool: &SqlitePool,
    task_id: &str,
    to: TaskStatus,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let rows = if to.is_terminal() {
        sqlx::query(
            "UPDATE tasks \
             SET status = ?, \
                 sync_version = sync_version + 1, \
                 locked_by = NULL, locked_at = NULL, lock_expires_at = NULL, \
                 completed_at = ? \
             WHERE id = ?",
        )
        .bind(to)
        .bind(completed_at)
        .bind(task_id)
        .execute(pool)
        .await
    } else {
        sqlx::query(
            "UPDATE tasks SET status = ?, sync_version = sync_version + 1 \
             WHERE id = ?",
        )
        .bind(to)
        .bind(task_id)
        .execute(pool)
        .await
    }
    .context("failed to force task status")?;

    Ok(rows.rows_affected())
}

/// Return a terminal or stuck task to `queued` (the `RETRY` intervention).
///
/// Clears the result, lock, and completion timestamp; optionally resets the
/// iteration counter. The single exception to terminal absorption.
pub async fn retry_to_queued(
    pool: &SqlitePool,
    task_id: &str,
    reset_iteration: bool,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'queued', \
             sync_version = sync_version + 1, \
             result = NULL, \
             iteration = CASE WHEN ? THEN 0 ELSE iteration END, \
             locked_by = NULL, locked_at = NULL, lock_expires_at = NULL, \
             started_at = NULL, completed_at = NULL \
         WHERE id = ? \
           AND status IN ('completed','failed','aborted','skipped','stuck')",
    )
    .bind(reset_iteration)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to retry task to queued")?;

    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------
// Dependencies & queue
// -----------------------------------------------------------------------

/// Insert a dependency edge: `task_id` depends on `depends_on_id`.
///
/// Uses `ON CONFLICT DO NOTHING` so this is idempotent.
pub async fn insert_dependency(
    pool: &SqlitePool,
    task_id: &str,
    depends_on_id: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_dependencies (task_id, depends_on) VALUES (?, ?) \
         ON CONFLICT DO NOTHING",
    )
    .bind(task_id)
    .bind(depends_on_id)
    .execute(pool)
    .await
    .context("failed to insert task dependency")?;

    Ok(())
}

/// Get the IDs of all tasks that a given task depends on.
pub async fn get_dependencies(pool: &SqlitePool, task_id: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT depends_on FROM task_dependencies WHERE task_id = ?")
            .bind(task_id)
            .fetch_all(pool)
            .await
            .context("failed to get task dependencies")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Get the IDs of dependencies that are not yet completed.
pub async fn unmet_dependencies(
    pool: &SqlitePool,
    task_id: &str,
) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT dep.id FROM task_dependencies td \
         JOIN tasks dep ON dep.id = td.depends_on \
         WHERE td.task_id = ? AND dep.status != 'completed'",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to get unmet dependencies")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// All dependency edges within a project, as `(task_id, depends_on)` pairs.
pub async fn list_dependency_edges(
    pool: &SqlitePool,
    project_id: &str,
) -> Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT td.task_id, td.depends_on FROM task_dependencies td \
         JOIN tasks t ON t.id = td.task_id \
         WHERE t.project_id = ?",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to list dependency edges")?;

    Ok(rows)
}

/// The next claimable `queued` task for a project: lowest priority first,
/// oldest first, skipping rows another node still holds a live lease on.
pub async fn next_queued(
    pool: &SqlitePool,
    project_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE project_id = ? AND status = 'queued' \
           AND (locked_by IS NULL OR lock_expires_at <= ?) \
         ORDER BY priority ASC, created_at ASC \
         LIMIT 1",
    )
    .bind(project_id)
    .bind(now)
    .fetch_optional(pool)
    .await
    .context("failed to fetch next queued task")?;

    Ok(task)
}

/// Promote `blocked` tasks whose dependencies are all completed to
/// `queued`. Returns the promoted tasks.
pub async fn promote_unblocked(
    pool: &SqlitePool,
    project_id: &str,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'queued', sync_version = sync_version + 1 \
         WHERE project_id = ? AND status = 'blocked' \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_dependencies td \
               JOIN tasks dep ON dep.id = td.depends_on \
               WHERE td.task_id = tasks.id AND dep.status != 'completed' \
           ) \
         RETURNING *",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to promote unblocked tasks")?;

    Ok(tasks)
}

// -----------------------------------------------------------------------
// Aggregates
// -----------------------------------------------------------------------

/// Status counts for a project's tasks.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub queued: i64,
    pub blocked: i64,
    pub running: i64,
    pub paused: i64,
    pub completed: i64,
    pub failed: i64,
    pub aborted: i64,
    pub stuck: i64,
    pub skipped: i64,
    pub total: i64,
}

/// Get a summary of task counts by status for a given project.
pub async fn status_counts(pool: &SqlitePool, project_id: &str) -> Result<StatusCounts> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM tasks WHERE project_id = ? GROUP BY status",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to get status counts")?;

    let mut counts = StatusCounts::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => counts.pending = *count,
            "queued" => counts.queued = *count,
            "blocked" => counts.blocked = *count,
            "running" => counts.running = *count,
            "paused" => counts.paused = *count,
            "completed" => counts.completed = *count,
            "failed" => counts.failed = *count,
            "aborted" => counts.aborted = *count,
            "stuck" => counts.stuck = *count,
            "skipped" => counts.skipped = *count,
            _ => {}
        }
        counts.total += count;
    }
    Ok(counts)
}
