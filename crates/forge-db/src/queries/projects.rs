//! Database query functions for the `projects` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::Project;

/// Insert a new project row, or return the existing one when the id is
/// already registered (registration is an upsert).
pub async fn upsert_project(
    pool: &SqlitePool,
    id: &str,
    name: &str,
    path: &str,
) -> Result<Project> {
    let now = Utc::now();
    let project = sqlx::query_as::<_, Project>(
        "INSERT INTO projects (id, name, path, created_at, last_activity_at) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, \
                                       path = excluded.path, \
                                       last_activity_at = excluded.last_activity_at \
         RETURNING *",
    )
    .bind(id)
    .bind(name)
    .bind(path)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to upsert project")?;

    Ok(project)
}

/// Fetch a single project by ID.
pub async fn get_project(pool: &SqlitePool, id: &str) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch project")?;

    Ok(project)
}

/// List all projects, ordered by creation time.
pub async fn list_projects(pool: &SqlitePool) -> Result<Vec<Project>> {
    let projects =
        sqlx::query_as::<_, Project>("SELECT * FROM projects ORDER BY created_at ASC")
            .fetch_all(pool)
            .await
            .context("failed to list projects")?;

    Ok(projects)
}

/// Stamp the project's last-activity timestamp.
pub async fn touch_project(
    pool: &SqlitePool,
    id: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE projects SET last_activity_at = ? WHERE id = ?")
        .bind(at)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to touch project")?;

    Ok(())
}
