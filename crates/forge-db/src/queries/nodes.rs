//! Database query functions for the `nodes` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{Node, NodeType};

/// Fields for a node registration.
#[derive(Debug, Clone)]
pub struct NewNode<'a> {
    pub id: &'a str,
    pub project_id: &'a str,
    pub node_type: NodeType,
    pub display_name: Option<&'a str>,
    pub capabilities: &'a [String],
}

/// Upsert a node registration. Re-registering refreshes the type, display
/// name, capabilities, and last-seen timestamp.
pub async fn upsert_node(pool: &SqlitePool, new: &NewNode<'_>) -> Result<Node> {
    let now = Utc::now();
    let node = sqlx::query_as::<_, Node>(
        "INSERT INTO nodes (id, project_id, node_type, display_name, capabilities, \
                            registered_at, last_seen_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET node_type = excluded.node_type, \
                                       display_name = excluded.display_name, \
                                       capabilities = excluded.capabilities, \
                                       last_seen_at = excluded.last_seen_at \
         RETURNING *",
    )
    .bind(new.id)
    .bind(new.project_id)
    .bind(new.node_type)
    .bind(new.display_name)
    .bind(serde_json::to_string(new.capabilities)?)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to upsert node")?;

    Ok(node)
}

/// Fetch a single node by ID.
pub async fn get_node(pool: &SqlitePool, id: &str) -> Result<Option<Node>> {
    let node = sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch node")?;

    Ok(node)
}

/// List all nodes registered to a project.
pub async fn list_nodes_for_project(
    pool: &SqlitePool,
    project_id: &str,
) -> Result<Vec<Node>> {
    let nodes = sqlx::query_as::<_, Node>(
        "SELECT * FROM nodes WHERE project_id = ? ORDER BY registered_at ASC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to list nodes for project")?;

    Ok(nodes)
}

/// Stamp a node's last-seen timestamp. Returns rows affected (0 when the
/// node is unknown).
pub async fn touch_node(
    pool: &SqlitePool,
    id: &str,
    at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query("UPDATE nodes SET last_seen_at = ? WHERE id = ?")
        .bind(at)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to touch node")?;

    Ok(result.rows_affected())
}

/// Count nodes seen within the given window.
pub async fn count_online(
    pool: &SqlitePool,
    project_id: &str,
    seen_after: DateTime<Utc>,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM nodes WHERE project_id = ? AND last_seen_at >= ?",
    )
    .bind(project_id)
    .bind(seen_after)
    .fetch_one(pool)
    .await
    .context("failed to count online nodes")?;

    Ok(row.0)
}
