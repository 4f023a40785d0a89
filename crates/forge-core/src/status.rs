//! Aggregate project health.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use forge_db::models::NODE_ONLINE_WINDOW_SECS;
use forge_db::queries::interventions as intervention_db;
use forge_db::queries::nodes as node_db;
use forge_db::queries::tasks::{self as task_db, StatusCounts};

use crate::coordinator::Coordinator;
use crate::error::{SyncError, validate_project_id};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    pub project_id: String,
    pub tasks: StatusCounts,
    pub online_nodes: i64,
    pub pending_interventions: i64,
    pub server_clock: i64,
}

/// Aggregate health for one project: task counts by status, nodes seen
/// within the online window, and undelivered interventions.
pub async fn project_status(
    coord: &Coordinator,
    project_id: &str,
) -> Result<ProjectStatus, SyncError> {
    validate_project_id(project_id)?;

    let tasks = task_db::status_counts(&coord.pool, project_id).await?;
    let seen_after = Utc::now() - Duration::seconds(NODE_ONLINE_WINDOW_SECS);
    let online_nodes = node_db::count_online(&coord.pool, project_id, seen_after).await?;
    let pending_interventions =
        intervention_db::count_pending_for_project(&coord.pool, project_id).await?;

    Ok(ProjectStatus {
        project_id: project_id.to_owned(),
        tasks,
        online_nodes,
        pending_interventions,
        server_clock: coord.clock.value(),
    })
}
