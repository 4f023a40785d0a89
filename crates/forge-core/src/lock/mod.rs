//! Lock & lease manager: claim, heartbeat, release, and the expired-lease
//! sweeper.
//!
//! Claims are claim-or-steal-if-expired: the conditional UPDATE admits
//! unlocked queued rows and rows whose lease has lapsed. After the write
//! the row is re-read to confirm ownership, which closes the lost-update
//! race between two concurrent claimers. Heartbeats extend the lease and
//! double as the delivery channel for cooperative interventions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use forge_db::models::{
    Intervention, InterventionKind, IterationOutcome, Task, TaskStatus,
};
use forge_db::queries::interventions as intervention_db;
use forge_db::queries::iterations as iteration_db;
use forge_db::queries::nodes as node_db;
use forge_db::queries::sync_log::{self, NewSyncLogEntry};
use forge_db::queries::tasks as task_db;

use crate::bus::BusEvent;
use crate::coordinator::Coordinator;
use crate::error::SyncError;

/// Default lease duration granted by a claim and added by each heartbeat.
pub const DEFAULT_LEASE_SECS: i64 = 300;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub node_id: String,
    /// Lease duration in seconds; the default applies when omitted.
    #[serde(default)]
    pub lock_duration: Option<i64>,
}

/// A granted claim: everything the agent needs to start iterating.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimGrant {
    pub task_id: String,
    pub name: String,
    pub prompt: String,
    pub priority: i64,
    pub config: Value,
    pub version: i64,
    pub iteration: i64,
    pub lock_expires_at: DateTime<Utc>,
    pub server_clock: i64,
}

impl ClaimGrant {
    fn from_task(task: &Task, server_clock: i64) -> Self {
        Self {
            task_id: task.id.clone(),
            name: task.name.clone(),
            prompt: task.prompt.clone(),
            priority: task.priority,
            config: task.config.0.clone(),
            version: task.sync_version,
            iteration: task.iteration,
            lock_expires_at: task.lock_expires_at.unwrap_or_else(Utc::now),
            server_clock,
        }
    }
}

/// Replicated record of one agent iteration, delivered with a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationReport {
    pub seq: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub token_estimate: i64,
    pub outcome: IterationOutcome,
    pub summary: String,
    #[serde(default)]
    pub criteria: Value,
    #[serde(default)]
    pub files_changed: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub node_id: String,
    #[serde(default)]
    pub iteration: Option<i64>,
    #[serde(default)]
    pub progress: Option<IterationReport>,
    /// Opaque execution-view mirror; accepted for forward compatibility.
    #[serde(default)]
    pub execution_state: Option<Value>,
}

/// An intervention echoed back to the lock owner for cooperative handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterventionCommand {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: InterventionKind,
    pub reason: String,
    pub params: Value,
}

impl From<Intervention> for InterventionCommand {
    fn from(i: Intervention) -> Self {
        Self {
            id: i.id,
            kind: i.kind,
            reason: i.reason,
            params: i.params.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub commands: Vec<InterventionCommand>,
    pub lock_expires_at: DateTime<Utc>,
    pub sync_version: i64,
    pub server_clock: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub node_id: String,
}

// ---------------------------------------------------------------------------
// Claim
// ---------------------------------------------------------------------------

/// Claim a queued task (or steal an expired lease) for `node_id`.
pub async fn claim(
    coord: &Coordinator,
    task_id: &str,
    req: &ClaimRequest,
) -> Result<ClaimGrant, SyncError> {
    let now = Utc::now();
    let lease = Duration::seconds(req.lock_duration.unwrap_or(DEFAULT_LEASE_SECS));

    let task = task_db::get_task(&coord.pool, task_id)
        .await?
        .ok_or_else(|| SyncError::TaskNotFound(task_id.to_owned()))?;

    let stealable = task.status == TaskStatus::Running
        && task.lock_expires_at.is_some_and(|exp| exp <= now);
    if task.status != TaskStatus::Queued && !stealable {
        return Err(SyncError::InvalidStatus {
            task_id: task_id.to_owned(),
            status: task.status,
        });
    }

    let rows =
        task_db::claim_task(&coord.pool, task_id, &req.node_id, now, now + lease)
            .await?;

    // Re-read and confirm ownership; a 0-row update or a different owner
    // means another claimer won the race.
    let fresh = task_db::get_task(&coord.pool, task_id)
        .await?
        .ok_or_else(|| SyncError::TaskNotFound(task_id.to_owned()))?;

    if rows == 0 || fresh.locked_by.as_deref() != Some(req.node_id.as_str()) {
        match (&fresh.locked_by, fresh.lock_expires_at) {
            (Some(owner), Some(expires_at)) => {
                return Err(SyncError::AlreadyLocked {
                    task_id: task_id.to_owned(),
                    owner: owner.clone(),
                    expires_at,
                });
            }
            _ => {
                return Err(SyncError::InvalidStatus {
                    task_id: task_id.to_owned(),
                    status: fresh.status,
                });
            }
        }
    }

    let clock = coord.clock.tick();
    sync_log::append(
        &coord.pool,
        &NewSyncLogEntry {
            project_id: &fresh.project_id,
            task_id: Some(task_id),
            node_id: Some(&req.node_id),
            operation: "claim",
            old_value: Some(&serde_json::json!({ "status": task.status })),
            new_value: Some(&serde_json::json!({
                "status": fresh.status,
                "lockedBy": req.node_id,
            })),
            logical_clock: clock,
        },
    )
    .await?;

    coord.bus.publish(BusEvent::TaskLocked {
        project_id: fresh.project_id.clone(),
        task_id: task_id.to_owned(),
        node_id: req.node_id.clone(),
        expires_at: fresh.lock_expires_at.unwrap_or(now + lease),
    });
    coord.bus.publish(BusEvent::TaskUpdate {
        project_id: fresh.project_id.clone(),
        task_id: task_id.to_owned(),
        status: fresh.status,
        version: fresh.sync_version,
    });

    tracing::info!(task_id, node_id = %req.node_id, "task claimed");

    Ok(ClaimGrant::from_task(&fresh, coord.clock.value()))
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

/// Extend the lease and deliver pending interventions.
///
/// Requires the caller to hold the lock: a cleared or foreign lock yields
/// `LOCK_LOST`, the signal that the sweeper (or another claimer) took the
/// task away.
pub async fn heartbeat(
    coord: &Coordinator,
    task_id: &str,
    req: &HeartbeatRequest,
) -> Result<HeartbeatResponse, SyncError> {
    let now = Utc::now();

    let task = task_db::get_task(&coord.pool, task_id)
        .await?
        .ok_or_else(|| SyncError::TaskNotFound(task_id.to_owned()))?;

    if task.locked_by.as_deref() != Some(req.node_id.as_str()) {
        return Err(SyncError::LockLost {
            task_id: task_id.to_owned(),
            node_id: req.node_id.clone(),
        });
    }

    let expires_at = now + Duration::seconds(DEFAULT_LEASE_SECS);
    task_db::extend_lease(&coord.pool, task_id, &req.node_id, expires_at).await?;
    let _ = node_db::touch_node(&coord.pool, &req.node_id, now).await;

    // Replicated progress bumps the version so observers see the mutation.
    if let Some(iteration) = req.iteration {
        task_db::update_progress(&coord.pool, task_id, &req.node_id, iteration)
            .await?;
        coord.bus.publish(BusEvent::TaskProgress {
            project_id: task.project_id.clone(),
            task_id: task_id.to_owned(),
            iteration,
        });
    }

    if let Some(report) = &req.progress {
        let row = forge_db::models::IterationRow {
            task_id: task_id.to_owned(),
            seq: report.seq,
            started_at: report.started_at,
            ended_at: report.ended_at,
            duration_ms: report.duration_ms,
            token_estimate: report.token_estimate,
            outcome: report.outcome,
            summary: report.summary.clone(),
            criteria: sqlx::types::Json(report.criteria.clone()),
            files_changed: sqlx::types::Json(report.files_changed.clone()),
        };
        iteration_db::upsert_iteration(&coord.pool, &row).await?;
    }

    if let Some(state) = &req.execution_state {
        tracing::debug!(task_id, keys = state.as_object().map_or(0, |o| o.len()),
            "execution state mirrored");
    }

    // Deliver pending interventions, atomically marking them applied.
    let commands: Vec<InterventionCommand> =
        intervention_db::drain_pending(&coord.pool, task_id)
            .await?
            .into_iter()
            .map(InterventionCommand::from)
            .collect();

    let fresh = task_db::get_task(&coord.pool, task_id)
        .await?
        .ok_or_else(|| SyncError::TaskNotFound(task_id.to_owned()))?;

    Ok(HeartbeatResponse {
        commands,
        lock_expires_at: expires_at,
        sync_version: fresh.sync_version,
        server_clock: coord.clock.value(),
    })
}

// ---------------------------------------------------------------------------
// Release
// ---------------------------------------------------------------------------

/// Voluntarily release the lock. A still-running task returns to `queued`.
pub async fn release(
    coord: &Coordinator,
    task_id: &str,
    req: &ReleaseRequest,
) -> Result<(), SyncError> {
    let task = task_db::get_task(&coord.pool, task_id)
        .await?
        .ok_or_else(|| SyncError::TaskNotFound(task_id.to_owned()))?;

    if task.locked_by.as_deref() != Some(req.node_id.as_str()) {
        return Err(SyncError::LockLost {
            task_id: task_id.to_owned(),
            node_id: req.node_id.clone(),
        });
    }

    task_db::release_lock(&coord.pool, task_id, &req.node_id).await?;

    let clock = coord.clock.tick();
    sync_log::append(
        &coord.pool,
        &NewSyncLogEntry {
            project_id: &task.project_id,
            task_id: Some(task_id),
            node_id: Some(&req.node_id),
            operation: "release",
            old_value: Some(&serde_json::json!({ "lockedBy": req.node_id })),
            new_value: Some(&serde_json::json!({ "lockedBy": null })),
            logical_clock: clock,
        },
    )
    .await?;

    coord.bus.publish(BusEvent::TaskUnlocked {
        project_id: task.project_id.clone(),
        task_id: task_id.to_owned(),
    });
    coord.bus.publish(BusEvent::QueueUpdate {
        project_id: task.project_id,
    });

    tracing::info!(task_id, node_id = %req.node_id, "lock released");
    Ok(())
}

// ---------------------------------------------------------------------------
// Sweeper
// ---------------------------------------------------------------------------

/// Sweep expired leases: every `running` task whose lease has lapsed is
/// marked `stuck`, its lock cleared, and the change logged and broadcast.
/// Returns the swept tasks.
pub async fn sweep_expired_locks(coord: &Coordinator) -> Result<Vec<Task>, SyncError> {
    let now = Utc::now();
    let swept = task_db::sweep_expired(&coord.pool, now).await?;

    for task in &swept {
        let clock = coord.clock.tick();
        sync_log::append(
            &coord.pool,
            &NewSyncLogEntry {
                project_id: &task.project_id,
                task_id: Some(&task.id),
                node_id: None,
                operation: "stuck",
                old_value: Some(&serde_json::json!({ "status": "running" })),
                new_value: Some(&serde_json::json!({
                    "status": "stuck",
                    "version": task.sync_version,
                })),
                logical_clock: clock,
            },
        )
        .await?;

        coord.bus.publish(BusEvent::TaskStuck {
            project_id: task.project_id.clone(),
            task_id: task.id.clone(),
            reason: "lock lease expired".to_owned(),
        });
        coord.bus.publish(BusEvent::QueueUpdate {
            project_id: task.project_id.clone(),
        });

        tracing::warn!(task_id = %task.id, "expired lease swept, task marked stuck");
    }

    Ok(swept)
}
