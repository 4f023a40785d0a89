//! Operator interventions.
//!
//! `PAUSE` and `ABORT` are cooperative: they queue as `pending` and ride
//! the task's next heartbeat. `RELEASE_LOCK`, `FORCE_STATUS`, and `RETRY`
//! apply immediately. `RETRY` is the single exception to terminal
//! absorption: it returns a finished or stuck task to `queued`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use forge_db::models::{InterventionKind, InterventionStatus, TaskStatus};
use forge_db::queries::interventions::{self as intervention_db, NewIntervention};
use forge_db::queries::sync_log::{self, NewSyncLogEntry};
use forge_db::queries::tasks as task_db;

use crate::bus::BusEvent;
use crate::coordinator::Coordinator;
use crate::error::SyncError;
use crate::state::TaskStateMachine;

// ---------------------------------------------------------------------------
// Typed params
// ---------------------------------------------------------------------------

/// Intervention parameters, indexed by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum InterventionParams {
    Pause,
    Abort,
    ReleaseLock,
    ForceStatus { status: TaskStatus },
    Retry { reset_iteration: bool },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForceStatusWire {
    status: TaskStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetryWire {
    #[serde(default)]
    reset_iteration: bool,
}

impl InterventionParams {
    /// Parse the untyped `params` document against the declared kind.
    pub fn from_wire(kind: InterventionKind, params: &Value) -> Result<Self, String> {
        match kind {
            InterventionKind::Pause => Ok(Self::Pause),
            InterventionKind::Abort => Ok(Self::Abort),
            InterventionKind::ReleaseLock => Ok(Self::ReleaseLock),
            InterventionKind::ForceStatus => {
                let wire: ForceStatusWire = serde_json::from_value(params.clone())
                    .map_err(|e| format!("FORCE_STATUS params: {e}"))?;
                Ok(Self::ForceStatus {
                    status: wire.status,
                })
            }
            InterventionKind::Retry => {
                let wire: RetryWire = if params.is_null() {
                    RetryWire::default()
                } else {
                    serde_json::from_value(params.clone())
                        .map_err(|e| format!("RETRY params: {e}"))?
                };
                Ok(Self::Retry {
                    reset_iteration: wire.reset_iteration,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterveneRequest {
    #[serde(rename = "type")]
    pub kind: InterventionKind,
    pub task_id: String,
    pub requested_by: String,
    pub reason: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterveneResponse {
    pub id: String,
    pub status: InterventionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub server_clock: i64,
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Queue or apply an intervention.
pub async fn intervene(
    coord: &Coordinator,
    req: &InterveneRequest,
) -> Result<InterveneResponse, SyncError> {
    let task = task_db::get_task(&coord.pool, &req.task_id)
        .await?
        .ok_or_else(|| SyncError::TaskNotFound(req.task_id.clone()))?;

    let params = match InterventionParams::from_wire(req.kind, &req.params) {
        Ok(p) => p,
        Err(message) => {
            return Ok(InterveneResponse {
                id: String::new(),
                status: InterventionStatus::Rejected,
                message: Some(message),
                server_clock: coord.clock.value(),
            });
        }
    };

    let id = Uuid::new_v4().to_string();
    let record = intervention_db::insert_intervention(
        &coord.pool,
        &NewIntervention {
            id: &id,
            task_id: &req.task_id,
            kind: req.kind,
            requested_by: &req.requested_by,
            reason: &req.reason,
            params: &req.params,
        },
    )
    .await?;

    let (status, message) = match params {
        // Cooperative: delivered on the next heartbeat.
        InterventionParams::Pause | InterventionParams::Abort => {
            tracing::info!(
                task_id = %req.task_id,
                kind = %req.kind,
                "intervention queued for heartbeat delivery"
            );
            (InterventionStatus::Pending, None)
        }

        InterventionParams::ReleaseLock => {
            let rows = task_db::force_release_lock(&coord.pool, &req.task_id).await?;
            if rows == 0 {
                reject(coord, &record.id).await?;
                (
                    InterventionStatus::Rejected,
                    Some(format!("task {} holds no lock", req.task_id)),
                )
            } else {
                applied(coord, &task.project_id, &req.task_id, &record.id, "release_lock")
                    .await?;
                coord.bus.publish(BusEvent::TaskUnlocked {
                    project_id: task.project_id.clone(),
                    task_id: req.task_id.clone(),
                });
                (InterventionStatus::Applied, None)
            }
        }

        InterventionParams::ForceStatus { status } => {
            if !TaskStateMachine::is_valid_transition(task.status, status) {
                reject(coord, &record.id).await?;
                (
                    InterventionStatus::Rejected,
                    Some(format!("{} -> {} is not permitted", task.status, status)),
                )
            } else {
                let completed_at = status.is_terminal().then(chrono::Utc::now);
                task_db::force_status(&coord.pool, &req.task_id, status, completed_at)
                    .await?;
                applied(coord, &task.project_id, &req.task_id, &record.id, "force_status")
                    .await?;
                coord.bus.publish(BusEvent::TaskUpdate {
                    project_id: task.project_id.clone(),
                    task_id: req.task_id.clone(),
                    status,
                    version: task.sync_version + 1,
                });
                (InterventionStatus::Applied, None)
            }
        }

        InterventionParams::Retry { reset_iteration } => {
            let rows =
                task_db::retry_to_queued(&coord.pool, &req.task_id, reset_iteration)
                    .await?;
            if rows == 0 {
                reject(coord, &record.id).await?;
                (
                    InterventionStatus::Rejected,
                    Some(format!(
                        "task {} is {}; retry applies to terminal or stuck tasks",
                        req.task_id, task.status
                    )),
                )
            } else {
                applied(coord, &task.project_id, &req.task_id, &record.id, "retry")
                    .await?;
                coord.bus.publish(BusEvent::TaskUpdate {
                    project_id: task.project_id.clone(),
                    task_id: req.task_id.clone(),
                    status: TaskStatus::Queued,
                    version: task.sync_version + 1,
                });
                coord.bus.publish(BusEvent::QueueUpdate {
                    project_id: task.project_id.clone(),
                });
                (InterventionStatus::Applied, None)
            }
        }
    };

    Ok(InterveneResponse {
        id,
        status,
        message,
        server_clock: coord.clock.value(),
    })
}

async fn applied(
    coord: &Coordinator,
    project_id: &str,
    task_id: &str,
    intervention_id: &str,
    operation: &str,
) -> Result<(), SyncError> {
    intervention_db::set_status(&coord.pool, intervention_id, InterventionStatus::Applied)
        .await?;
    let clock = coord.clock.tick();
    sync_log::append(
        &coord.pool,
        &NewSyncLogEntry {
            project_id,
            task_id: Some(task_id),
            node_id: None,
            operation,
            old_value: None,
            new_value: Some(&serde_json::json!({ "interventionId": intervention_id })),
            logical_clock: clock,
        },
    )
    .await?;
    Ok(())
}

async fn reject(coord: &Coordinator, intervention_id: &str) -> Result<(), SyncError> {
    intervention_db::set_status(&coord.pool, intervention_id, InterventionStatus::Rejected)
        .await?;
    Ok(())
}
