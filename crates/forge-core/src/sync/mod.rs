//! Sync protocol: handshake, push, pull.
//!
//! The handshake classifies every task into reconciliation buckets so a
//! reconnecting agent learns what to pull and push without whole-task
//! payloads. Push applies optimistic batched updates, consulting the
//! conflict resolver on version mismatches. Pull returns current snapshots
//! for explicit ids.

use std::collections::HashMap;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use forge_db::models::{NodeType, Task, TaskStatus};
use forge_db::queries::nodes as node_db;
use forge_db::queries::projects as project_db;
use forge_db::queries::sync_log::{self, NewSyncLogEntry};
use forge_db::queries::tasks as task_db;

use crate::bus::BusEvent;
use crate::coordinator::Coordinator;
use crate::error::{SyncError, validate_project_id};
use crate::resolve::{ConflictContext, Resolution, resolve};
use crate::state::TaskStateMachine;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A task snapshot as returned by pull and embedded in push results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: String,
    pub status: TaskStatus,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub iteration: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
}

impl From<&Task> for TaskSnapshot {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            status: task.status,
            version: task.sync_version,
            result: task.result.as_ref().map(|r| r.0.clone()),
            iteration: task.iteration,
            locked_by: task.locked_by.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub node_id: String,
    #[serde(default)]
    pub local_clock: i64,
    #[serde(default)]
    pub task_versions: HashMap<String, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub in_sync: Vec<String>,
    pub needs_pull: Vec<String>,
    pub needs_push: Vec<String>,
    pub conflicts: Vec<String>,
    pub server_clock: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub node_id: String,
    #[serde(default)]
    pub local_clock: i64,
    pub tasks: Vec<TaskPush>,
}

/// One task update inside a push batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPush {
    pub id: String,
    pub expected_version: i64,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub iteration: Option<i64>,
}

/// Per-task outcome of a push.
///
/// `success` with `new_version` means the update was applied. `success`
/// with only `server_state` means the update was absorbed without a write
/// (idempotent retry, or the resolver ruled `SERVER_WINS` and the caller
/// should reconcile). `error` carries the protocol code otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushTaskResult {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_state: Option<TaskSnapshot>,
}

impl PushTaskResult {
    fn applied(id: &str, new_version: i64) -> Self {
        Self {
            id: id.to_owned(),
            success: true,
            new_version: Some(new_version),
            resolution: None,
            error: None,
            message: None,
            server_state: None,
        }
    }

    fn absorbed(id: &str, resolution: Option<Resolution>, task: &Task) -> Self {
        Self {
            id: id.to_owned(),
            success: true,
            new_version: None,
            resolution,
            error: None,
            message: None,
            server_state: Some(TaskSnapshot::from(task)),
        }
    }

    fn rejected(
        id: &str,
        error: &str,
        message: impl Into<String>,
        task: Option<&Task>,
    ) -> Self {
        Self {
            id: id.to_owned(),
            success: false,
            new_version: None,
            resolution: None,
            error: Some(error.to_owned()),
            message: Some(message.into()),
            server_state: task.map(TaskSnapshot::from),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub results: Vec<PushTaskResult>,
    pub server_clock: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    #[serde(default)]
    pub task_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub tasks: Vec<TaskSnapshot>,
    pub server_clock: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRegisterRequest {
    pub node_id: String,
    pub project_id: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRegisterResponse {
    pub node_id: String,
    pub project_id: String,
    pub server_clock: i64,
}

/// A node as listed by `GET /nodes/:projectId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_id: String,
    pub node_type: NodeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub capabilities: Vec<String>,
    pub last_seen_at: chrono::DateTime<Utc>,
    pub is_online: bool,
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Upsert a node registration and announce it on the bus.
pub async fn register_node(
    coord: &Coordinator,
    req: &NodeRegisterRequest,
) -> Result<NodeRegisterResponse, SyncError> {
    validate_project_id(&req.project_id)?;
    project_db::get_project(&coord.pool, &req.project_id)
        .await?
        .ok_or_else(|| SyncError::ProjectNotFound(req.project_id.clone()))?;

    let node = node_db::upsert_node(
        &coord.pool,
        &node_db::NewNode {
            id: &req.node_id,
            project_id: &req.project_id,
            node_type: req.node_type,
            display_name: req.display_name.as_deref(),
            capabilities: &req.capabilities,
        },
    )
    .await?;

    coord.bus.publish(BusEvent::NodeRegistered {
        project_id: req.project_id.clone(),
        node_id: node.id.clone(),
    });

    tracing::info!(node_id = %node.id, project_id = %req.project_id, "node registered");

    Ok(NodeRegisterResponse {
        node_id: node.id,
        project_id: req.project_id.clone(),
        server_clock: coord.clock.value(),
    })
}

/// List a project's nodes with the derived online flag.
pub async fn list_nodes(
    coord: &Coordinator,
    project_id: &str,
) -> Result<Vec<NodeInfo>, SyncError> {
    validate_project_id(project_id)?;
    let now = Utc::now();
    let nodes = node_db::list_nodes_for_project(&coord.pool, project_id).await?;
    Ok(nodes
        .into_iter()
        .map(|node| NodeInfo {
            is_online: node.is_online(now),
            node_id: node.id,
            node_type: node.node_type,
            display_name: node.display_name,
            capabilities: node.capabilities.0,
            last_seen_at: node.last_seen_at,
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Classify every task of a project against the client's known versions.
///
/// - equal version: `in_sync`
/// - server newer, or unknown to the client: `needs_pull`
/// - client newer, or unknown to the server: `needs_push`
/// - client newer while another node holds the lock: `conflicts`
pub async fn handshake(
    coord: &Coordinator,
    project_id: &str,
    req: &HandshakeRequest,
) -> Result<HandshakeResponse, SyncError> {
    validate_project_id(project_id)?;
    project_db::get_project(&coord.pool, project_id)
        .await?
        .ok_or_else(|| SyncError::ProjectNotFound(project_id.to_owned()))?;

    coord.clock.observe(req.local_clock);
    let now = Utc::now();
    let _ = node_db::touch_node(&coord.pool, &req.node_id, now).await;

    let tasks = task_db::list_tasks_for_project(&coord.pool, project_id).await?;

    let mut response = HandshakeResponse {
        in_sync: Vec::new(),
        needs_pull: Vec::new(),
        needs_push: Vec::new(),
        conflicts: Vec::new(),
        server_clock: coord.clock.value(),
    };

    let mut seen = std::collections::HashSet::new();
    for task in &tasks {
        seen.insert(task.id.clone());
        match req.task_versions.get(&task.id) {
            None => response.needs_pull.push(task.id.clone()),
            Some(&client_version) => {
                if client_version == task.sync_version {
                    response.in_sync.push(task.id.clone());
                } else if client_version < task.sync_version {
                    response.needs_pull.push(task.id.clone());
                } else {
                    // Client claims to be ahead. If another node holds the
                    // lock, both sides have diverged; otherwise the client
                    // simply has unpushed work.
                    let foreign_lock = task
                        .locked_by
                        .as_deref()
                        .is_some_and(|owner| owner != req.node_id);
                    if foreign_lock {
                        response.conflicts.push(task.id.clone());
                    } else {
                        response.needs_push.push(task.id.clone());
                    }
                }
            }
        }
    }

    // Ids the client knows that the server has never seen.
    for id in req.task_versions.keys() {
        if !seen.contains(id) {
            response.needs_push.push(id.clone());
        }
    }

    response.server_clock = coord.clock.value();
    Ok(response)
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

/// Apply a batch of task updates.
///
/// Each update runs the pipeline of the protocol: idempotency short-circuit,
/// conflict resolution on version mismatch, terminal-state and transition
/// checks, then an optimistic version-guarded write. Applied changes append
/// a sync-log record and are broadcast.
pub async fn push(
    coord: &Coordinator,
    project_id: &str,
    req: &PushRequest,
) -> Result<PushResponse, SyncError> {
    validate_project_id(project_id)?;
    project_db::get_project(&coord.pool, project_id)
        .await?
        .ok_or_else(|| SyncError::ProjectNotFound(project_id.to_owned()))?;

    coord.clock.observe(req.local_clock);

    let mut results = Vec::with_capacity(req.tasks.len());
    for update in &req.tasks {
        let result = push_one(coord, project_id, &req.node_id, update).await?;
        results.push(result);
    }

    let _ = project_db::touch_project(&coord.pool, project_id, Utc::now()).await;

    Ok(PushResponse {
        results,
        server_clock: coord.clock.value(),
    })
}

async fn push_one(
    coord: &Coordinator,
    project_id: &str,
    node_id: &str,
    update: &TaskPush,
) -> Result<PushTaskResult, SyncError> {
    let now = Utc::now();

    let Some(task) = task_db::get_task(&coord.pool, &update.id).await? else {
        return Ok(PushTaskResult::rejected(
            &update.id,
            "TASK_NOT_FOUND",
            format!("task {} not known to this coordinator", update.id),
            None,
        ));
    };

    if task.project_id != project_id {
        return Ok(PushTaskResult::rejected(
            &update.id,
            "TASK_NOT_FOUND",
            format!("task {} does not belong to project {project_id}", update.id),
            None,
        ));
    }

    // Idempotent retry: the server already shows the pushed status. Applies
    // at most once; the duplicate sees a non-error with the current state.
    if task.status == update.status {
        return Ok(PushTaskResult::absorbed(&update.id, None, &task));
    }

    // Version mismatch goes to the resolver.
    if update.expected_version != task.sync_version {
        let ctx = ConflictContext {
            plugin_is_active_runner: task.is_locked_by(node_id, now),
            server_status: task.status,
            plugin_status: update.status,
        };
        match resolve(&ctx) {
            Resolution::Reject => {
                return Ok(PushTaskResult::rejected(
                    &update.id,
                    "VERSION_CONFLICT",
                    format!(
                        "expected version {} but server has {}",
                        update.expected_version, task.sync_version
                    ),
                    Some(&task),
                ));
            }
            Resolution::ServerWins => {
                return Ok(PushTaskResult::absorbed(
                    &update.id,
                    Some(Resolution::ServerWins),
                    &task,
                ));
            }
            Resolution::PluginWins => {
                // Fall through and apply against the server's real version.
            }
        }
    }

    if task.status.is_terminal() {
        return Ok(PushTaskResult::rejected(
            &update.id,
            "TERMINAL_STATE",
            format!("task {} is already {}", update.id, task.status),
            Some(&task),
        ));
    }

    if TaskStateMachine::requires_intervention(task.status)
        || !TaskStateMachine::is_valid_transition(task.status, update.status)
    {
        return Ok(PushTaskResult::rejected(
            &update.id,
            "INVALID_TRANSITION",
            format!("{} -> {} is not permitted", task.status, update.status),
            Some(&task),
        ));
    }

    let rows = task_db::apply_push(
        &coord.pool,
        &update.id,
        task.sync_version,
        update.status,
        update.result.as_ref(),
        update.iteration,
        now,
    )
    .await?;

    if rows == 0 {
        // Lost a race against a concurrent mutation; report the fresh state.
        let fresh = task_db::get_task(&coord.pool, &update.id)
            .await?
            .context("task vanished during push")?;
        return Ok(PushTaskResult::rejected(
            &update.id,
            "VERSION_CONFLICT",
            "task changed while applying the update",
            Some(&fresh),
        ));
    }

    let new_version = task.sync_version + 1;
    let clock = coord.clock.tick();

    sync_log::append(
        &coord.pool,
        &NewSyncLogEntry {
            project_id,
            task_id: Some(&update.id),
            node_id: Some(node_id),
            operation: "push",
            old_value: Some(&serde_json::json!({
                "status": task.status,
                "version": task.sync_version,
            })),
            new_value: Some(&serde_json::json!({
                "status": update.status,
                "version": new_version,
            })),
            logical_clock: clock,
        },
    )
    .await?;

    coord.bus.publish(BusEvent::TaskUpdate {
        project_id: project_id.to_owned(),
        task_id: update.id.clone(),
        status: update.status,
        version: new_version,
    });

    if update.status.is_terminal() {
        coord.bus.publish(BusEvent::TaskUnlocked {
            project_id: project_id.to_owned(),
            task_id: update.id.clone(),
        });
        coord.bus.publish(BusEvent::QueueUpdate {
            project_id: project_id.to_owned(),
        });
        // A completed dependency may unblock downstream tasks.
        if update.status == TaskStatus::Completed {
            let promoted =
                task_db::promote_unblocked(&coord.pool, project_id).await?;
            for task in &promoted {
                tracing::info!(task_id = %task.id, "dependency met, task queued");
            }
        }
    }

    tracing::debug!(
        task_id = %update.id,
        status = %update.status,
        version = new_version,
        "push applied"
    );

    Ok(PushTaskResult::applied(&update.id, new_version))
}

// ---------------------------------------------------------------------------
// Pull
// ---------------------------------------------------------------------------

/// Return current snapshots for the requested ids. Ids the server does not
/// know are simply omitted.
pub async fn pull(
    coord: &Coordinator,
    project_id: &str,
    req: &PullRequest,
) -> Result<PullResponse, SyncError> {
    validate_project_id(project_id)?;

    let mut tasks = Vec::with_capacity(req.task_ids.len());
    for id in &req.task_ids {
        if let Some(task) = task_db::get_task(&coord.pool, id).await? {
            if task.project_id == project_id {
                tasks.push(TaskSnapshot::from(&task));
            }
        }
    }

    Ok(PullResponse {
        tasks,
        server_clock: coord.clock.value(),
    })
}
