//! Task queue and dependency DAG.
//!
//! Creation validates the `depends_on` graph with a depth-bounded cycle
//! guard. Queueing parks tasks with unmet dependencies in `blocked`;
//! completed dependencies promote them back. Default priorities fall out of
//! a longest-path-from-roots computation over the DAG, so upstream work
//! sorts first.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use forge_db::models::{Task, TaskStatus};
use forge_db::queries::projects as project_db;
use forge_db::queries::sync_log::{self, NewSyncLogEntry};
use forge_db::queries::tasks::{self as task_db, NewTask};

use crate::bus::BusEvent;
use crate::coordinator::Coordinator;
use crate::error::{SyncError, validate_project_id};
use crate::lock::{self, ClaimGrant, ClaimRequest};

// ---------------------------------------------------------------------------
// Pure DAG helpers
// ---------------------------------------------------------------------------

/// Find a dependency cycle in `(task, depends_on)` edges, if one exists.
///
/// Depth-bounded iterative DFS; the bound is the node count, so a malformed
/// graph cannot recurse unboundedly. Returns the ids along one cycle.
pub fn find_cycle(edges: &[(String, String)]) -> Option<Vec<String>> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut nodes: HashSet<&str> = HashSet::new();
    for (task, dep) in edges {
        adjacency.entry(task.as_str()).or_default().push(dep.as_str());
        nodes.insert(task.as_str());
        nodes.insert(dep.as_str());
    }

    let bound = nodes.len();
    let mut visited: HashSet<&str> = HashSet::new();

    for &start in &nodes {
        if visited.contains(start) {
            continue;
        }
        // Explicit stack of (node, next-child-index) plus the current path.
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        let mut on_path: Vec<&str> = vec![start];
        let mut on_path_set: HashSet<&str> = HashSet::from([start]);

        while let Some((node, child_idx)) = stack.last_mut() {
            let children = adjacency.get(node).map(Vec::as_slice).unwrap_or(&[]);
            if let Some(&next) = children.get(*child_idx) {
                *child_idx += 1;
                if on_path_set.contains(next) {
                    // Found a back edge; slice the path from the first
                    // occurrence of `next`.
                    let pos = on_path.iter().position(|&n| n == next).unwrap_or(0);
                    return Some(
                        on_path[pos..].iter().map(|s| (*s).to_owned()).collect(),
                    );
                }
                if !visited.contains(next) && on_path.len() < bound {
                    stack.push((next, 0));
                    on_path.push(next);
                    on_path_set.insert(next);
                }
            } else {
                visited.insert(node);
                on_path_set.remove(node);
                on_path.pop();
                stack.pop();
            }
        }
    }

    None
}

/// Compute longest-path-from-roots priorities for a DAG.
///
/// A task with no dependencies gets 0; otherwise `1 + max(priority of
/// dependencies)`. Lower runs first, so prerequisites sort ahead of their
/// dependents. Fails when the edges contain a cycle.
pub fn longest_path_priorities(
    task_ids: &[String],
    edges: &[(String, String)],
) -> Result<HashMap<String, i64>, SyncError> {
    if let Some(cycle) = find_cycle(edges) {
        return Err(SyncError::DependencyCycle(cycle.join(" -> ")));
    }

    let mut deps: HashMap<&str, Vec<&str>> = HashMap::new();
    for (task, dep) in edges {
        deps.entry(task.as_str()).or_default().push(dep.as_str());
    }

    fn depth<'a>(
        node: &'a str,
        deps: &HashMap<&'a str, Vec<&'a str>>,
        memo: &mut HashMap<&'a str, i64>,
    ) -> i64 {
        if let Some(&d) = memo.get(node) {
            return d;
        }
        let d = deps
            .get(node)
            .map(|children| {
                children
                    .iter()
                    .map(|c| depth(c, deps, memo) + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        memo.insert(node, d);
        d
    }

    let mut memo = HashMap::new();
    let mut priorities = HashMap::new();
    for id in task_ids {
        priorities.insert(id.clone(), depth(id.as_str(), &deps, &mut memo));
    }
    Ok(priorities)
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default = "default_config")]
    pub config: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_config() -> Value {
    serde_json::json!({})
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    pub version: i64,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Create a task under a project, validating its dependency edges.
pub async fn create_task(
    coord: &Coordinator,
    project_id: &str,
    req: &CreateTaskRequest,
) -> Result<Task, SyncError> {
    validate_project_id(project_id)?;
    project_db::get_project(&coord.pool, project_id)
        .await?
        .ok_or_else(|| SyncError::ProjectNotFound(project_id.to_owned()))?;

    let id = req
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    for dep in &req.depends_on {
        if dep == &id {
            return Err(SyncError::DependencyCycle(format!("{id} -> {id}")));
        }
        let dep_task = task_db::get_task(&coord.pool, dep)
            .await?
            .ok_or_else(|| SyncError::TaskNotFound(dep.clone()))?;
        if dep_task.project_id != project_id {
            return Err(SyncError::TaskNotFound(dep.clone()));
        }
    }

    // Guard against cycles through the existing graph.
    let mut edges = task_db::list_dependency_edges(&coord.pool, project_id).await?;
    for dep in &req.depends_on {
        edges.push((id.clone(), dep.clone()));
    }
    if let Some(cycle) = find_cycle(&edges) {
        if cycle.contains(&id) {
            return Err(SyncError::DependencyCycle(cycle.join(" -> ")));
        }
    }

    let task = task_db::insert_task(
        &coord.pool,
        &NewTask {
            id: &id,
            project_id,
            name: &req.name,
            prompt: &req.prompt,
            priority: req.priority.unwrap_or(0),
            config: &req.config,
        },
    )
    .await?;

    for dep in &req.depends_on {
        task_db::insert_dependency(&coord.pool, &id, dep).await?;
    }

    let clock = coord.clock.tick();
    sync_log::append(
        &coord.pool,
        &NewSyncLogEntry {
            project_id,
            task_id: Some(&id),
            node_id: None,
            operation: "create",
            old_value: None,
            new_value: Some(&serde_json::json!({
                "name": req.name,
                "priority": task.priority,
            })),
            logical_clock: clock,
        },
    )
    .await?;

    coord.bus.publish(BusEvent::TaskUpdate {
        project_id: project_id.to_owned(),
        task_id: id,
        status: task.status,
        version: task.sync_version,
    });

    Ok(task)
}

/// Queue a task for execution.
///
/// A task with unmet dependencies parks in `blocked` instead; it is
/// promoted automatically when the last dependency completes.
pub async fn queue_task(
    coord: &Coordinator,
    task_id: &str,
) -> Result<QueueOutcome, SyncError> {
    let task = task_db::get_task(&coord.pool, task_id)
        .await?
        .ok_or_else(|| SyncError::TaskNotFound(task_id.to_owned()))?;

    if !matches!(task.status, TaskStatus::Pending | TaskStatus::Blocked) {
        return Err(SyncError::InvalidStatus {
            task_id: task_id.to_owned(),
            status: task.status,
        });
    }

    let unmet = task_db::unmet_dependencies(&coord.pool, task_id).await?;
    let target = if unmet.is_empty() {
        TaskStatus::Queued
    } else {
        TaskStatus::Blocked
    };

    if task.status == target {
        return Ok(QueueOutcome {
            task_id: task_id.to_owned(),
            status: task.status,
            version: task.sync_version,
        });
    }

    let rows =
        task_db::transition_status(&coord.pool, task_id, task.status, target, None, None)
            .await?;
    if rows == 0 {
        let fresh = task_db::get_task(&coord.pool, task_id)
            .await?
            .ok_or_else(|| SyncError::TaskNotFound(task_id.to_owned()))?;
        return Err(SyncError::InvalidStatus {
            task_id: task_id.to_owned(),
            status: fresh.status,
        });
    }

    let clock = coord.clock.tick();
    sync_log::append(
        &coord.pool,
        &NewSyncLogEntry {
            project_id: &task.project_id,
            task_id: Some(task_id),
            node_id: None,
            operation: "queue",
            old_value: Some(&serde_json::json!({ "status": task.status })),
            new_value: Some(&serde_json::json!({ "status": target })),
            logical_clock: clock,
        },
    )
    .await?;

    coord.bus.publish(BusEvent::QueueUpdate {
        project_id: task.project_id.clone(),
    });

    tracing::info!(task_id, status = %target, unmet = unmet.len(), "task queued");

    Ok(QueueOutcome {
        task_id: task_id.to_owned(),
        status: target,
        version: task.sync_version + 1,
    })
}

/// Claim the next queued task for a project: lowest priority first.
///
/// Retries a bounded number of times when a concurrent claimer wins the
/// race on the head of the queue.
pub async fn claim_next(
    coord: &Coordinator,
    project_id: &str,
    node_id: &str,
    lock_duration: Option<i64>,
) -> Result<Option<ClaimGrant>, SyncError> {
    validate_project_id(project_id)?;

    for _ in 0..5 {
        let Some(task) =
            task_db::next_queued(&coord.pool, project_id, chrono::Utc::now()).await?
        else {
            return Ok(None);
        };

        let req = ClaimRequest {
            node_id: node_id.to_owned(),
            lock_duration,
        };
        match lock::claim(coord, &task.id, &req).await {
            Ok(grant) => return Ok(Some(grant)),
            Err(SyncError::AlreadyLocked { .. })
            | Err(SyncError::InvalidStatus { .. }) => continue,
            Err(other) => return Err(other),
        }
    }

    Ok(None)
}
