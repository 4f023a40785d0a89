//! The coordinator HTTP server.
//!
//! A thin mapping from the `/api/v2/sync` + `/api` surface onto
//! `forge-core` operations. Handlers never hold state beyond the shared
//! [`Coordinator`]; the lock sweeper runs on an interval next to the
//! server and is also invocable through `POST /fix-expired-locks`.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use forge_core::error::validate_project_id;
use forge_core::intervention::{self, InterveneRequest};
use forge_core::lock::{self, ClaimRequest, HeartbeatRequest, ReleaseRequest};
use forge_core::queue::{self, CreateTaskRequest};
use forge_core::status;
use forge_core::sync::{
    self, HandshakeRequest, NodeRegisterRequest, PullRequest, PushRequest, TaskPush,
};
use forge_core::{Coordinator, SyncError};
use forge_db::config::DbConfig;
use forge_db::models::TaskStatus;
use forge_db::queries::iterations as iteration_db;
use forge_db::queries::nodes as node_db;
use forge_db::queries::projects as project_db;
use forge_db::queries::sync_log;
use forge_db::queries::tasks as task_db;

/// Default port when `PORT` is unset.
pub const DEFAULT_PORT: u16 = 3344;
/// Sweep cadence for expired leases.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        let status = match &err {
            SyncError::TaskNotFound(_)
            | SyncError::ProjectNotFound(_)
            | SyncError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            SyncError::InvalidStatus { .. }
            | SyncError::AlreadyLocked { .. }
            | SyncError::LockLost { .. } => StatusCode::CONFLICT,
            SyncError::MalformedProjectId(_) | SyncError::DependencyCycle(_) => {
                StatusCode::BAD_REQUEST
            }
            SyncError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: err.code().to_owned(),
            message: format!("{err:#}"),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "STORAGE_ERROR".to_owned(),
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = json!({ "error": self.code, "message": self.message });
        (self.status, Json(body)).into_response()
    }
}

fn not_found(code: &str, message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: code.to_owned(),
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(coord: Coordinator, cors_origin: Option<&str>) -> Router {
    let cors = match cors_origin {
        Some(origin) => match origin.parse::<HeaderValue>() {
            Ok(value) => CorsLayer::new()
                .allow_origin(value)
                .allow_methods(Any)
                .allow_headers(Any),
            Err(_) => {
                tracing::warn!(origin, "invalid CORS_ORIGIN, allowing any origin");
                CorsLayer::permissive()
            }
        },
        None => CorsLayer::permissive(),
    };

    Router::new()
        .route("/healthz", get(healthz))
        // Sync protocol surface.
        .route("/api/v2/sync/nodes/register", post(register_node))
        .route("/api/v2/sync/nodes/{node_id}/heartbeat", post(node_heartbeat))
        .route("/api/v2/sync/nodes/{project_id}", get(list_nodes))
        .route("/api/v2/sync/handshake/{project_id}", post(handshake))
        .route("/api/v2/sync/push/{project_id}", post(push))
        .route("/api/v2/sync/pull/{project_id}", post(pull))
        .route("/api/v2/sync/tasks/{task_id}/claim", post(claim))
        .route("/api/v2/sync/tasks/{task_id}/heartbeat", post(task_heartbeat))
        .route("/api/v2/sync/tasks/{task_id}/release", post(release))
        .route("/api/v2/sync/intervene", post(intervene))
        .route("/api/v2/sync/status/{project_id}", get(project_status))
        .route("/api/v2/sync/log/{project_id}", get(log_tail))
        .route("/api/v2/sync/fix-expired-locks", post(fix_expired_locks))
        // Convenience / CRUD surface.
        .route("/api/projects", post(create_project).get(list_projects))
        .route("/api/projects/{project_id}", get(get_project))
        .route(
            "/api/projects/{project_id}/tasks",
            post(create_task).get(list_tasks),
        )
        .route("/api/tasks/{task_id}", get(get_task))
        .route("/api/tasks/{task_id}/queue", post(queue_task))
        .route("/api/tasks/{task_id}/complete", post(complete_task))
        .route("/api/tasks/{task_id}/iterations", get(list_iterations))
        .route("/api/projects/{project_id}/claim-task", post(claim_next_task))
        .route(
            "/api/projects/{project_id}/task-defs/{task_id}/status",
            post(task_def_status),
        )
        .layer(cors)
        .with_state(coord)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(host: Option<String>, port: Option<u16>) -> Result<()> {
    let host = host
        .or_else(|| std::env::var("HOST").ok())
        .unwrap_or_else(|| "0.0.0.0".to_owned());
    let port = port
        .or_else(|| {
            std::env::var("PORT")
                .ok()
                .and_then(|value| value.parse().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let cors_origin = std::env::var("CORS_ORIGIN").ok();

    let coord = Coordinator::open(&DbConfig::from_env()).await?;

    // Background sweeper: expired leases become stuck tasks.
    let cancel = CancellationToken::new();
    let sweeper = {
        let coord = coord.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match lock::sweep_expired_locks(&coord).await {
                            Ok(swept) if !swept.is_empty() => {
                                tracing::info!(count = swept.len(), "sweeper marked tasks stuck");
                            }
                            Ok(_) => {}
                            Err(err) => {
                                tracing::warn!(error = %err, "sweeper pass failed");
                            }
                        }
                    }
                }
            }
        })
    };

    let app = build_router(coord, cors_origin.as_deref());
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    tracing::info!("forge coordinator listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    let _ = sweeper.await;
    tracing::info!("forge coordinator shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Sync protocol handlers
// ---------------------------------------------------------------------------

async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn register_node(
    State(coord): State<Coordinator>,
    Json(req): Json<NodeRegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let resp = sync::register_node(&coord, &req).await?;
    Ok(Json(resp))
}

async fn node_heartbeat(
    State(coord): State<Coordinator>,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let rows = node_db::touch_node(&coord.pool, &node_id, chrono::Utc::now())
        .await
        .map_err(SyncError::from)?;
    if rows == 0 {
        return Err(SyncError::NodeNotFound(node_id).into());
    }
    Ok(Json(json!({ "ok": true, "serverClock": coord.clock.value() })))
}

async fn list_nodes(
    State(coord): State<Coordinator>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let nodes = sync::list_nodes(&coord, &project_id).await?;
    Ok(Json(json!({
        "nodes": nodes,
        "serverClock": coord.clock.value(),
    })))
}

async fn handshake(
    State(coord): State<Coordinator>,
    Path(project_id): Path<String>,
    Json(req): Json<HandshakeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let resp = sync::handshake(&coord, &project_id, &req).await?;
    Ok(Json(resp))
}

async fn push(
    State(coord): State<Coordinator>,
    Path(project_id): Path<String>,
    Json(req): Json<PushRequest>,
) -> Result<impl IntoResponse, AppError> {
    let resp = sync::push(&coord, &project_id, &req).await?;
    Ok(Json(resp))
}

async fn pull(
    State(coord): State<Coordinator>,
    Path(project_id): Path<String>,
    Json(req): Json<PullRequest>,
) -> Result<impl IntoResponse, AppError> {
    let resp = sync::pull(&coord, &project_id, &req).await?;
    Ok(Json(resp))
}

async fn claim(
    State(coord): State<Coordinator>,
    Path(task_id): Path<String>,
    Json(req): Json<ClaimRequest>,
) -> Result<impl IntoResponse, AppError> {
    let grant = lock::claim(&coord, &task_id, &req).await?;
    Ok(Json(json!({ "success": true, "task": grant })))
}

async fn task_heartbeat(
    State(coord): State<Coordinator>,
    Path(task_id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse, AppError> {
    let resp = lock::heartbeat(&coord, &task_id, &req).await?;
    Ok(Json(resp))
}

async fn release(
    State(coord): State<Coordinator>,
    Path(task_id): Path<String>,
    Json(req): Json<ReleaseRequest>,
) -> Result<impl IntoResponse, AppError> {
    lock::release(&coord, &task_id, &req).await?;
    Ok(Json(json!({ "ok": true, "serverClock": coord.clock.value() })))
}

async fn intervene(
    State(coord): State<Coordinator>,
    Json(req): Json<InterveneRequest>,
) -> Result<impl IntoResponse, AppError> {
    let resp = intervention::intervene(&coord, &req).await?;
    Ok(Json(resp))
}

async fn project_status(
    State(coord): State<Coordinator>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let resp = status::project_status(&coord, &project_id).await?;
    Ok(Json(resp))
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    limit: Option<i64>,
}

async fn log_tail(
    State(coord): State<Coordinator>,
    Path(project_id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<impl IntoResponse, AppError> {
    validate_project_id(&project_id)?;
    let limit = query.limit.unwrap_or(50).clamp(1, 1000);
    let entries = sync_log::tail(&coord.pool, &project_id, limit)
        .await
        .map_err(SyncError::from)?;
    Ok(Json(json!({
        "entries": entries,
        "serverClock": coord.clock.value(),
    })))
}

async fn fix_expired_locks(
    State(coord): State<Coordinator>,
) -> Result<impl IntoResponse, AppError> {
    let swept = lock::sweep_expired_locks(&coord).await?;
    let ids: Vec<&str> = swept.iter().map(|task| task.id.as_str()).collect();
    Ok(Json(json!({
        "swept": ids,
        "serverClock": coord.clock.value(),
    })))
}

// ---------------------------------------------------------------------------
// CRUD / convenience handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateProjectRequest {
    id: Option<String>,
    name: String,
    path: String,
}

async fn create_project(
    State(coord): State<Coordinator>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, AppError> {
    let id = req
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    validate_project_id(&id)?;
    let project = project_db::upsert_project(&coord.pool, &id, &req.name, &req.path)
        .await
        .map_err(SyncError::from)?;
    Ok(Json(project))
}

async fn list_projects(
    State(coord): State<Coordinator>,
) -> Result<impl IntoResponse, AppError> {
    let projects = project_db::list_projects(&coord.pool)
        .await
        .map_err(SyncError::from)?;
    Ok(Json(projects))
}

async fn get_project(
    State(coord): State<Coordinator>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let project = project_db::get_project(&coord.pool, &project_id)
        .await
        .map_err(SyncError::from)?
        .ok_or_else(|| not_found("PROJECT_NOT_FOUND", format!("project {project_id} not found")))?;
    Ok(Json(project))
}

async fn create_task(
    State(coord): State<Coordinator>,
    Path(project_id): Path<String>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, AppError> {
    let task = queue::create_task(&coord, &project_id, &req).await?;
    Ok(Json(task))
}

async fn list_tasks(
    State(coord): State<Coordinator>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let tasks = task_db::list_tasks_for_project(&coord.pool, &project_id)
        .await
        .map_err(SyncError::from)?;
    Ok(Json(tasks))
}

async fn get_task(
    State(coord): State<Coordinator>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let task = task_db::get_task(&coord.pool, &task_id)
        .await
        .map_err(SyncError::from)?
        .ok_or_else(|| not_found("TASK_NOT_FOUND", format!("task {task_id} not found")))?;
    Ok(Json(task))
}

async fn queue_task(
    State(coord): State<Coordinator>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = queue::queue_task(&coord, &task_id).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteTaskRequest {
    node_id: String,
    #[serde(default)]
    result: Option<serde_json::Value>,
}

async fn complete_task(
    State(coord): State<Coordinator>,
    Path(task_id): Path<String>,
    Json(req): Json<CompleteTaskRequest>,
) -> Result<impl IntoResponse, AppError> {
    let task = task_db::get_task(&coord.pool, &task_id)
        .await
        .map_err(SyncError::from)?
        .ok_or_else(|| not_found("TASK_NOT_FOUND", format!("task {task_id} not found")))?;

    let push_req = PushRequest {
        node_id: req.node_id,
        local_clock: 0,
        tasks: vec![TaskPush {
            id: task_id,
            expected_version: task.sync_version,
            status: TaskStatus::Completed,
            result: req.result,
            iteration: None,
        }],
    };
    let resp = sync::push(&coord, &task.project_id, &push_req).await?;
    let result = resp.results.into_iter().next();
    Ok(Json(json!({
        "result": result,
        "serverClock": resp.server_clock,
    })))
}

async fn list_iterations(
    State(coord): State<Coordinator>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let iterations = iteration_db::list_for_task(&coord.pool, &task_id)
        .await
        .map_err(SyncError::from)?;
    Ok(Json(json!({
        "iterations": iterations,
        "serverClock": coord.clock.value(),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimNextRequest {
    node_id: String,
    #[serde(default)]
    lock_duration: Option<i64>,
}

async fn claim_next_task(
    State(coord): State<Coordinator>,
    Path(project_id): Path<String>,
    Json(req): Json<ClaimNextRequest>,
) -> Result<impl IntoResponse, AppError> {
    let grant =
        queue::claim_next(&coord, &project_id, &req.node_id, req.lock_duration).await?;
    Ok(Json(json!({
        "task": grant,
        "serverClock": coord.clock.value(),
    })))
}

/// Status-update target used by the agent outbox: a single-task push.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskDefStatusRequest {
    node_id: String,
    status: TaskStatus,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    iteration: Option<i64>,
    expected_version: i64,
}

async fn task_def_status(
    State(coord): State<Coordinator>,
    Path((project_id, task_id)): Path<(String, String)>,
    Json(req): Json<TaskDefStatusRequest>,
) -> Result<impl IntoResponse, AppError> {
    let push_req = PushRequest {
        node_id: req.node_id,
        local_clock: 0,
        tasks: vec![TaskPush {
            id: task_id,
            expected_version: req.expected_version,
            status: req.status,
            result: req.result,
            iteration: req.iteration,
        }],
    };
    let resp = sync::push(&coord, &project_id, &push_req).await?;
    let result = resp
        .results
        .into_iter()
        .next()
        .expect("single-task push yields one result");

    let mut body = serde_json::to_value(&result).map_err(anyhow::Error::from)?;
    body["serverClock"] = json!(resp.server_clock);
    Ok(Json(body))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use forge_core::Coordinator;
    use forge_test_utils::{TestDb, create_test_db};

    // -----------------------------------------------------------------
    // HTTP helpers
    // -----------------------------------------------------------------

    async fn setup() -> (TestDb, Coordinator, Router) {
        let db = create_test_db().await;
        let coord = Coordinator::from_pool(db.pool.clone())
            .await
            .expect("coordinator should build");
        let router = super::build_router(coord.clone(), None);
        (db, coord, router)
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = match body {
            Some(body) => Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    /// Create a project and a queued task; returns the task id.
    async fn seed_queued_task(app: &Router) -> String {
        let (status, _) = send(
            app,
            "POST",
            "/api/projects",
            Some(json!({ "id": "proj-1", "name": "Project One", "path": "/tmp/p" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, task) = send(
            app,
            "POST",
            "/api/projects/proj-1/tasks",
            Some(json!({
                "id": "t1",
                "name": "task one",
                "prompt": "create OUT.txt",
                "config": {
                    "criteria": [
                        { "name": "out", "type": "file-exists", "path": "OUT.txt", "required": true }
                    ],
                    "mode": "all"
                }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "create task: {task}");

        let (status, queued) = send(app, "POST", "/api/tasks/t1/queue", Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(queued["status"], "queued");

        "t1".to_owned()
    }

    // -----------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------

    #[tokio::test]
    async fn healthz_is_ok() {
        let (_db, _coord, app) = setup().await;
        let (status, body) = send(&app, "GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn full_claim_heartbeat_complete_flow() {
        // Queued task, node claims it (version 2), heartbeats, then the
        // outbox-style status route pushes completed (version 3).
        let (_db, _coord, app) = setup().await;
        seed_queued_task(&app).await;

        let (status, claim) = send(
            &app,
            "POST",
            "/api/v2/sync/tasks/t1/claim",
            Some(json!({ "nodeId": "node-a" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "claim: {claim}");
        assert_eq!(claim["success"], true);
        assert_eq!(claim["task"]["version"], 2);
        assert_eq!(claim["task"]["prompt"], "create OUT.txt");

        let (status, hb) = send(
            &app,
            "POST",
            "/api/v2/sync/tasks/t1/heartbeat",
            Some(json!({ "nodeId": "node-a", "iteration": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "heartbeat: {hb}");
        assert!(hb["commands"].as_array().unwrap().is_empty());

        // Progress replication bumped the version to 3; push at 3 lands at 4.
        let (status, pushed) = send(
            &app,
            "POST",
            "/api/projects/proj-1/task-defs/t1/status",
            Some(json!({
                "nodeId": "node-a",
                "status": "completed",
                "result": { "success": true },
                "iteration": 1,
                "expectedVersion": hb["syncVersion"],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "status push: {pushed}");
        assert_eq!(pushed["success"], true, "push result: {pushed}");

        let (status, task) = send(&app, "GET", "/api/tasks/t1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(task["status"], "completed");
        assert!(task["locked_by"].is_null());
        assert!(!task["completed_at"].is_null());
    }

    #[tokio::test]
    async fn second_claim_conflicts() {
        let (_db, _coord, app) = setup().await;
        seed_queued_task(&app).await;

        let (status, _) = send(
            &app,
            "POST",
            "/api/v2/sync/tasks/t1/claim",
            Some(json!({ "nodeId": "node-a" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            "POST",
            "/api/v2/sync/tasks/t1/claim",
            Some(json!({ "nodeId": "node-b" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "ALREADY_LOCKED");
        assert!(
            body["message"].as_str().unwrap().contains("node-a"),
            "message names the owner: {body}"
        );
    }

    #[tokio::test]
    async fn heartbeat_by_non_owner_is_lock_lost() {
        let (_db, _coord, app) = setup().await;
        seed_queued_task(&app).await;
        send(
            &app,
            "POST",
            "/api/v2/sync/tasks/t1/claim",
            Some(json!({ "nodeId": "node-a" })),
        )
        .await;

        let (status, body) = send(
            &app,
            "POST",
            "/api/v2/sync/tasks/t1/heartbeat",
            Some(json!({ "nodeId": "node-b" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "LOCK_LOST");
    }

    #[tokio::test]
    async fn sweep_then_retry_intervention() {
        // Claim with a zero-length lease, sweep, observe stuck, then RETRY
        // returns the task to the queue with iteration reset.
        let (_db, _coord, app) = setup().await;
        seed_queued_task(&app).await;

        send(
            &app,
            "POST",
            "/api/v2/sync/tasks/t1/claim",
            Some(json!({ "nodeId": "node-a", "lockDuration": 0 })),
        )
        .await;

        let (status, swept) =
            send(&app, "POST", "/api/v2/sync/fix-expired-locks", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(swept["swept"], json!(["t1"]));

        let (_, task) = send(&app, "GET", "/api/tasks/t1", None).await;
        assert_eq!(task["status"], "stuck");

        let (status, intervened) = send(
            &app,
            "POST",
            "/api/v2/sync/intervene",
            Some(json!({
                "type": "RETRY",
                "taskId": "t1",
                "requestedBy": "operator",
                "reason": "lease expired",
                "params": { "resetIteration": true }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(intervened["status"], "applied");

        let (_, task) = send(&app, "GET", "/api/tasks/t1", None).await;
        assert_eq!(task["status"], "queued");
        assert_eq!(task["iteration"], 0);
        assert!(task["result"].is_null());
    }

    #[tokio::test]
    async fn claim_task_convenience_picks_queue_head() {
        let (_db, _coord, app) = setup().await;
        seed_queued_task(&app).await;

        let (status, body) = send(
            &app,
            "POST",
            "/api/projects/proj-1/claim-task",
            Some(json!({ "nodeId": "node-a" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["task"]["taskId"], "t1");

        // Queue is now empty.
        let (status, body) = send(
            &app,
            "POST",
            "/api/projects/proj-1/claim-task",
            Some(json!({ "nodeId": "node-b" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["task"].is_null());
    }

    #[tokio::test]
    async fn status_and_log_read_back() {
        let (_db, _coord, app) = setup().await;
        seed_queued_task(&app).await;
        send(
            &app,
            "POST",
            "/api/v2/sync/tasks/t1/claim",
            Some(json!({ "nodeId": "node-a" })),
        )
        .await;

        let (status, body) = send(&app, "GET", "/api/v2/sync/status/proj-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tasks"]["running"], 1);
        assert_eq!(body["tasks"]["total"], 1);

        let (status, body) =
            send(&app, "GET", "/api/v2/sync/log/proj-1?limit=10", None).await;
        assert_eq!(status, StatusCode::OK);
        let entries = body["entries"].as_array().unwrap();
        assert!(!entries.is_empty());
        assert_eq!(entries[0]["operation"], "claim");
    }

    #[tokio::test]
    async fn handshake_and_pull_over_http() {
        let (_db, _coord, app) = setup().await;
        seed_queued_task(&app).await;

        let (status, shake) = send(
            &app,
            "POST",
            "/api/v2/sync/handshake/proj-1",
            Some(json!({ "nodeId": "node-a", "localClock": 0, "taskVersions": {} })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(shake["needsPull"], json!(["t1"]));

        let (status, pulled) = send(
            &app,
            "POST",
            "/api/v2/sync/pull/proj-1",
            Some(json!({ "taskIds": ["t1", "ghost"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let tasks = pulled["tasks"].as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["id"], "t1");
    }

    #[tokio::test]
    async fn node_registration_and_listing() {
        let (_db, _coord, app) = setup().await;
        send(
            &app,
            "POST",
            "/api/projects",
            Some(json!({ "id": "proj-1", "name": "P", "path": "/tmp/p" })),
        )
        .await;

        let (status, body) = send(
            &app,
            "POST",
            "/api/v2/sync/nodes/register",
            Some(json!({
                "nodeId": "node-a",
                "projectId": "proj-1",
                "nodeType": "plugin",
                "displayName": "workspace one",
                "capabilities": ["iterate"]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "register: {body}");

        let (status, _) = send(
            &app,
            "POST",
            "/api/v2/sync/nodes/node-a/heartbeat",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, "GET", "/api/v2/sync/nodes/proj-1", None).await;
        assert_eq!(status, StatusCode::OK);
        let nodes = body["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0]["nodeId"], "node-a");
        assert_eq!(nodes[0]["isOnline"], true);
    }

    #[tokio::test]
    async fn malformed_project_id_is_bad_request() {
        let (_db, _coord, app) = setup().await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/v2/sync/handshake/..%2Fetc",
            Some(json!({ "nodeId": "node-a", "localClock": 0, "taskVersions": {} })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "MALFORMED_PROJECT_ID");
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let (_db, _coord, app) = setup().await;
        let (status, body) = send(&app, "GET", "/api/tasks/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "TASK_NOT_FOUND");
    }
}
