//! Typed HTTP client for the coordinator.
//!
//! Every call carries an explicit deadline: list-style operations 5 s,
//! status writes 10 s, health probes 3 s. The driver talks through the
//! [`CoordinatorApi`] trait so tests can substitute a mock coordinator.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use forge_db::models::TaskStatus;
use forge_core::lock::{ClaimGrant, HeartbeatRequest, HeartbeatResponse, ReleaseRequest};
use forge_core::sync::{
    HandshakeRequest, HandshakeResponse, NodeRegisterRequest, NodeRegisterResponse,
    PullRequest, PullResponse, PushRequest, PushResponse, PushTaskResult,
};

/// Timeout for list-style coordinator calls.
pub const LIST_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for status updates.
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for health probes.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// A terminal status update bound for the coordinator (the outbox payload).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub project_id: String,
    pub task_id: String,
    pub node_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub iteration: Option<i64>,
    pub expected_version: i64,
}

/// The coordinator surface the agent depends on.
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    async fn register_node(
        &self,
        req: &NodeRegisterRequest,
    ) -> Result<NodeRegisterResponse>;

    async fn handshake(
        &self,
        project_id: &str,
        req: &HandshakeRequest,
    ) -> Result<HandshakeResponse>;

    async fn push(&self, project_id: &str, req: &PushRequest) -> Result<PushResponse>;

    async fn pull(&self, project_id: &str, req: &PullRequest) -> Result<PullResponse>;

    /// Claim the next queued task of the project; `None` when the queue is
    /// empty.
    async fn claim_next(
        &self,
        project_id: &str,
        node_id: &str,
    ) -> Result<Option<ClaimGrant>>;

    async fn heartbeat(
        &self,
        task_id: &str,
        req: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse>;

    async fn release(&self, task_id: &str, req: &ReleaseRequest) -> Result<()>;

    /// Deliver a terminal status update. Succeeds when the coordinator
    /// durably accepted (or already had) the update.
    async fn post_status(&self, update: &StatusUpdate) -> Result<()>;

    /// Whether the coordinator answers at all.
    async fn health(&self) -> bool;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Coordinator client over HTTP.
#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusPostResponse {
    #[serde(flatten)]
    result: PushTaskResult,
    #[allow(dead_code)]
    server_clock: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimNextResponse {
    #[serde(default)]
    task: Option<ClaimGrant>,
    #[allow(dead_code)]
    server_clock: Option<i64>,
}

impl CoordinatorClient {
    /// Build a client for the given base URL (e.g. `http://localhost:3344`).
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post_json<B: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<R> {
        let response = self
            .http
            .post(self.url(path))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {path} failed"))?;

        Self::decode(path, response).await
    }

    async fn decode<R: serde::de::DeserializeOwned>(
        path: &str,
        response: reqwest::Response,
    ) -> Result<R> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .with_context(|| format!("failed to decode response from {path}"));
        }

        let body: ErrorBody = response.json().await.unwrap_or(ErrorBody {
            error: None,
            message: None,
        });
        bail!(
            "{path} returned {status}: {} ({})",
            body.error.unwrap_or_else(|| "UNKNOWN".into()),
            body.message.unwrap_or_default()
        );
    }
}

impl CoordinatorClient {
    /// Create (or upsert) a project. Used by `forge register`.
    pub async fn create_project(
        &self,
        id: &str,
        name: &str,
        path: &str,
    ) -> Result<Value> {
        let body = serde_json::json!({ "id": id, "name": name, "path": path });
        self.post_json("/api/projects", &body, LIST_TIMEOUT).await
    }

    /// Create a task under a project. Used by `forge queue-tasks`.
    pub async fn create_task(
        &self,
        project_id: &str,
        req: &forge_core::queue::CreateTaskRequest,
    ) -> Result<Value> {
        self.post_json(
            &format!("/api/projects/{project_id}/tasks"),
            req,
            LIST_TIMEOUT,
        )
        .await
    }

    /// Queue a created task.
    pub async fn queue_task(
        &self,
        task_id: &str,
    ) -> Result<forge_core::queue::QueueOutcome> {
        self.post_json(
            &format!("/api/tasks/{task_id}/queue"),
            &serde_json::json!({}),
            LIST_TIMEOUT,
        )
        .await
    }
}

#[async_trait]
impl CoordinatorApi for CoordinatorClient {
    async fn register_node(
        &self,
        req: &NodeRegisterRequest,
    ) -> Result<NodeRegisterResponse> {
        self.post_json("/api/v2/sync/nodes/register", req, LIST_TIMEOUT)
            .await
    }

    async fn handshake(
        &self,
        project_id: &str,
        req: &HandshakeRequest,
    ) -> Result<HandshakeResponse> {
        self.post_json(
            &format!("/api/v2/sync/handshake/{project_id}"),
            req,
            LIST_TIMEOUT,
        )
        .await
    }

    async fn push(&self, project_id: &str, req: &PushRequest) -> Result<PushResponse> {
        self.post_json(
            &format!("/api/v2/sync/push/{project_id}"),
            req,
            STATUS_TIMEOUT,
        )
        .await
    }

    async fn pull(&self, project_id: &str, req: &PullRequest) -> Result<PullResponse> {
        self.post_json(
            &format!("/api/v2/sync/pull/{project_id}"),
            req,
            LIST_TIMEOUT,
        )
        .await
    }

    async fn claim_next(
        &self,
        project_id: &str,
        node_id: &str,
    ) -> Result<Option<ClaimGrant>> {
        let body = serde_json::json!({ "nodeId": node_id });
        let response: ClaimNextResponse = self
            .post_json(
                &format!("/api/projects/{project_id}/claim-task"),
                &body,
                LIST_TIMEOUT,
            )
            .await?;
        Ok(response.task)
    }

    async fn heartbeat(
        &self,
        task_id: &str,
        req: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse> {
        self.post_json(
            &format!("/api/v2/sync/tasks/{task_id}/heartbeat"),
            req,
            STATUS_TIMEOUT,
        )
        .await
    }

    async fn release(&self, task_id: &str, req: &ReleaseRequest) -> Result<()> {
        let _: Value = self
            .post_json(
                &format!("/api/v2/sync/tasks/{task_id}/release"),
                req,
                STATUS_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    async fn post_status(&self, update: &StatusUpdate) -> Result<()> {
        let path = format!(
            "/api/projects/{}/task-defs/{}/status",
            update.project_id, update.task_id
        );
        let response: StatusPostResponse =
            self.post_json(&path, update, STATUS_TIMEOUT).await?;

        // A 200 with a rejection code means the coordinator has authoritative
        // state this update can never overwrite; retrying is pointless, so
        // the delivery counts.
        if !response.result.success {
            tracing::warn!(
                task_id = %update.task_id,
                error = ?response.result.error,
                "status update absorbed by coordinator without applying"
            );
        }
        Ok(())
    }

    async fn health(&self) -> bool {
        let result = self
            .http
            .get(self.url("/healthz"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;
        matches!(result, Ok(resp) if resp.status() == StatusCode::OK)
    }
}
