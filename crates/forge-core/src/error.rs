use chrono::{DateTime, Utc};
use thiserror::Error;

use forge_db::models::TaskStatus;

/// Errors surfaced by coordinator operations.
///
/// Per-task push rejections (`VERSION_CONFLICT`, `INVALID_TRANSITION`,
/// `TERMINAL_STATE`) are not errors at this level; they travel inside the
/// push response body. These variants map onto the protocol's error codes
/// and HTTP statuses.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("project {0} not found")]
    ProjectNotFound(String),

    #[error("node {0} is not registered")]
    NodeNotFound(String),

    #[error("task {task_id} cannot be claimed from status {status}")]
    InvalidStatus {
        task_id: String,
        status: TaskStatus,
    },

    #[error("task {task_id} is locked by {owner} until {expires_at}")]
    AlreadyLocked {
        task_id: String,
        owner: String,
        expires_at: DateTime<Utc>,
    },

    #[error("node {node_id} does not hold the lock on task {task_id}")]
    LockLost { task_id: String, node_id: String },

    #[error("malformed project id {0:?}: path-like identifiers are refused")]
    MalformedProjectId(String),

    #[error("dependency cycle detected: {0}")]
    DependencyCycle(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl SyncError {
    /// The protocol error code carried in the response's `error` field.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TaskNotFound(_) => "TASK_NOT_FOUND",
            Self::ProjectNotFound(_) => "PROJECT_NOT_FOUND",
            Self::NodeNotFound(_) => "NODE_NOT_FOUND",
            Self::InvalidStatus { .. } => "INVALID_STATUS",
            Self::AlreadyLocked { .. } => "ALREADY_LOCKED",
            Self::LockLost { .. } => "LOCK_LOST",
            Self::MalformedProjectId(_) => "MALFORMED_PROJECT_ID",
            Self::DependencyCycle(_) => "DEPENDENCY_CYCLE",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }
}

/// Validate a project identifier.
///
/// Some clients fall back to the workspace path when no registration
/// exists; such local-only placeholders must never reach reconciliation.
pub fn validate_project_id(id: &str) -> Result<(), SyncError> {
    if id.is_empty()
        || id.starts_with('.')
        || id.contains('/')
        || id.contains('\\')
        || id.chars().any(char::is_whitespace)
    {
        return Err(SyncError::MalformedProjectId(id.to_owned()));
    }
    Ok(())
}
