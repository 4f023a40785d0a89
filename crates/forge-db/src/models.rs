use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use sqlx::types::Json;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
///
/// `completed`, `failed`, `aborted`, and `skipped` are terminal: once
/// reached, only a `retry` intervention can move the task again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Blocked,
    Running,
    Paused,
    Completed,
    Failed,
    Aborted,
    Stuck,
    Skipped,
}

impl TaskStatus {
    /// Whether this status admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Aborted | Self::Skipped
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Blocked => "blocked",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::Stuck => "stuck",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "blocked" => Ok(Self::Blocked),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            "stuck" => Ok(Self::Stuck),
            "skipped" => Ok(Self::Skipped),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of an operator intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterventionKind {
    Pause,
    Abort,
    ReleaseLock,
    ForceStatus,
    Retry,
}

impl fmt::Display for InterventionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pause => "pause",
            Self::Abort => "abort",
            Self::ReleaseLock => "release_lock",
            Self::ForceStatus => "force_status",
            Self::Retry => "retry",
        };
        f.write_str(s)
    }
}

impl FromStr for InterventionKind {
    type Err = InterventionKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pause" => Ok(Self::Pause),
            "abort" => Ok(Self::Abort),
            "release_lock" => Ok(Self::ReleaseLock),
            "force_status" => Ok(Self::ForceStatus),
            "retry" => Ok(Self::Retry),
            other => Err(InterventionKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`InterventionKind`] string.
#[derive(Debug, Clone)]
pub struct InterventionKindParseError(pub String);

impl fmt::Display for InterventionKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid intervention kind: {:?}", self.0)
    }
}

impl std::error::Error for InterventionKindParseError {}

// ---------------------------------------------------------------------------

/// Lifecycle status of an intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InterventionStatus {
    Pending,
    Applied,
    Rejected,
}

impl fmt::Display for InterventionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

impl FromStr for InterventionStatus {
    type Err = InterventionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "applied" => Ok(Self::Applied),
            "rejected" => Ok(Self::Rejected),
            other => Err(InterventionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`InterventionStatus`] string.
#[derive(Debug, Clone)]
pub struct InterventionStatusParseError(pub String);

impl fmt::Display for InterventionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid intervention status: {:?}", self.0)
    }
}

impl std::error::Error for InterventionStatusParseError {}

// ---------------------------------------------------------------------------

/// Outcome of a single agent iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum IterationOutcome {
    Progress,
    Stuck,
    Error,
    GateFailed,
}

impl fmt::Display for IterationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Progress => "progress",
            Self::Stuck => "stuck",
            Self::Error => "error",
            Self::GateFailed => "gate-failed",
        };
        f.write_str(s)
    }
}

impl FromStr for IterationOutcome {
    type Err = IterationOutcomeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "progress" => Ok(Self::Progress),
            "stuck" => Ok(Self::Stuck),
            "error" => Ok(Self::Error),
            "gate-failed" => Ok(Self::GateFailed),
            other => Err(IterationOutcomeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`IterationOutcome`] string.
#[derive(Debug, Clone)]
pub struct IterationOutcomeParseError(pub String);

impl fmt::Display for IterationOutcomeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid iteration outcome: {:?}", self.0)
    }
}

impl std::error::Error for IterationOutcomeParseError {}

// ---------------------------------------------------------------------------

/// Kind of a registered node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Plugin,
    Dashboard,
    Cli,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Plugin => "plugin",
            Self::Dashboard => "dashboard",
            Self::Cli => "cli",
        };
        f.write_str(s)
    }
}

impl FromStr for NodeType {
    type Err = NodeTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plugin" => Ok(Self::Plugin),
            "dashboard" => Ok(Self::Dashboard),
            "cli" => Ok(Self::Cli),
            other => Err(NodeTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`NodeType`] string.
#[derive(Debug, Clone)]
pub struct NodeTypeParseError(pub String);

impl fmt::Display for NodeTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node type: {:?}", self.0)
    }
}

impl std::error::Error for NodeTypeParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A project -- a source workspace that owns tasks.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// A task -- the central entity held by the coordinator.
///
/// `sync_version` increments by one on every authoritative mutation;
/// `config` and `result` are opaque JSON documents owned by the agent side.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub prompt: String,
    pub priority: i64,
    pub status: TaskStatus,
    pub sync_version: i64,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub iteration: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub config: Json<Value>,
    pub result: Option<Json<Value>>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Whether `node_id` currently holds a live lease on this task.
    pub fn is_locked_by(&self, node_id: &str, now: DateTime<Utc>) -> bool {
        self.locked_by.as_deref() == Some(node_id)
            && self.lock_expires_at.is_some_and(|exp| exp > now)
    }
}

/// An edge in the task dependency DAG.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskDependency {
    pub task_id: String,
    pub depends_on: String,
}

/// A registered agent node.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Node {
    pub id: String,
    pub project_id: String,
    pub node_type: NodeType,
    pub display_name: Option<String>,
    pub capabilities: Json<Vec<String>>,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Window after which a silent node is considered offline.
pub const NODE_ONLINE_WINDOW_SECS: i64 = 300;

impl Node {
    /// Whether the node has been seen within the online window.
    pub fn is_online(&self, now: DateTime<Utc>) -> bool {
        now - self.last_seen_at <= Duration::seconds(NODE_ONLINE_WINDOW_SECS)
    }
}

/// An operator-originated command against a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Intervention {
    pub id: String,
    pub task_id: String,
    pub kind: InterventionKind,
    pub requested_by: String,
    pub reason: String,
    pub params: Json<Value>,
    pub status: InterventionStatus,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
}

/// An entry in the append-only sync log, ordered by the coordinator's
/// logical clock.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SyncLogEntry {
    pub id: i64,
    pub project_id: String,
    pub task_id: Option<String>,
    pub node_id: Option<String>,
    pub operation: String,
    pub old_value: Option<Json<Value>>,
    pub new_value: Option<Json<Value>>,
    pub logical_clock: i64,
    pub recorded_at: DateTime<Utc>,
}

/// An iteration record replicated from an agent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IterationRow {
    pub task_id: String,
    pub seq: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub token_estimate: i64,
    pub outcome: IterationOutcome,
    pub summary: String,
    pub criteria: Json<Value>,
    pub files_changed: Json<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::Queued,
            TaskStatus::Blocked,
            TaskStatus::Running,
            TaskStatus::Paused,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Aborted,
            TaskStatus::Stuck,
            TaskStatus::Skipped,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        let result = "bogus".parse::<TaskStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Aborted.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(!TaskStatus::Stuck.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
    }

    #[test]
    fn intervention_kind_display_roundtrip() {
        let variants = [
            InterventionKind::Pause,
            InterventionKind::Abort,
            InterventionKind::ReleaseLock,
            InterventionKind::ForceStatus,
            InterventionKind::Retry,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: InterventionKind = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn intervention_kind_wire_format_is_upper() {
        let json = serde_json::to_string(&InterventionKind::ReleaseLock).unwrap();
        assert_eq!(json, "\"RELEASE_LOCK\"");
        let parsed: InterventionKind = serde_json::from_str("\"PAUSE\"").unwrap();
        assert_eq!(parsed, InterventionKind::Pause);
    }

    #[test]
    fn intervention_status_display_roundtrip() {
        let variants = [
            InterventionStatus::Pending,
            InterventionStatus::Applied,
            InterventionStatus::Rejected,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: InterventionStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn iteration_outcome_display_roundtrip() {
        let variants = [
            IterationOutcome::Progress,
            IterationOutcome::Stuck,
            IterationOutcome::Error,
            IterationOutcome::GateFailed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: IterationOutcome = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn iteration_outcome_is_kebab() {
        assert_eq!(IterationOutcome::GateFailed.to_string(), "gate-failed");
    }

    #[test]
    fn node_type_display_roundtrip() {
        let variants = [NodeType::Plugin, NodeType::Dashboard, NodeType::Cli];
        for v in &variants {
            let s = v.to_string();
            let parsed: NodeType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn node_online_window() {
        let now = Utc::now();
        let node = Node {
            id: "node-1".into(),
            project_id: "proj-1".into(),
            node_type: NodeType::Plugin,
            display_name: None,
            capabilities: Json(vec![]),
            registered_at: now - Duration::hours(1),
            last_seen_at: now - Duration::seconds(200),
        };
        assert!(node.is_online(now));

        let stale = Node {
            last_seen_at: now - Duration::seconds(400),
            ..node
        };
        assert!(!stale.is_online(now));
    }

    #[test]
    fn task_lock_ownership() {
        let now = Utc::now();
        let task = Task {
            id: "t1".into(),
            project_id: "p1".into(),
            name: "task".into(),
            prompt: "do it".into(),
            priority: 0,
            status: TaskStatus::Running,
            sync_version: 2,
            locked_by: Some("node-a".into()),
            locked_at: Some(now),
            lock_expires_at: Some(now + Duration::minutes(5)),
            iteration: 1,
            started_at: Some(now),
            completed_at: None,
            config: Json(serde_json::json!({})),
            result: None,
            created_at: now,
        };
        assert!(task.is_locked_by("node-a", now));
        assert!(!task.is_locked_by("node-b", now));

        let expired = Task {
            lock_expires_at: Some(now - Duration::seconds(1)),
            ..task
        };
        assert!(!expired.is_locked_by("node-a", now));
    }
}
