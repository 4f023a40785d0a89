//! Agent local state: the single active task per workspace.
//!
//! Persisted to `.forge/state.json` after every tick (atomic write), so a
//! crashed agent resumes where it left off.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use forge_db::models::{IterationOutcome, TaskStatus};

use crate::checkpoint::{CheckpointPolicy, CheckpointRecord};
use crate::criteria::{AggregationMode, Criterion};
use crate::gates::QualityGate;
use crate::layout::{read_json, write_json_atomic};
use crate::stuck::StuckConfig;

/// Bounded length of the iteration history.
pub const HISTORY_LIMIT: usize = 50;

// ---------------------------------------------------------------------------
// Task config
// ---------------------------------------------------------------------------

/// Optional spend ceilings for a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
    #[serde(default)]
    pub max_tokens: Option<i64>,
}

/// The embedded task configuration carried in the coordinator's task row
/// and interpreted entirely on the agent side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    #[serde(default)]
    pub criteria: Vec<Criterion>,
    #[serde(default)]
    pub mode: AggregationMode,
    /// Completion bar for `weighted` mode.
    #[serde(default)]
    pub required_score: f64,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_iterations: i64,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub checkpoints: CheckpointPolicy,
    #[serde(default)]
    pub stuck: StuckConfig,
    #[serde(default)]
    pub budget: Option<Budget>,
    #[serde(default)]
    pub gates: Vec<QualityGate>,
}

impl TaskConfig {
    /// Parse the opaque config document a claim grant carries.
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone()).context("failed to parse task config")
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// The agent's view of its active task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub sync_version: i64,
}

/// One completed iteration, as kept in the bounded history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationEntry {
    pub seq: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub token_estimate: i64,
    pub outcome: IterationOutcome,
    pub summary: String,
    /// Fraction of criteria that passed this iteration; 0 when none ran.
    pub pass_rate: f64,
    /// Whether any criteria produced results this iteration.
    pub had_criteria: bool,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationState {
    pub current: i64,
    pub max: i64,
    pub current_started_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<IterationEntry>,
}

/// Running totals across the task's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub total_tokens: i64,
    pub total_duration_ms: i64,
    #[serde(default)]
    pub files_touched: Vec<String>,
}

impl Metrics {
    /// Merge newly observed files, preserving order, without duplicates.
    pub fn merge_files(&mut self, files: &[String]) {
        for file in files {
            if !self.files_touched.contains(file) {
                self.files_touched.push(file.clone());
            }
        }
    }
}

/// Link back to the coordinator, present when the workspace is registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorLink {
    pub url: String,
    pub project_id: String,
    pub task_id: String,
    pub node_id: String,
}

/// The whole agent state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub task: TaskRef,
    pub iteration: IterationState,
    pub config: TaskConfig,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub checkpoints: Vec<CheckpointRecord>,
    #[serde(default)]
    pub link: Option<CoordinatorLink>,
}

impl AgentState {
    /// Fresh state for a newly claimed task, starting at iteration 1.
    pub fn for_new_task(
        task: TaskRef,
        config: TaskConfig,
        link: Option<CoordinatorLink>,
    ) -> Self {
        let max = config.max_iterations;
        Self {
            task,
            iteration: IterationState {
                current: 1,
                max,
                current_started_at: Utc::now(),
                history: Vec::new(),
            },
            config,
            metrics: Metrics::default(),
            checkpoints: Vec::new(),
            link,
        }
    }

    /// Append to the bounded history, dropping the oldest entries.
    pub fn push_history(&mut self, entry: IterationEntry) {
        self.iteration.history.push(entry);
        if self.iteration.history.len() > HISTORY_LIMIT {
            let excess = self.iteration.history.len() - HISTORY_LIMIT;
            self.iteration.history.drain(..excess);
        }
    }

    /// Load from `state.json`; `None` when no task is active.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        read_json(path)
    }

    /// Persist atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }
}
