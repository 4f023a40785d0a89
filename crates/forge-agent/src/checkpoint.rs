//! Checkpoint manager: working-tree snapshots via git stash objects.
//!
//! `create` stages everything (tracked and untracked), asks git for a stash
//! commit without touching the working tree, and unstages again. The
//! resulting ref is content-addressed; a clean tree records the literal
//! `"clean"`, and an unavailable git records `"none"`. Rollback applies the
//! ref and is a no-op for both sentinels. Snapshot failures are logged and
//! never fatal -- the task continues with metadata updated.

use std::path::PathBuf;
use std::process::Command;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::state::Metrics;

/// Stash ref recorded when the working tree had nothing to snapshot.
pub const STASH_CLEAN: &str = "clean";
/// Stash ref recorded when stashing was unavailable.
pub const STASH_NONE: &str = "none";

/// Errors from git plumbing.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },
}

/// Checkpoint kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Auto,
    Manual,
}

/// Auto-checkpoint policy, part of the task config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointPolicy {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Create an auto checkpoint every `interval` iterations.
    #[serde(default = "default_interval")]
    pub interval: i64,
    /// Checkpoints kept before pruning oldest-first.
    #[serde(default = "default_keep")]
    pub keep: usize,
}

fn default_enabled() -> bool {
    true
}
fn default_interval() -> i64 {
    5
}
fn default_keep() -> usize {
    3
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval: default_interval(),
            keep: default_keep(),
        }
    }
}

impl CheckpointPolicy {
    /// Whether an auto checkpoint is due at this iteration.
    pub fn is_due(&self, iteration: i64) -> bool {
        self.enabled && self.interval > 0 && iteration % self.interval == 0
    }
}

/// A recorded checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    pub id: String,
    pub iteration: i64,
    pub kind: CheckpointKind,
    pub stash_ref: String,
    pub created_at: DateTime<Utc>,
    pub metrics: Metrics,
}

/// Creates and restores working-tree snapshots for one workspace.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    workdir: PathBuf,
}

impl CheckpointManager {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Snapshot the working tree.
    ///
    /// Never fails the caller: when git is unavailable or the stash cannot
    /// be created, the record carries the `"none"` ref and a warning is
    /// logged.
    pub fn create(
        &self,
        iteration: i64,
        kind: CheckpointKind,
        metrics: &Metrics,
    ) -> CheckpointRecord {
        let stash_ref = match self.snapshot_tree() {
            Ok(reference) => reference,
            Err(err) => {
                tracing::warn!(error = %err, "checkpoint snapshot failed (non-fatal)");
                STASH_NONE.to_owned()
            }
        };

        CheckpointRecord {
            id: Uuid::new_v4().to_string(),
            iteration,
            kind,
            stash_ref,
            created_at: Utc::now(),
            metrics: metrics.clone(),
        }
    }

    /// Apply a checkpoint's stash ref onto the working tree. A no-op for
    /// the `"clean"` and `"none"` sentinels. Failures are logged, not
    /// fatal.
    pub fn rollback(&self, record: &CheckpointRecord) -> bool {
        if record.stash_ref == STASH_CLEAN || record.stash_ref == STASH_NONE {
            tracing::info!(
                checkpoint = %record.id,
                stash_ref = %record.stash_ref,
                "rollback is a no-op"
            );
            return true;
        }
        match self.git(&["stash", "apply", &record.stash_ref]) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(
                    checkpoint = %record.id,
                    error = %err,
                    "rollback apply failed (non-fatal)"
                );
                false
            }
        }
    }

    /// Stage everything, create a stash commit, unstage.
    fn snapshot_tree(&self) -> Result<String, CheckpointError> {
        self.git(&["add", "-A"])?;
        let result = self.git(&["stash", "create", "forge checkpoint"]);
        // Always unstage, even when the stash failed.
        let _ = self.git(&["reset"]);

        let stdout = result?;
        let reference = stdout.trim();
        if reference.is_empty() {
            // Nothing to snapshot.
            Ok(STASH_CLEAN.to_owned())
        } else {
            Ok(reference.to_owned())
        }
    }

    fn git(&self, args: &[&str]) -> Result<String, CheckpointError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .map_err(|e| CheckpointError::GitCommand {
                message: format!("failed to run git {}", args.join(" ")),
                source: e,
            })?;

        if !output.status.success() {
            return Err(CheckpointError::GitExit {
                command: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Prune a checkpoint list down to `keep`, oldest-first by iteration.
/// Returns the pruned records so their files can be removed.
pub fn prune(records: &mut Vec<CheckpointRecord>, keep: usize) -> Vec<CheckpointRecord> {
    if records.len() <= keep {
        return Vec::new();
    }
    records.sort_by_key(|r| r.iteration);
    let excess = records.len() - keep;
    records.drain(..excess).collect()
}
