//! On-disk layout of the agent's `.forge/` directory.
//!
//! ```text
//! .forge/
//!   state.json            live state of the active task
//!   command.json          external-command inbox (consumed and deleted)
//!   execution.json        execution-view mirror of the project's queue
//!   pending-sync.json     status-sync outbox
//!   config.json           coordinator registration
//!   tasks/<taskId>.yaml   user-editable task definitions
//!   runs/<taskId>/
//!     task.json
//!     iterations/NNN.json
//!     checkpoints/<id>.json
//!     result.json
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Directory name under the workspace root.
pub const FORGE_DIR: &str = ".forge";

/// Resolves every path the agent reads or writes.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Layout rooted at `<workspace>/.forge`.
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            root: workspace.into().join(FORGE_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn command_file(&self) -> PathBuf {
        self.root.join("command.json")
    }

    pub fn execution_file(&self) -> PathBuf {
        self.root.join("execution.json")
    }

    pub fn outbox_file(&self) -> PathBuf {
        self.root.join("pending-sync.json")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    pub fn task_def_file(&self, task_id: &str) -> PathBuf {
        self.tasks_dir().join(format!("{task_id}.yaml"))
    }

    pub fn run_dir(&self, task_id: &str) -> PathBuf {
        self.root.join("runs").join(task_id)
    }

    pub fn run_task_file(&self, task_id: &str) -> PathBuf {
        self.run_dir(task_id).join("task.json")
    }

    pub fn run_result_file(&self, task_id: &str) -> PathBuf {
        self.run_dir(task_id).join("result.json")
    }

    /// Iteration record path, zero-padded to three digits.
    pub fn iteration_file(&self, task_id: &str, seq: i64) -> PathBuf {
        self.run_dir(task_id)
            .join("iterations")
            .join(format!("{seq:03}.json"))
    }

    pub fn checkpoints_dir(&self, task_id: &str) -> PathBuf {
        self.run_dir(task_id).join("checkpoints")
    }

    pub fn checkpoint_file(&self, task_id: &str, checkpoint_id: &str) -> PathBuf {
        self.checkpoints_dir(task_id)
            .join(format!("{checkpoint_id}.json"))
    }

    /// Create the directory tree for a task run.
    pub fn ensure_run_dirs(&self, task_id: &str) -> Result<()> {
        let run = self.run_dir(task_id);
        fs::create_dir_all(run.join("iterations"))
            .context("failed to create iterations directory")?;
        fs::create_dir_all(run.join("checkpoints"))
            .context("failed to create checkpoints directory")?;
        Ok(())
    }
}

/// Write a JSON document atomically: temp file in the same directory, then
/// rename over the target. A crash mid-write never leaves a torn file.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        let body = serde_json::to_vec_pretty(value)?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", tmp.display()))?;
    Ok(())
}

/// Read and parse a JSON document, returning `None` when the file is absent.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path) {
        Ok(body) => {
            let value = serde_json::from_str(&body)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok(Some(value))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read {}", path.display()))
        }
    }
}
