//! User-editable task definitions (`.forge/tasks/<taskId>.yaml`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use forge_agent::state::TaskConfig;

/// One task definition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDef {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(flatten)]
    pub config: TaskConfig,
}

impl TaskDef {
    /// The task id: explicit, or the file stem.
    pub fn resolved_id(&self, path: &Path) -> String {
        self.id.clone().unwrap_or_else(|| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.name.clone())
        })
    }
}

/// Load every `*.yaml` definition in a directory, sorted by file name.
pub fn load_defs(dir: &Path) -> Result<Vec<(PathBuf, TaskDef)>> {
    let mut defs = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(defs),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read {}", dir.display()));
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml")
        })
        .collect();
    paths.sort();

    for path in paths {
        let body = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let def: TaskDef = serde_yaml::from_str(&body)
            .with_context(|| format!("malformed task definition {}", path.display()))?;
        defs.push((path, def));
    }
    Ok(defs)
}

/// Write a definition to `<dir>/<id>.yaml`.
pub fn write_def(dir: &Path, id: &str, def: &TaskDef) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(format!("{id}.yaml"));
    let body = serde_yaml::to_string(def).context("failed to serialize task definition")?;
    std::fs::write(&path, body)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
