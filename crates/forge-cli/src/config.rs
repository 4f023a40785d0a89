//! Workspace registration config (`.forge/config.json`).

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use forge_agent::layout::{Layout, read_json, write_json_atomic};

/// Coordinator registration for this workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub url: String,
    pub project_id: String,
    pub node_id: String,
}

impl AgentConfig {
    /// Load the config, failing with a hint when the workspace was never
    /// registered.
    pub fn load(layout: &Layout) -> Result<Self> {
        read_json(&layout.config_file())?.with_context(|| {
            format!(
                "no registration at {}; run `forge register <name>` first",
                layout.config_file().display()
            )
        })
    }

    /// Load the config when present.
    pub fn try_load(layout: &Layout) -> Result<Option<Self>> {
        read_json(&layout.config_file())
    }

    pub fn save(&self, layout: &Layout) -> Result<()> {
        write_json_atomic(&layout.config_file(), self)
    }
}

/// The workspace root the CLI operates on: the current directory.
pub fn workspace_root() -> Result<std::path::PathBuf> {
    std::env::current_dir().context("failed to resolve current directory")
}

/// Layout for a workspace root.
pub fn layout_at(root: &Path) -> Layout {
    Layout::new(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let layout = layout_at(dir.path());

        let config = AgentConfig {
            url: "http://localhost:3344".into(),
            project_id: "proj-1".into(),
            node_id: "node-1".into(),
        };
        config.save(&layout).expect("save");

        let loaded = AgentConfig::load(&layout).expect("load");
        assert_eq!(loaded.project_id, "proj-1");
        assert_eq!(loaded.node_id, "node-1");
    }

    #[test]
    fn load_without_registration_hints_at_register() {
        let dir = TempDir::new().unwrap();
        let layout = layout_at(dir.path());

        let err = AgentConfig::load(&layout).expect_err("must fail");
        assert!(err.to_string().contains("forge register"));
    }
}
