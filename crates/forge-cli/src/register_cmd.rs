//! `forge register` -- create the project on the coordinator, register this
//! workspace as a node, and save `.forge/config.json`.

use anyhow::{Context, Result};
use uuid::Uuid;

use forge_agent::client::{CoordinatorApi, CoordinatorClient};
use forge_core::sync::NodeRegisterRequest;
use forge_db::models::NodeType;

use crate::config::{AgentConfig, layout_at, workspace_root};

pub async fn run_register(name: &str, url: &str) -> Result<()> {
    let root = workspace_root()?;
    let layout = layout_at(&root);

    // Re-registering keeps the existing identifiers.
    let existing = AgentConfig::try_load(&layout)?;
    let project_id = existing
        .as_ref()
        .map(|config| config.project_id.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let node_id = existing
        .as_ref()
        .map(|config| config.node_id.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let client = CoordinatorClient::new(url)?;

    client
        .create_project(&project_id, name, &root.to_string_lossy())
        .await
        .context("failed to create project on coordinator")?;

    let response = client
        .register_node(&NodeRegisterRequest {
            node_id: node_id.clone(),
            project_id: project_id.clone(),
            node_type: NodeType::Plugin,
            display_name: Some(name.to_owned()),
            capabilities: vec!["iterate".to_owned(), "checkpoint".to_owned()],
        })
        .await
        .context("failed to register node")?;

    let config = AgentConfig {
        url: url.to_owned(),
        project_id: response.project_id,
        node_id: response.node_id,
    };
    config.save(&layout)?;

    println!("Registered {name} with {url}");
    println!("  projectId = {}", config.project_id);
    println!("  nodeId    = {}", config.node_id);
    println!("  config    = {}", layout.config_file().display());

    Ok(())
}
