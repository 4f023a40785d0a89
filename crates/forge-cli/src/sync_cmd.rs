//! `forge sync` -- reconcile local state with the coordinator.

use std::collections::HashMap;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;

use forge_agent::client::{CoordinatorApi, CoordinatorClient};
use forge_agent::layout::write_json_atomic;
use forge_agent::outbox::Outbox;
use forge_agent::state::AgentState;
use forge_core::sync::{HandshakeRequest, PullRequest, PushRequest, TaskPush};

use crate::SyncMode;
use crate::config::{AgentConfig, layout_at, workspace_root};

pub async fn run_sync(mode: SyncMode) -> Result<()> {
    let root = workspace_root()?;
    let layout = layout_at(&root);
    let config = AgentConfig::load(&layout)?;
    let client = CoordinatorClient::new(&config.url)?;

    match mode {
        SyncMode::Pending => drain_pending(&layout, &client).await,
        SyncMode::Push => push_active(&layout, &config, &client).await,
        SyncMode::Pull => pull_all(&layout, &config, &client).await,
        SyncMode::Full => {
            drain_pending(&layout, &client).await?;
            push_active(&layout, &config, &client).await?;
            pull_all(&layout, &config, &client).await
        }
    }
}

/// Retry everything queued in the outbox.
async fn drain_pending(
    layout: &forge_agent::layout::Layout,
    client: &CoordinatorClient,
) -> Result<()> {
    let outbox = Outbox::new(layout.outbox_file());
    let stats = outbox.drain(client).await?;
    println!(
        "outbox: {} delivered, {} retained, {} discarded",
        stats.delivered, stats.retained, stats.discarded
    );
    Ok(())
}

/// Push the active task's local status to the coordinator.
async fn push_active(
    layout: &forge_agent::layout::Layout,
    config: &AgentConfig,
    client: &CoordinatorClient,
) -> Result<()> {
    let Some(state) = AgentState::load(&layout.state_file())? else {
        println!("push: no active task");
        return Ok(());
    };

    let request = PushRequest {
        node_id: config.node_id.clone(),
        local_clock: 0,
        tasks: vec![TaskPush {
            id: state.task.id.clone(),
            expected_version: state.task.sync_version,
            status: state.task.status,
            result: None,
            iteration: Some(state.iteration.current),
        }],
    };
    let response = client.push(&config.project_id, &request).await?;
    for result in &response.results {
        if result.success {
            println!("push: {} ok (version {:?})", result.id, result.new_version);
        } else {
            println!(
                "push: {} rejected: {} {}",
                result.id,
                result.error.as_deref().unwrap_or("?"),
                result.message.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

/// Handshake, pull everything stale, and refresh the execution mirror.
async fn pull_all(
    layout: &forge_agent::layout::Layout,
    config: &AgentConfig,
    client: &CoordinatorClient,
) -> Result<()> {
    let mut known: HashMap<String, i64> = HashMap::new();
    if let Some(state) = AgentState::load(&layout.state_file())? {
        known.insert(state.task.id.clone(), state.task.sync_version);
    }

    let handshake = client
        .handshake(
            &config.project_id,
            &HandshakeRequest {
                node_id: config.node_id.clone(),
                local_clock: 0,
                task_versions: known,
            },
        )
        .await?;

    println!(
        "handshake: {} in sync, {} to pull, {} to push, {} conflicts",
        handshake.in_sync.len(),
        handshake.needs_pull.len(),
        handshake.needs_push.len(),
        handshake.conflicts.len()
    );

    if handshake.needs_pull.is_empty() && handshake.conflicts.is_empty() {
        return Ok(());
    }

    let mut ids = handshake.needs_pull.clone();
    ids.extend(handshake.conflicts.iter().cloned());
    let pulled = client
        .pull(&config.project_id, &PullRequest { task_ids: ids })
        .await?;

    // Execution-view mirror of the project's queue.
    write_json_atomic(
        &layout.execution_file(),
        &json!({
            "updatedAt": Utc::now(),
            "serverClock": pulled.server_clock,
            "tasks": pulled.tasks,
        }),
    )?;

    for snapshot in &pulled.tasks {
        println!(
            "pull: {} -> {} (version {})",
            snapshot.id, snapshot.status, snapshot.version
        );
    }
    Ok(())
}
