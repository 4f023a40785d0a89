//! `forge queue-tasks` -- materialize YAML task definitions onto the
//! coordinator and queue them.
//!
//! Validates the dependency graph (cycles are a hard error) and fills in
//! missing priorities with the longest-path-from-roots computation, so
//! upstream work sorts ahead of its dependents.

use std::collections::HashMap;

use anyhow::{Context, Result, bail};

use forge_agent::client::CoordinatorClient;
use forge_core::queue::{CreateTaskRequest, find_cycle, longest_path_priorities};

use crate::config::{AgentConfig, layout_at, workspace_root};
use crate::taskdef::{TaskDef, load_defs};

pub async fn run_queue_tasks(
    all: bool,
    task: Option<&str>,
    dry_run: bool,
) -> Result<()> {
    let root = workspace_root()?;
    let layout = layout_at(&root);
    let config = AgentConfig::load(&layout)?;

    let defs = load_defs(&layout.tasks_dir())?;
    if defs.is_empty() {
        println!("no task definitions under {}", layout.tasks_dir().display());
        return Ok(());
    }

    // Resolve ids and build the definition graph.
    let resolved: Vec<(String, TaskDef)> = defs
        .into_iter()
        .map(|(path, def)| (def.resolved_id(&path), def))
        .collect();

    let selected: Vec<&(String, TaskDef)> = match (all, task) {
        (true, _) => resolved.iter().collect(),
        (false, Some(wanted)) => {
            let found: Vec<_> = resolved.iter().filter(|(id, _)| id == wanted).collect();
            if found.is_empty() {
                bail!("no task definition with id {wanted:?}");
            }
            found
        }
        (false, None) => bail!("pass --all or --task <ID>"),
    };

    let ids: Vec<String> = resolved.iter().map(|(id, _)| id.clone()).collect();
    let mut edges: Vec<(String, String)> = Vec::new();
    for (id, def) in &resolved {
        for dep in &def.config.depends_on {
            edges.push((id.clone(), dep.clone()));
        }
    }

    if let Some(cycle) = find_cycle(&edges) {
        bail!("dependency cycle in task definitions: {}", cycle.join(" -> "));
    }
    let computed = longest_path_priorities(&ids, &edges)?;

    // Creation must respect dependency order: dependencies first.
    let mut ordered: Vec<&(String, TaskDef)> = selected.clone();
    ordered.sort_by_key(|(id, _)| computed.get(id).copied().unwrap_or(0));

    let client = CoordinatorClient::new(&config.url)?;
    for (id, def) in ordered {
        let priority = def
            .priority
            .or_else(|| computed.get(id).copied())
            .unwrap_or(0);

        if dry_run {
            println!(
                "would queue {id} (priority {priority}, {} dependencies)",
                def.config.depends_on.len()
            );
            continue;
        }

        let request = CreateTaskRequest {
            id: Some(id.clone()),
            name: def.name.clone(),
            prompt: def.prompt.clone(),
            priority: Some(priority),
            config: serde_json::to_value(&def.config)?,
            depends_on: def.config.depends_on.clone(),
        };
        client
            .create_task(&config.project_id, &request)
            .await
            .with_context(|| format!("failed to create task {id}"))?;

        let outcome = client
            .queue_task(id)
            .await
            .with_context(|| format!("failed to queue task {id}"))?;
        println!("queued {id}: {} (priority {priority})", outcome.status);
    }

    Ok(())
}

/// Priorities for a definition set, exposed for tests.
#[allow(dead_code)]
pub fn priorities_for(defs: &[(String, TaskDef)]) -> Result<HashMap<String, i64>> {
    let ids: Vec<String> = defs.iter().map(|(id, _)| id.clone()).collect();
    let mut edges = Vec::new();
    for (id, def) in defs {
        for dep in &def.config.depends_on {
            edges.push((id.clone(), dep.clone()));
        }
    }
    Ok(longest_path_priorities(&ids, &edges)?)
}
