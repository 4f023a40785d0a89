//! `forge tick` -- the parent runtime's hook into the iteration driver.
//!
//! Prints a JSON action for the runtime to interpret:
//! `{"action":"approve"}`, `{"action":"block","prompt":"..."}`, or
//! `{"action":"exit","reason":"..."}`.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use forge_agent::client::{CoordinatorApi, CoordinatorClient};
use forge_agent::driver::{IterationDriver, TickOutcome};

use crate::config::{AgentConfig, layout_at, workspace_root};

pub async fn run_tick(transcript: &Path) -> Result<()> {
    let root = workspace_root()?;
    let layout = layout_at(&root);

    // A linked workspace reports to its coordinator; an unlinked one still
    // drives the loop locally.
    let api: Option<Arc<dyn CoordinatorApi>> = match AgentConfig::try_load(&layout)? {
        Some(config) => Some(Arc::new(CoordinatorClient::new(&config.url)?)),
        None => None,
    };

    let driver = IterationDriver::new(&root, api);
    let outcome = driver.tick(transcript).await?;

    let body = match outcome {
        TickOutcome::Approve => json!({ "action": "approve" }),
        TickOutcome::Block { prompt } => json!({ "action": "block", "prompt": prompt }),
        TickOutcome::Exit { reason } => json!({ "action": "exit", "reason": reason }),
    };
    println!("{}", serde_json::to_string(&body)?);
    Ok(())
}
