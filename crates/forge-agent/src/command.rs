//! External-command inbox.
//!
//! The CLI drops a one-shot command file into `.forge/command.json`; the
//! driver consumes it at the top of the next tick and deletes it, so each
//! command is delivered at most once.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A command dropped by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentCommand {
    Complete,
    Pause,
    Abort,
}

#[derive(Debug, Serialize, Deserialize)]
struct CommandFile {
    command: AgentCommand,
}

/// Consume the command file, if present. The file is removed before the
/// command is returned; a crash after removal loses the command rather
/// than replaying it.
pub fn take_command(path: &Path) -> Result<Option<AgentCommand>> {
    let body = match std::fs::read_to_string(path) {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read {}", path.display()));
        }
    };

    std::fs::remove_file(path)
        .with_context(|| format!("failed to remove {}", path.display()))?;

    let parsed: CommandFile = serde_json::from_str(&body)
        .with_context(|| format!("malformed command file {}", path.display()))?;
    Ok(Some(parsed.command))
}

/// Drop a command for the agent to pick up on its next tick.
pub fn write_command(path: &Path, command: AgentCommand) -> Result<()> {
    crate::layout::write_json_atomic(path, &CommandFile { command })
}
