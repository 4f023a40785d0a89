//! Conflict resolver: decides who wins when a push arrives with a stale
//! version.
//!
//! The resolver is pure -- it never touches storage -- so the whole rule
//! space is enumerable in tests. Rules are evaluated in order; the first
//! match wins.

use serde::{Deserialize, Serialize};

use forge_db::models::TaskStatus;

use crate::state::TaskStateMachine;

/// Verdict for a conflicting push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    ServerWins,
    PluginWins,
    Reject,
}

/// Everything the resolver is allowed to look at.
#[derive(Debug, Clone, Copy)]
pub struct ConflictContext {
    /// Whether the pushing node holds the current live lock on the task.
    pub plugin_is_active_runner: bool,
    /// The task status as the server knows it.
    pub server_status: TaskStatus,
    /// The status the plugin is trying to push.
    pub plugin_status: TaskStatus,
}

/// Resolve a version conflict.
///
/// Rules, in order:
/// 1. Server task is terminal: finished work is never overwritten.
/// 2. The pusher holds the lock and proposes a valid transition from the
///    server's status: the active runner's view wins.
/// 3. Server says `running` but the pusher is not the runner: someone else
///    owns this task.
/// 4. Statuses agree (idempotent retry): accept as a no-op.
/// 5. Otherwise the server's view stands.
pub fn resolve(ctx: &ConflictContext) -> Resolution {
    if ctx.server_status.is_terminal() {
        return Resolution::Reject;
    }
    if ctx.plugin_is_active_runner
        && TaskStateMachine::is_valid_transition(ctx.server_status, ctx.plugin_status)
    {
        return Resolution::PluginWins;
    }
    if ctx.server_status == TaskStatus::Running && !ctx.plugin_is_active_runner {
        return Resolution::Reject;
    }
    if ctx.server_status == ctx.plugin_status {
        return Resolution::PluginWins;
    }
    Resolution::ServerWins
}
