//! Task state machine.
//!
//! The transition graph of the task lifecycle, kept as a table so tests can
//! enumerate it. Terminal statuses admit no further transitions; the single
//! exception is the `retry` intervention, which is handled at the
//! intervention layer and never passes through this table.

use forge_db::models::TaskStatus;

use TaskStatus::*;

/// Every permitted `from -> to` edge.
///
/// `stuck -> running | failed | aborted` exists only for the intervention
/// path; the push pipeline refuses transitions out of `stuck`.
pub const TRANSITIONS: &[(TaskStatus, TaskStatus)] = &[
    (Pending, Queued),
    (Pending, Blocked),
    (Pending, Skipped),
    (Blocked, Queued),
    (Blocked, Skipped),
    (Queued, Running),
    (Queued, Paused),
    (Queued, Aborted),
    (Queued, Skipped),
    (Running, Paused),
    (Running, Completed),
    (Running, Failed),
    (Running, Stuck),
    (Running, Aborted),
    (Paused, Running),
    (Paused, Aborted),
    (Stuck, Running),
    (Stuck, Failed),
    (Stuck, Aborted),
];

/// The task state machine.
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        TRANSITIONS.contains(&(from, to))
    }

    /// Whether `from` only leaves this status through an intervention.
    pub fn requires_intervention(from: TaskStatus) -> bool {
        from == Stuck
    }
}
