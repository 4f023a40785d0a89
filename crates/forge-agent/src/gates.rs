//! Quality gates: interval-driven external checks.
//!
//! Gates run on their configured cadence during the tick. A failing gate
//! may fire a one-shot auto-fix command, but a gate never fails the
//! iteration by itself; results are logged and recorded.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

fn default_interval() -> i64 {
    1
}

fn default_timeout_secs() -> u64 {
    300
}

/// One configured quality gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityGate {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Run every `interval` iterations.
    #[serde(default = "default_interval")]
    pub interval: i64,
    /// Shell line to run when the gate fails, if any.
    #[serde(default)]
    pub fix_command: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl QualityGate {
    /// Whether this gate runs at the given iteration.
    pub fn is_due(&self, iteration: i64) -> bool {
        self.interval > 0 && iteration % self.interval == 0
    }
}

/// Outcome of one gate run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateReport {
    pub name: String,
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub fix_attempted: bool,
}

/// Run every gate due at `iteration`. Failures never propagate; a gate
/// that cannot even spawn reports `passed = false` with no exit code.
pub async fn run_due_gates(
    gates: &[QualityGate],
    iteration: i64,
    workdir: &Path,
) -> Vec<GateReport> {
    let mut reports = Vec::new();
    for gate in gates.iter().filter(|g| g.is_due(iteration)) {
        reports.push(run_gate(gate, workdir).await);
    }
    reports
}

async fn run_gate(gate: &QualityGate, workdir: &Path) -> GateReport {
    let exit_code = run_process(&gate.command, &gate.args, gate.timeout_secs, workdir).await;
    let passed = exit_code == Some(0);

    let mut fix_attempted = false;
    if !passed {
        tracing::warn!(gate = %gate.name, ?exit_code, "quality gate failed");
        if let Some(fix) = &gate.fix_command {
            fix_attempted = true;
            let fix_args = vec!["-c".to_owned(), fix.clone()];
            let fix_code = run_process("sh", &fix_args, gate.timeout_secs, workdir).await;
            tracing::info!(gate = %gate.name, ?fix_code, "auto-fix command finished");
        }
    } else {
        tracing::debug!(gate = %gate.name, "quality gate passed");
    }

    GateReport {
        name: gate.name.clone(),
        passed,
        exit_code,
        fix_attempted,
    }
}

/// Spawn a process and wait with a timeout. `None` means it failed to
/// spawn, was killed by a signal, or timed out.
async fn run_process(
    program: &str,
    args: &[String],
    timeout_secs: u64,
    workdir: &Path,
) -> Option<i32> {
    let child = Command::new(program)
        .args(args)
        .current_dir(workdir)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();

    let mut child = match child {
        Ok(child) => child,
        Err(err) => {
            tracing::warn!(program, error = %err, "gate command failed to spawn");
            return None;
        }
    };

    match tokio::time::timeout(Duration::from_secs(timeout_secs.max(1)), child.wait())
        .await
    {
        Ok(Ok(status)) => status.code(),
        Ok(Err(err)) => {
            tracing::warn!(program, error = %err, "gate command wait failed");
            None
        }
        Err(_) => {
            let _ = child.kill().await;
            tracing::warn!(program, timeout_secs, "gate command timed out");
            None
        }
    }
}
