//! The iteration driver: one tick per parent-runtime turn.
//!
//! Single-threaded within a workspace. Each tick drains the outbox, honors
//! the command inbox, digests the transcript, scores criteria, watches for
//! stuck patterns, checkpoints on schedule, runs due quality gates, reports
//! to the coordinator, and decides whether the runtime should keep going.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::{Value, json};

use forge_db::models::{IterationOutcome, TaskStatus};
use forge_core::lock::{HeartbeatRequest, IterationReport};

use crate::checkpoint::{CheckpointKind, CheckpointManager, prune};
use crate::client::{CoordinatorApi, StatusUpdate};
use crate::command::{self, AgentCommand};
use crate::criteria::{self, EvalContext, EvaluationOutcome};
use crate::gates;
use crate::layout::{Layout, write_json_atomic};
use crate::state::{AgentState, CoordinatorLink, IterationEntry, TaskConfig, TaskRef};
use crate::stuck::{self, RecoveryAction};
use crate::transcript::{self, TranscriptDigest};

/// What the runtime should do after a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// No active task; nothing for the runtime to do.
    Approve,
    /// Keep iterating: block and continue with this prompt.
    Block { prompt: String },
    /// The task reached a terminal condition; the runtime should stop.
    Exit { reason: String },
}

/// Drives the iteration loop for one workspace.
pub struct IterationDriver {
    workspace: PathBuf,
    layout: Layout,
    checkpoints: CheckpointManager,
    outbox: crate::outbox::Outbox,
    api: Option<Arc<dyn CoordinatorApi>>,
}

impl IterationDriver {
    pub fn new(
        workspace: impl Into<PathBuf>,
        api: Option<Arc<dyn CoordinatorApi>>,
    ) -> Self {
        let workspace = workspace.into();
        let layout = Layout::new(&workspace);
        let outbox = crate::outbox::Outbox::new(layout.outbox_file());
        let checkpoints = CheckpointManager::new(&workspace);
        Self {
            workspace,
            layout,
            checkpoints,
            outbox,
            api,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Run one tick against the latest transcript.
    pub async fn tick(&self, transcript_path: &Path) -> Result<TickOutcome> {
        // 1. Drain the outbox first so terminal statuses from earlier ticks
        //    land even when this tick has nothing else to do.
        if let Some(api) = &self.api {
            let stats = self.outbox.drain(api.as_ref()).await?;
            if stats.delivered + stats.discarded > 0 {
                tracing::info!(?stats, "outbox drained");
            }
        }

        let Some(mut state) = AgentState::load(&self.layout.state_file())? else {
            return Ok(TickOutcome::Approve);
        };
        if state.task.status != TaskStatus::Running {
            return Ok(TickOutcome::Approve);
        }

        // 2. Command inbox beats everything else.
        if let Some(command) = command::take_command(&self.layout.command_file())? {
            return self.handle_command(&mut state, command).await;
        }

        // 3. Transcript ingest.
        let (digest, ingest_error) = match transcript::ingest(transcript_path) {
            Ok(digest) => (digest, None),
            Err(err) => (
                TranscriptDigest {
                    last_text: String::new(),
                    promise: None,
                    token_estimate: 0,
                },
                Some(format!("{err:#}")),
            ),
        };

        // 4. Fold token and wall-clock costs into the running metrics.
        let now = Utc::now();
        let started_at = state.iteration.current_started_at;
        let duration_ms = (now - started_at).num_milliseconds().max(0);
        state.metrics.total_tokens += digest.token_estimate;
        state.metrics.total_duration_ms += duration_ms;

        // 5. Working-tree diff (names only).
        let files_changed = diff_working_tree(&self.workspace);
        state.metrics.merge_files(&files_changed);

        // 6. Budgets.
        if let Some(reason) = self.budget_exceeded(&state) {
            return self.finish(&mut state, TaskStatus::Failed, &reason).await;
        }

        // 7. Iteration ceiling.
        if state.iteration.max > 0 && state.iteration.current >= state.iteration.max {
            let reason = format!(
                "max iterations reached ({}/{})",
                state.iteration.current, state.iteration.max
            );
            return self.finish(&mut state, TaskStatus::Failed, &reason).await;
        }

        // 8. Criteria.
        let eval = criteria::evaluate(
            &state.config.criteria,
            state.config.mode,
            state.config.required_score,
            &EvalContext {
                workdir: self.workspace.clone(),
                promise: digest.promise.clone(),
            },
        )
        .await;

        if eval.is_complete {
            return self.complete(&mut state, &eval).await;
        }

        // 9. Record the iteration and look for stuck patterns.
        let entry = self.build_entry(
            &state,
            &digest,
            &eval,
            ingest_error,
            duration_ms,
            files_changed,
        );
        let _ = write_json_atomic(
            &self.layout.iteration_file(&state.task.id, entry.seq),
            &entry,
        );
        state.push_history(entry.clone());

        let verdict = stuck::detect(&state.iteration.history, &state.config.stuck);
        let mut prompt_suffix = String::new();
        if verdict.is_stuck {
            tracing::warn!(
                pattern = ?verdict.pattern,
                reason = %verdict.reason,
                "stuck pattern detected"
            );
            let has_checkpoint = !state.checkpoints.is_empty();
            match stuck::recover(state.config.stuck.strategy, &verdict, has_checkpoint)
            {
                RecoveryAction::Abort { reason } => {
                    let reason = format!("stuck: {reason}");
                    return self.finish(&mut state, TaskStatus::Stuck, &reason).await;
                }
                RecoveryAction::RestoreAndContinue { prompt_suffix: suffix } => {
                    self.rollback_latest(&mut state);
                    prompt_suffix = suffix;
                }
                RecoveryAction::Continue { prompt_suffix: suffix } => {
                    prompt_suffix = suffix;
                }
            }
        }

        // 10. Auto-checkpoint.
        if state.config.checkpoints.is_due(state.iteration.current) {
            self.create_checkpoint(&mut state, CheckpointKind::Auto);
        }

        // 11. Quality gates due this iteration.
        let reports = gates::run_due_gates(
            &state.config.gates,
            state.iteration.current,
            &self.workspace,
        )
        .await;
        for report in &reports {
            if !report.passed {
                tracing::warn!(gate = %report.name, "gate failed (non-fatal)");
            }
        }

        // 12. Advance, persist, report.
        state.iteration.current += 1;
        state.iteration.current_started_at = Utc::now();
        state.save(&self.layout.state_file())?;

        if let Some(commands) = self.send_heartbeat(&mut state, &entry).await {
            for cmd in commands {
                match cmd {
                    AgentCommand::Abort => {
                        return self
                            .finish(&mut state, TaskStatus::Aborted, "aborted by operator")
                            .await;
                    }
                    AgentCommand::Pause => {
                        return self.pause(&mut state).await;
                    }
                    AgentCommand::Complete => {
                        return self.complete(&mut state, &eval).await;
                    }
                }
            }
        }

        // 13. Block and continue.
        let mut prompt = state.task.prompt.clone();
        prompt.push_str(&prompt_suffix);
        Ok(TickOutcome::Block { prompt })
    }

    // -----------------------------------------------------------------
    // Command handling
    // -----------------------------------------------------------------

    async fn handle_command(
        &self,
        state: &mut AgentState,
        command: AgentCommand,
    ) -> Result<TickOutcome> {
        tracing::info!(?command, "command inbox consumed");
        match command {
            AgentCommand::Complete => {
                let eval = EvaluationOutcome {
                    results: Vec::new(),
                    score: 1.0,
                    is_complete: true,
                };
                self.complete(state, &eval).await
            }
            AgentCommand::Abort => {
                self.finish(state, TaskStatus::Aborted, "aborted by command")
                    .await
            }
            AgentCommand::Pause => self.pause(state).await,
        }
    }

    async fn pause(&self, state: &mut AgentState) -> Result<TickOutcome> {
        state.task.status = TaskStatus::Paused;
        state.save(&self.layout.state_file())?;

        if let (Some(api), Some(link)) = (&self.api, &state.link) {
            let push = forge_core::sync::PushRequest {
                node_id: link.node_id.clone(),
                local_clock: 0,
                tasks: vec![forge_core::sync::TaskPush {
                    id: state.task.id.clone(),
                    expected_version: state.task.sync_version,
                    status: TaskStatus::Paused,
                    result: None,
                    iteration: Some(state.iteration.current),
                }],
            };
            if let Err(err) = api.push(&link.project_id, &push).await {
                tracing::warn!(error = %err, "failed to report pause");
            }
        }

        Ok(TickOutcome::Exit {
            reason: "paused".to_owned(),
        })
    }

    // -----------------------------------------------------------------
    // Completion & termination
    // -----------------------------------------------------------------

    async fn complete(
        &self,
        state: &mut AgentState,
        eval: &EvaluationOutcome,
    ) -> Result<TickOutcome> {
        let result = json!({
            "success": true,
            "score": eval.score,
            "iterations": state.iteration.current,
            "criteria": eval.results,
        });
        self.report_terminal(state, TaskStatus::Completed, result.clone())
            .await?;
        let _ = write_json_atomic(&self.layout.run_result_file(&state.task.id), &result);

        tracing::info!(task_id = %state.task.id, "task completed");
        self.auto_advance(state).await
    }

    async fn finish(
        &self,
        state: &mut AgentState,
        status: TaskStatus,
        reason: &str,
    ) -> Result<TickOutcome> {
        let result = json!({
            "success": false,
            "reason": reason,
            "iterations": state.iteration.current,
        });
        self.report_terminal(state, status, result.clone()).await?;
        let _ = write_json_atomic(&self.layout.run_result_file(&state.task.id), &result);

        tracing::info!(task_id = %state.task.id, status = %status, reason, "task finished");
        Ok(TickOutcome::Exit {
            reason: reason.to_owned(),
        })
    }

    /// Persist the terminal status locally and report it through every
    /// outbound channel (direct post with backoff, then the outbox).
    async fn report_terminal(
        &self,
        state: &mut AgentState,
        status: TaskStatus,
        result: Value,
    ) -> Result<()> {
        state.task.status = status;
        state.save(&self.layout.state_file())?;

        let (Some(api), Some(link)) = (&self.api, &state.link) else {
            return Ok(());
        };

        let update = StatusUpdate {
            project_id: link.project_id.clone(),
            task_id: state.task.id.clone(),
            node_id: link.node_id.clone(),
            status,
            result: Some(result),
            iteration: Some(state.iteration.current),
            expected_version: state.task.sync_version,
        };
        self.outbox.send_or_enqueue(api.as_ref(), update).await?;

        // `stuck` is not terminal server-side, so the lock does not clear
        // with the push; hand it back explicitly.
        if status == TaskStatus::Stuck {
            let release = forge_core::lock::ReleaseRequest {
                node_id: link.node_id.clone(),
            };
            if let Err(err) = api.release(&state.task.id, &release).await {
                tracing::debug!(error = %err, "release after stuck failed");
            }
        }
        Ok(())
    }

    /// After completion, ask for the next queued task and start fresh.
    async fn auto_advance(&self, state: &mut AgentState) -> Result<TickOutcome> {
        let (Some(api), Some(link)) = (&self.api, &state.link) else {
            return Ok(TickOutcome::Exit {
                reason: "task complete".to_owned(),
            });
        };

        let grant = match api.claim_next(&link.project_id, &link.node_id).await {
            Ok(grant) => grant,
            Err(err) => {
                tracing::warn!(error = %err, "auto-advance claim failed");
                None
            }
        };

        let Some(grant) = grant else {
            return Ok(TickOutcome::Exit {
                reason: "task complete; queue is empty".to_owned(),
            });
        };

        let config = TaskConfig::from_value(&grant.config).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "unparsable task config, using defaults");
            TaskConfig::default()
        });

        let fresh = AgentState::for_new_task(
            TaskRef {
                id: grant.task_id.clone(),
                project_id: link.project_id.clone(),
                name: grant.name.clone(),
                prompt: grant.prompt.clone(),
                status: TaskStatus::Running,
                sync_version: grant.version,
            },
            config,
            Some(CoordinatorLink {
                url: link.url.clone(),
                project_id: link.project_id.clone(),
                task_id: grant.task_id.clone(),
                node_id: link.node_id.clone(),
            }),
        );

        self.layout.ensure_run_dirs(&grant.task_id)?;
        let _ = write_json_atomic(&self.layout.run_task_file(&grant.task_id), &grant);
        fresh.save(&self.layout.state_file())?;
        *state = fresh;

        tracing::info!(task_id = %grant.task_id, "auto-advanced to next task");
        Ok(TickOutcome::Block {
            prompt: grant.prompt,
        })
    }

    // -----------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------

    fn budget_exceeded(&self, state: &AgentState) -> Option<String> {
        let budget = state.config.budget.as_ref()?;
        if let Some(max_secs) = budget.max_duration_secs {
            if state.metrics.total_duration_ms > (max_secs as i64) * 1000 {
                return Some(format!("budget exceeded: duration over {max_secs}s"));
            }
        }
        if let Some(max_tokens) = budget.max_tokens {
            if state.metrics.total_tokens > max_tokens {
                return Some(format!("budget exceeded: tokens over {max_tokens}"));
            }
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn build_entry(
        &self,
        state: &AgentState,
        digest: &TranscriptDigest,
        eval: &EvaluationOutcome,
        ingest_error: Option<String>,
        duration_ms: i64,
        files_changed: Vec<String>,
    ) -> IterationEntry {
        let outcome = if ingest_error.is_some() {
            IterationOutcome::Error
        } else {
            IterationOutcome::Progress
        };
        IterationEntry {
            seq: state.iteration.current,
            started_at: state.iteration.current_started_at,
            ended_at: Utc::now(),
            duration_ms,
            token_estimate: digest.token_estimate,
            outcome,
            summary: summarize(&digest.last_text),
            pass_rate: eval.pass_rate(),
            had_criteria: !eval.results.is_empty(),
            error_message: ingest_error,
            files_changed,
        }
    }

    fn create_checkpoint(&self, state: &mut AgentState, kind: CheckpointKind) {
        let record =
            self.checkpoints
                .create(state.iteration.current, kind, &state.metrics);
        let _ = write_json_atomic(
            &self.layout.checkpoint_file(&state.task.id, &record.id),
            &record,
        );
        tracing::info!(
            checkpoint = %record.id,
            iteration = record.iteration,
            stash_ref = %record.stash_ref,
            "checkpoint created"
        );
        state.checkpoints.push(record);

        let pruned = prune(&mut state.checkpoints, state.config.checkpoints.keep);
        for old in pruned {
            let _ = std::fs::remove_file(
                self.layout.checkpoint_file(&state.task.id, &old.id),
            );
        }
    }

    /// Restore the most recent checkpoint: apply the stash, rewind the
    /// iteration counter, truncate history, and restore metrics.
    fn rollback_latest(&self, state: &mut AgentState) {
        let Some(latest) = state
            .checkpoints
            .iter()
            .max_by_key(|record| record.iteration)
            .cloned()
        else {
            return;
        };

        self.checkpoints.rollback(&latest);
        state.metrics = latest.metrics.clone();
        state.iteration.current = latest.iteration;
        state
            .iteration
            .history
            .retain(|entry| entry.seq <= latest.iteration);

        tracing::info!(
            checkpoint = %latest.id,
            iteration = latest.iteration,
            "rolled back to checkpoint"
        );
    }

    /// Heartbeat the coordinator with this iteration's report. Returns
    /// cooperative commands to apply, or `None` when unlinked or the lock
    /// is gone.
    async fn send_heartbeat(
        &self,
        state: &mut AgentState,
        entry: &IterationEntry,
    ) -> Option<Vec<AgentCommand>> {
        let (api, link) = (self.api.as_ref()?, state.link.as_ref()?);

        let request = HeartbeatRequest {
            node_id: link.node_id.clone(),
            iteration: Some(state.iteration.current),
            progress: Some(IterationReport {
                seq: entry.seq,
                started_at: entry.started_at,
                ended_at: entry.ended_at,
                duration_ms: entry.duration_ms,
                token_estimate: entry.token_estimate,
                outcome: entry.outcome,
                summary: entry.summary.clone(),
                criteria: json!({ "passRate": entry.pass_rate }),
                files_changed: entry.files_changed.clone(),
            }),
            execution_state: None,
        };

        match api.heartbeat(&state.task.id, &request).await {
            Ok(response) => {
                state.task.sync_version = response.sync_version;
                let _ = state.save(&self.layout.state_file());
                let commands = response
                    .commands
                    .iter()
                    .filter_map(|cmd| match cmd.kind {
                        forge_db::models::InterventionKind::Pause => {
                            Some(AgentCommand::Pause)
                        }
                        forge_db::models::InterventionKind::Abort => {
                            Some(AgentCommand::Abort)
                        }
                        _ => None,
                    })
                    .collect();
                Some(commands)
            }
            Err(err) => {
                tracing::warn!(error = %err, "heartbeat failed");
                None
            }
        }
    }
}

/// Names of files created or modified in the working tree, deduplicated.
fn diff_working_tree(workspace: &Path) -> Vec<String> {
    let output = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(workspace)
        .output();

    let Ok(output) = output else {
        return Vec::new();
    };
    if !output.status.success() {
        return Vec::new();
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut files = Vec::new();
    for line in stdout.lines() {
        if line.len() < 4 {
            continue;
        }
        // Porcelain format: "XY path" or "XY old -> new" for renames.
        let path = &line[3..];
        let path = path.rsplit(" -> ").next().unwrap_or(path).trim();
        let name = path.trim_matches('"').to_owned();
        if !name.is_empty() && !files.contains(&name) {
            files.push(name);
        }
    }
    files
}

/// First line of the runtime's output, bounded.
fn summarize(text: &str) -> String {
    let first_line = text.trim().lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        return "no output".to_owned();
    }
    let mut summary: String = first_line.chars().take(120).collect();
    if first_line.chars().count() > 120 {
        summary.push_str("...");
    }
    summary
}
