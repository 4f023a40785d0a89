//! Integration tests for the iteration driver, using a mock coordinator.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use tempfile::TempDir;

use forge_core::lock::{
    ClaimGrant, HeartbeatRequest, HeartbeatResponse, InterventionCommand,
    ReleaseRequest,
};
use forge_core::sync::{
    HandshakeRequest, HandshakeResponse, NodeRegisterRequest, NodeRegisterResponse,
    PullRequest, PullResponse, PushRequest, PushResponse,
};
use forge_db::models::{InterventionKind, IterationOutcome, TaskStatus};

use forge_agent::client::{CoordinatorApi, StatusUpdate};
use forge_agent::command::{self, AgentCommand};
use forge_agent::criteria::{Criterion, CriterionConfig};
use forge_agent::driver::{IterationDriver, TickOutcome};
use forge_agent::outbox::Outbox;
use forge_agent::state::{
    AgentState, Budget, CoordinatorLink, IterationEntry, TaskConfig, TaskRef,
};
use forge_agent::stuck::RecoveryStrategy;

// ---------------------------------------------------------------------------
// Mock coordinator
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockApi {
    statuses: Mutex<Vec<StatusUpdate>>,
    heartbeats: Mutex<Vec<HeartbeatRequest>>,
    releases: Mutex<Vec<String>>,
    /// Returned by the next `claim_next` call.
    next_grant: Mutex<Option<ClaimGrant>>,
    /// Commands attached to every heartbeat response.
    heartbeat_commands: Mutex<Vec<InterventionCommand>>,
}

#[async_trait]
impl CoordinatorApi for MockApi {
    async fn register_node(
        &self,
        req: &NodeRegisterRequest,
    ) -> anyhow::Result<NodeRegisterResponse> {
        Ok(NodeRegisterResponse {
            node_id: req.node_id.clone(),
            project_id: req.project_id.clone(),
            server_clock: 1,
        })
    }

    async fn handshake(
        &self,
        _project_id: &str,
        _req: &HandshakeRequest,
    ) -> anyhow::Result<HandshakeResponse> {
        Ok(HandshakeResponse {
            in_sync: vec![],
            needs_pull: vec![],
            needs_push: vec![],
            conflicts: vec![],
            server_clock: 1,
        })
    }

    async fn push(
        &self,
        _project_id: &str,
        _req: &PushRequest,
    ) -> anyhow::Result<PushResponse> {
        Ok(PushResponse {
            results: vec![],
            server_clock: 1,
        })
    }

    async fn pull(
        &self,
        _project_id: &str,
        _req: &PullRequest,
    ) -> anyhow::Result<PullResponse> {
        Ok(PullResponse {
            tasks: vec![],
            server_clock: 1,
        })
    }

    async fn claim_next(
        &self,
        _project_id: &str,
        _node_id: &str,
    ) -> anyhow::Result<Option<ClaimGrant>> {
        Ok(self.next_grant.lock().unwrap().take())
    }

    async fn heartbeat(
        &self,
        _task_id: &str,
        req: &HeartbeatRequest,
    ) -> anyhow::Result<HeartbeatResponse> {
        self.heartbeats.lock().unwrap().push(req.clone());
        Ok(HeartbeatResponse {
            commands: self.heartbeat_commands.lock().unwrap().drain(..).collect(),
            lock_expires_at: Utc::now() + Duration::minutes(5),
            sync_version: 5,
            server_clock: 9,
        })
    }

    async fn release(&self, task_id: &str, _req: &ReleaseRequest) -> anyhow::Result<()> {
        self.releases.lock().unwrap().push(task_id.to_owned());
        Ok(())
    }

    async fn post_status(&self, update: &StatusUpdate) -> anyhow::Result<()> {
        self.statuses.lock().unwrap().push(update.clone());
        Ok(())
    }

    async fn health(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Fixture {
    dir: TempDir,
    api: Arc<MockApi>,
    driver: IterationDriver,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let api = Arc::new(MockApi::default());
        let driver = IterationDriver::new(
            dir.path(),
            Some(api.clone() as Arc<dyn CoordinatorApi>),
        );
        Self { dir, api, driver }
    }

    fn workspace(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    fn transcript(&self, text: &str) -> PathBuf {
        let path = self.workspace().join("transcript.txt");
        std::fs::write(&path, text).expect("write transcript");
        path
    }

    fn seed_state(&self, config: TaskConfig) -> AgentState {
        let state = AgentState::for_new_task(
            TaskRef {
                id: "t1".into(),
                project_id: "p1".into(),
                name: "task one".into(),
                prompt: "build the widget".into(),
                status: TaskStatus::Running,
                sync_version: 2,
            },
            config,
            Some(CoordinatorLink {
                url: "http://localhost:3344".into(),
                project_id: "p1".into(),
                task_id: "t1".into(),
                node_id: "node-a".into(),
            }),
        );
        state
            .save(&self.driver.layout().state_file())
            .expect("seed state");
        state
    }

    fn reload_state(&self) -> AgentState {
        AgentState::load(&self.driver.layout().state_file())
            .expect("load")
            .expect("state present")
    }
}

/// A config with no criteria and checkpoints disabled (no git needed).
fn bare_config() -> TaskConfig {
    let mut config = TaskConfig::default();
    config.checkpoints.enabled = false;
    config
}

fn history_entry(seq: i64, summary: &str, pass_rate: f64) -> IterationEntry {
    let now = Utc::now();
    IterationEntry {
        seq,
        started_at: now,
        ended_at: now,
        duration_ms: 50,
        token_estimate: 5,
        outcome: IterationOutcome::Progress,
        summary: summary.to_owned(),
        pass_rate,
        had_criteria: true,
        error_message: None,
        files_changed: vec![],
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tick_without_state_approves() {
    let fx = Fixture::new();
    let transcript = fx.transcript("hello");

    let outcome = fx.driver.tick(&transcript).await.expect("tick");
    assert_eq!(outcome, TickOutcome::Approve);
}

#[tokio::test]
async fn plain_tick_blocks_and_continues_with_the_prompt() {
    let fx = Fixture::new();
    fx.seed_state(bare_config());
    let transcript = fx.transcript("made some progress");

    let outcome = fx.driver.tick(&transcript).await.expect("tick");
    match outcome {
        TickOutcome::Block { prompt } => assert_eq!(prompt, "build the widget"),
        other => panic!("expected Block, got {other:?}"),
    }

    let state = fx.reload_state();
    assert_eq!(state.iteration.current, 2);
    assert_eq!(state.iteration.history.len(), 1);
    assert!(state.metrics.total_tokens > 0);

    // The heartbeat carried the iteration report.
    let heartbeats = fx.api.heartbeats.lock().unwrap();
    assert_eq!(heartbeats.len(), 1);
    assert_eq!(heartbeats[0].iteration, Some(2));
    let report = heartbeats[0].progress.as_ref().expect("progress report");
    assert_eq!(report.seq, 1);
    assert_eq!(report.summary, "made some progress");
}

#[tokio::test]
async fn command_complete_finishes_and_reports() {
    let fx = Fixture::new();
    fx.seed_state(bare_config());
    command::write_command(&fx.driver.layout().command_file(), AgentCommand::Complete)
        .expect("drop command");
    let transcript = fx.transcript("whatever");

    let outcome = fx.driver.tick(&transcript).await.expect("tick");
    assert!(matches!(outcome, TickOutcome::Exit { .. }));

    let state = fx.reload_state();
    assert_eq!(state.task.status, TaskStatus::Completed);

    let statuses = fx.api.statuses.lock().unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].status, TaskStatus::Completed);
    assert_eq!(statuses[0].task_id, "t1");

    // Command file consumed.
    assert!(!fx.driver.layout().command_file().exists());
}

#[tokio::test]
async fn command_abort_terminates() {
    let fx = Fixture::new();
    fx.seed_state(bare_config());
    command::write_command(&fx.driver.layout().command_file(), AgentCommand::Abort)
        .expect("drop command");
    let transcript = fx.transcript("whatever");

    fx.driver.tick(&transcript).await.expect("tick");

    let statuses = fx.api.statuses.lock().unwrap();
    assert_eq!(statuses[0].status, TaskStatus::Aborted);
}

#[tokio::test]
async fn max_iterations_fails_the_task() {
    let fx = Fixture::new();
    let mut config = bare_config();
    config.max_iterations = 3;
    let mut state = fx.seed_state(config);
    state.iteration.current = 3;
    state.iteration.max = 3;
    state.save(&fx.driver.layout().state_file()).unwrap();

    let transcript = fx.transcript("still going");
    let outcome = fx.driver.tick(&transcript).await.expect("tick");

    match outcome {
        TickOutcome::Exit { reason } => assert!(reason.contains("max iterations")),
        other => panic!("expected Exit, got {other:?}"),
    }
    let statuses = fx.api.statuses.lock().unwrap();
    assert_eq!(statuses[0].status, TaskStatus::Failed);
}

#[tokio::test]
async fn token_budget_exceeded_fails_the_task() {
    let fx = Fixture::new();
    let mut config = bare_config();
    config.budget = Some(Budget {
        max_duration_secs: None,
        max_tokens: Some(1),
    });
    fx.seed_state(config);

    let transcript = fx.transcript("a fairly long transcript that costs tokens");
    let outcome = fx.driver.tick(&transcript).await.expect("tick");

    match outcome {
        TickOutcome::Exit { reason } => assert!(reason.contains("budget")),
        other => panic!("expected Exit, got {other:?}"),
    }
    let statuses = fx.api.statuses.lock().unwrap();
    assert_eq!(statuses[0].status, TaskStatus::Failed);
}

#[tokio::test]
async fn criteria_completion_auto_advances_to_next_task() {
    let fx = Fixture::new();
    let mut config = bare_config();
    config.criteria = vec![Criterion {
        name: "out".into(),
        config: CriterionConfig::FileExists {
            path: "OUT.txt".into(),
        },
        weight: 1,
        required: true,
        timeout_secs: 30,
    }];
    fx.seed_state(config);
    std::fs::write(fx.workspace().join("OUT.txt"), "done").unwrap();

    *fx.api.next_grant.lock().unwrap() = Some(ClaimGrant {
        task_id: "t2".into(),
        name: "task two".into(),
        prompt: "now do the next thing".into(),
        priority: 0,
        config: json!({}),
        version: 2,
        iteration: 0,
        lock_expires_at: Utc::now() + Duration::minutes(5),
        server_clock: 12,
    });

    let transcript = fx.transcript("finished everything");
    let outcome = fx.driver.tick(&transcript).await.expect("tick");

    match outcome {
        TickOutcome::Block { prompt } => assert_eq!(prompt, "now do the next thing"),
        other => panic!("expected Block with the new prompt, got {other:?}"),
    }

    // Terminal status for t1 reported, fresh state for t2 on disk.
    let statuses = fx.api.statuses.lock().unwrap();
    assert_eq!(statuses[0].task_id, "t1");
    assert_eq!(statuses[0].status, TaskStatus::Completed);

    let state = fx.reload_state();
    assert_eq!(state.task.id, "t2");
    assert_eq!(state.iteration.current, 1);
    assert!(state.iteration.history.is_empty());
}

#[tokio::test]
async fn criteria_completion_without_queued_work_exits() {
    let fx = Fixture::new();
    let mut config = bare_config();
    config.criteria = vec![Criterion {
        name: "out".into(),
        config: CriterionConfig::FileExists {
            path: "OUT.txt".into(),
        },
        weight: 1,
        required: true,
        timeout_secs: 30,
    }];
    fx.seed_state(config);
    std::fs::write(fx.workspace().join("OUT.txt"), "done").unwrap();

    let transcript = fx.transcript("finished");
    let outcome = fx.driver.tick(&transcript).await.expect("tick");
    assert!(matches!(outcome, TickOutcome::Exit { .. }));
}

#[tokio::test]
async fn same_output_with_retry_variation_appends_stuck_suffix() {
    // Stuck by same-output: two prior "no change" iterations plus this
    // tick's identical output trip the detector; retry-variation keeps
    // going with a marked prompt suffix.
    let fx = Fixture::new();
    let mut config = bare_config();
    config.stuck.strategy = RecoveryStrategy::RetryVariation;
    let mut state = fx.seed_state(config);
    state.push_history(history_entry(1, "no change", 0.5));
    state.push_history(history_entry(2, "no change", 0.5));
    state.iteration.current = 3;
    state.save(&fx.driver.layout().state_file()).unwrap();

    let transcript = fx.transcript("no change");
    let outcome = fx.driver.tick(&transcript).await.expect("tick");

    match outcome {
        TickOutcome::Block { prompt } => {
            assert!(prompt.starts_with("build the widget"));
            assert!(prompt.contains("STUCK DETECTED"), "prompt: {prompt}");
        }
        other => panic!("expected Block, got {other:?}"),
    }
}

#[tokio::test]
async fn same_output_with_abort_strategy_parks_the_task_stuck() {
    let fx = Fixture::new();
    let mut config = bare_config();
    config.stuck.strategy = RecoveryStrategy::Abort;
    let mut state = fx.seed_state(config);
    state.push_history(history_entry(1, "no change", 0.5));
    state.push_history(history_entry(2, "no change", 0.5));
    state.iteration.current = 3;
    state.save(&fx.driver.layout().state_file()).unwrap();

    let transcript = fx.transcript("no change");
    let outcome = fx.driver.tick(&transcript).await.expect("tick");

    match outcome {
        TickOutcome::Exit { reason } => assert!(reason.contains("stuck")),
        other => panic!("expected Exit, got {other:?}"),
    }

    let statuses = fx.api.statuses.lock().unwrap();
    assert_eq!(statuses[0].status, TaskStatus::Stuck);
    // The lock is handed back explicitly for the non-terminal stuck state.
    assert_eq!(fx.api.releases.lock().unwrap().as_slice(), ["t1"]);
}

#[tokio::test]
async fn rollback_strategy_restores_latest_checkpoint() {
    // Stuck at iteration 7 with checkpoints at 3 and 6: rollback applies
    // the newer one, rewinds the counter, truncates history, and restores
    // the metrics snapshot.
    let fx = Fixture::new();
    let mut config = bare_config();
    config.stuck.strategy = RecoveryStrategy::Rollback;
    let mut state = fx.seed_state(config);

    for seq in 1..=4 {
        state.push_history(history_entry(seq, &format!("step {seq}"), 0.3));
    }
    state.push_history(history_entry(5, "no change", 0.5));
    state.push_history(history_entry(6, "no change", 0.5));
    state.iteration.current = 7;
    state.metrics.total_tokens = 900;

    let snapshot = forge_agent::state::Metrics {
        total_tokens: 500,
        total_duration_ms: 60_000,
        files_touched: vec!["lib.rs".into()],
    };
    for iteration in [3, 6] {
        state.checkpoints.push(forge_agent::checkpoint::CheckpointRecord {
            id: format!("cp-{iteration}"),
            iteration,
            kind: forge_agent::checkpoint::CheckpointKind::Auto,
            stash_ref: "clean".into(),
            created_at: Utc::now(),
            metrics: snapshot.clone(),
        });
    }
    state.save(&fx.driver.layout().state_file()).unwrap();

    // This tick's output repeats the last two summaries -> same-output.
    let transcript = fx.transcript("no change");
    let outcome = fx.driver.tick(&transcript).await.expect("tick");

    match outcome {
        TickOutcome::Block { prompt } => {
            assert!(prompt.contains("rolled back"), "prompt: {prompt}");
        }
        other => panic!("expected Block, got {other:?}"),
    }

    let state = fx.reload_state();
    // Rewound to checkpoint 6, then advanced by the normal end-of-tick
    // increment.
    assert_eq!(state.iteration.current, 7);
    assert!(
        state.iteration.history.iter().all(|entry| entry.seq <= 6),
        "history truncated to the checkpoint"
    );
    assert_eq!(state.metrics.total_tokens, snapshot.total_tokens);
}

#[tokio::test]
async fn heartbeat_abort_command_is_honored() {
    let fx = Fixture::new();
    fx.seed_state(bare_config());
    fx.api
        .heartbeat_commands
        .lock()
        .unwrap()
        .push(InterventionCommand {
            id: "i1".into(),
            kind: InterventionKind::Abort,
            reason: "operator said stop".into(),
            params: json!(null),
        });

    let transcript = fx.transcript("working");
    let outcome = fx.driver.tick(&transcript).await.expect("tick");

    assert!(matches!(outcome, TickOutcome::Exit { .. }));
    let statuses = fx.api.statuses.lock().unwrap();
    assert_eq!(statuses[0].status, TaskStatus::Aborted);
}

#[tokio::test]
async fn outbox_drains_before_anything_else() {
    let fx = Fixture::new();
    // No active task, but a queued terminal status from an earlier outage.
    let outbox = Outbox::new(fx.driver.layout().outbox_file());
    outbox
        .enqueue(StatusUpdate {
            project_id: "p1".into(),
            task_id: "old-task".into(),
            node_id: "node-a".into(),
            status: TaskStatus::Completed,
            result: None,
            iteration: Some(9),
            expected_version: 4,
        })
        .unwrap();

    let transcript = fx.transcript("idle");
    let outcome = fx.driver.tick(&transcript).await.expect("tick");

    assert_eq!(outcome, TickOutcome::Approve);
    assert!(outbox.load().unwrap().is_empty(), "outbox must drain");
    let statuses = fx.api.statuses.lock().unwrap();
    assert_eq!(statuses[0].task_id, "old-task");
}

#[tokio::test]
async fn missing_transcript_records_an_error_iteration() {
    let fx = Fixture::new();
    fx.seed_state(bare_config());

    let outcome = fx
        .driver
        .tick(&fx.workspace().join("absent-transcript.txt"))
        .await
        .expect("tick");
    assert!(matches!(outcome, TickOutcome::Block { .. }));

    let state = fx.reload_state();
    assert_eq!(state.iteration.history.len(), 1);
    assert_eq!(
        state.iteration.history[0].outcome,
        IterationOutcome::Error
    );
    assert!(state.iteration.history[0].error_message.is_some());
}
