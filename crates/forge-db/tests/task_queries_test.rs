//! Integration tests for the conditional-UPDATE task queries.
//!
//! The coordinator's correctness rests on these guards: a mismatched
//! status, version, or lock owner must leave the row untouched and report
//! zero affected rows.

use chrono::{Duration, Utc};
use serde_json::json;

use forge_db::models::TaskStatus;
use forge_db::queries::projects as project_db;
use forge_db::queries::tasks::{self as db, NewTask};
use forge_test_utils::create_test_db;

const PROJECT: &str = "proj-1";

async fn seed(pool: &sqlx::SqlitePool, id: &str, status: &str) {
    db::insert_task(
        pool,
        &NewTask {
            id,
            project_id: PROJECT,
            name: id,
            prompt: "work",
            priority: 0,
            config: &json!({}),
        },
    )
    .await
    .expect("insert");
    if status != "pending" {
        sqlx::query("UPDATE tasks SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(pool)
            .await
            .expect("fixture");
    }
}

async fn setup() -> (forge_test_utils::TestDb, sqlx::SqlitePool) {
    let db = create_test_db().await;
    let pool = db.pool.clone();
    project_db::upsert_project(&pool, PROJECT, "Project One", "/tmp/p")
        .await
        .expect("project");
    (db, pool)
}

#[tokio::test]
async fn insert_defaults() {
    let (_db, pool) = setup().await;
    seed(&pool, "t1", "pending").await;

    let task = db::get_task(&pool, "t1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.sync_version, 1);
    assert_eq!(task.iteration, 0);
    assert!(task.locked_by.is_none());
    assert!(task.result.is_none());
}

#[tokio::test]
async fn transition_guards_on_expected_status() {
    let (_db, pool) = setup().await;
    seed(&pool, "t1", "pending").await;

    let rows = db::transition_status(
        &pool,
        "t1",
        TaskStatus::Pending,
        TaskStatus::Queued,
        None,
        None,
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    // Stale expectation: the task is queued now, not pending.
    let rows = db::transition_status(
        &pool,
        "t1",
        TaskStatus::Pending,
        TaskStatus::Queued,
        None,
        None,
    )
    .await
    .unwrap();
    assert_eq!(rows, 0);

    let task = db::get_task(&pool, "t1").await.unwrap().unwrap();
    assert_eq!(task.sync_version, 2, "failed guard must not bump");
}

#[tokio::test]
async fn apply_push_guards_on_version() {
    let (_db, pool) = setup().await;
    seed(&pool, "t1", "running").await;

    let rows = db::apply_push(
        &pool,
        "t1",
        99,
        TaskStatus::Completed,
        None,
        None,
        Utc::now(),
    )
    .await
    .unwrap();
    assert_eq!(rows, 0, "wrong version must not apply");

    let rows = db::apply_push(
        &pool,
        "t1",
        1,
        TaskStatus::Completed,
        Some(&json!({ "success": true })),
        Some(4),
        Utc::now(),
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    let task = db::get_task(&pool, "t1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.sync_version, 2);
    assert_eq!(task.iteration, 4);
    assert!(task.completed_at.is_some());
    assert!(task.locked_by.is_none());
}

#[tokio::test]
async fn claim_respects_live_foreign_lock() {
    let (_db, pool) = setup().await;
    seed(&pool, "t1", "queued").await;
    let now = Utc::now();

    let rows = db::claim_task(&pool, "t1", "node-a", now, now + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(rows, 1);

    let rows = db::claim_task(&pool, "t1", "node-b", now, now + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(rows, 0, "live lock must not be stolen");

    let task = db::get_task(&pool, "t1").await.unwrap().unwrap();
    assert_eq!(task.locked_by.as_deref(), Some("node-a"));
}

#[tokio::test]
async fn claim_steals_at_expiry_instant() {
    let (_db, pool) = setup().await;
    seed(&pool, "t1", "queued").await;
    let then = Utc::now() - Duration::minutes(10);

    db::claim_task(&pool, "t1", "node-a", then, then).await.unwrap();

    // Lease expired at `then`; a claim "now" steals.
    let now = Utc::now();
    let rows = db::claim_task(&pool, "t1", "node-b", now, now + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(rows, 1);

    let task = db::get_task(&pool, "t1").await.unwrap().unwrap();
    assert_eq!(task.locked_by.as_deref(), Some("node-b"));
    assert_eq!(task.status, TaskStatus::Running);
}

#[tokio::test]
async fn extend_lease_requires_owner_and_keeps_version() {
    let (_db, pool) = setup().await;
    seed(&pool, "t1", "queued").await;
    let now = Utc::now();
    db::claim_task(&pool, "t1", "node-a", now, now + Duration::minutes(5))
        .await
        .unwrap();
    let version = db::get_task(&pool, "t1").await.unwrap().unwrap().sync_version;

    let rows = db::extend_lease(&pool, "t1", "node-b", now + Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(rows, 0);

    let rows = db::extend_lease(&pool, "t1", "node-a", now + Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(rows, 1);

    let task = db::get_task(&pool, "t1").await.unwrap().unwrap();
    assert_eq!(task.sync_version, version, "lease renewal is version-silent");
}

#[tokio::test]
async fn release_reverts_running_to_queued() {
    let (_db, pool) = setup().await;
    seed(&pool, "t1", "queued").await;
    let now = Utc::now();
    db::claim_task(&pool, "t1", "node-a", now, now + Duration::minutes(5))
        .await
        .unwrap();

    let rows = db::release_lock(&pool, "t1", "node-a").await.unwrap();
    assert_eq!(rows, 1);

    let task = db::get_task(&pool, "t1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert!(task.locked_by.is_none());
    assert_eq!(task.sync_version, 3);
}

#[tokio::test]
async fn sweep_collects_only_expired_running_tasks() {
    let (_db, pool) = setup().await;
    seed(&pool, "expired", "queued").await;
    seed(&pool, "healthy", "queued").await;
    seed(&pool, "idle", "pending").await;

    let then = Utc::now() - Duration::minutes(10);
    db::claim_task(&pool, "expired", "node-a", then, then).await.unwrap();
    let now = Utc::now();
    db::claim_task(&pool, "healthy", "node-b", now, now + Duration::minutes(5))
        .await
        .unwrap();

    let swept = db::sweep_expired(&pool, Utc::now()).await.unwrap();
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].id, "expired");
    assert_eq!(swept[0].status, TaskStatus::Stuck);
}

#[tokio::test]
async fn retry_to_queued_only_from_settled_states() {
    let (_db, pool) = setup().await;
    seed(&pool, "done", "failed").await;
    seed(&pool, "busy", "running").await;

    assert_eq!(db::retry_to_queued(&pool, "done", true).await.unwrap(), 1);
    assert_eq!(db::retry_to_queued(&pool, "busy", true).await.unwrap(), 0);

    let task = db::get_task(&pool, "done").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.iteration, 0);
}

#[tokio::test]
async fn promote_unblocked_requires_all_dependencies_completed() {
    let (_db, pool) = setup().await;
    seed(&pool, "dep-a", "completed").await;
    seed(&pool, "dep-b", "running").await;
    seed(&pool, "waiting", "blocked").await;
    db::insert_dependency(&pool, "waiting", "dep-a").await.unwrap();
    db::insert_dependency(&pool, "waiting", "dep-b").await.unwrap();

    let promoted = db::promote_unblocked(&pool, PROJECT).await.unwrap();
    assert!(promoted.is_empty(), "dep-b is still running");

    sqlx::query("UPDATE tasks SET status = 'completed' WHERE id = 'dep-b'")
        .execute(&pool)
        .await
        .unwrap();

    let promoted = db::promote_unblocked(&pool, PROJECT).await.unwrap();
    assert_eq!(promoted.len(), 1);
    assert_eq!(promoted[0].id, "waiting");
    assert_eq!(promoted[0].status, TaskStatus::Queued);
}

#[tokio::test]
async fn next_queued_orders_by_priority_then_age() {
    let (_db, pool) = setup().await;
    for (id, priority) in [("later", 5), ("sooner", 1)] {
        db::insert_task(
            &pool,
            &NewTask {
                id,
                project_id: PROJECT,
                name: id,
                prompt: "work",
                priority,
                config: &json!({}),
            },
        )
        .await
        .unwrap();
        sqlx::query("UPDATE tasks SET status = 'queued' WHERE id = ?")
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();
    }

    let next = db::next_queued(&pool, PROJECT, Utc::now()).await.unwrap();
    assert_eq!(next.unwrap().id, "sooner");
}

#[tokio::test]
async fn status_counts_aggregate() {
    let (_db, pool) = setup().await;
    seed(&pool, "a", "queued").await;
    seed(&pool, "b", "queued").await;
    seed(&pool, "c", "completed").await;

    let counts = db::status_counts(&pool, PROJECT).await.unwrap();
    assert_eq!(counts.queued, 2);
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.total, 3);
}
