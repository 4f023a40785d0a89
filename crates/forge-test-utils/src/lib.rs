//! Shared test utilities for forge integration tests.
//!
//! Provides a throwaway SQLite database per test. Each database lives in
//! its own temp directory, which is dropped (and deleted) with the returned
//! handle, so tests are fully isolated and idempotent.

use sqlx::SqlitePool;
use tempfile::TempDir;

use forge_db::config::DbConfig;
use forge_db::pool;

/// A temporary database: pool plus the directory backing it.
///
/// Hold this for the duration of the test; dropping it deletes the
/// database file.
pub struct TestDb {
    pub pool: SqlitePool,
    _dir: TempDir,
}

/// Create a temporary database with the schema applied.
pub async fn create_test_db() -> TestDb {
    let dir = TempDir::new().expect("failed to create temp dir for test db");
    let config = DbConfig::new(dir.path().join("forge-test.db"));

    let pool = pool::create_pool(&config)
        .await
        .expect("failed to create test database pool");

    TestDb { pool, _dir: dir }
}
