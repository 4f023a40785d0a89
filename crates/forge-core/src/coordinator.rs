//! Shared coordinator state handed to every protocol operation.

use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;

use forge_db::config::DbConfig;
use forge_db::pool;
use forge_db::queries::sync_log;

use crate::bus::BroadcastBus;
use crate::clock::LogicalClock;

/// Shared state behind every coordinator operation: the store, the logical
/// clock, and the broadcast bus. Cheap to clone into request handlers.
#[derive(Debug, Clone)]
pub struct Coordinator {
    pub pool: SqlitePool,
    pub clock: Arc<LogicalClock>,
    pub bus: BroadcastBus,
}

impl Coordinator {
    /// Open the database at the configured path and seed the logical clock
    /// from the highest recorded sync-log value.
    pub async fn open(config: &DbConfig) -> Result<Self> {
        let pool = pool::create_pool(config).await?;
        Self::from_pool(pool).await
    }

    /// Build a coordinator over an existing pool (tests use this).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let seed = sync_log::max_logical_clock(&pool).await?;
        Ok(Self {
            pool,
            clock: Arc::new(LogicalClock::new(seed)),
            bus: BroadcastBus::default(),
        })
    }
}
