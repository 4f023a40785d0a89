//! Status-sync outbox: at-least-once delivery of terminal status updates.
//!
//! A failed POST queues the update in a file-backed list. Every tick starts
//! by draining the outbox: items under the attempt cap are retried, removed
//! on success, bumped on failure, and discarded (with a log line) once they
//! hit the cap. A newer update for the same task replaces the queued one.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::{CoordinatorApi, StatusUpdate};
use crate::layout::{read_json, write_json_atomic};

/// Attempts after which a queued update is dropped.
pub const MAX_ATTEMPTS: u32 = 10;
/// In-call retries before an update is queued.
pub const IMMEDIATE_RETRIES: u32 = 3;
/// Base of the linear in-call backoff.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// One queued update plus its delivery bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUpdate {
    #[serde(flatten)]
    pub update: StatusUpdate,
    pub attempts: u32,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub delivered: usize,
    pub retained: usize,
    pub discarded: usize,
}

/// The file-backed outbox.
#[derive(Debug, Clone)]
pub struct Outbox {
    path: PathBuf,
}

impl Outbox {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the queued updates (empty when the file is absent).
    pub fn load(&self) -> Result<Vec<PendingUpdate>> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    fn save(&self, items: &[PendingUpdate]) -> Result<()> {
        write_json_atomic(&self.path, &items)
    }

    /// Queue an update, replacing any queued update for the same task
    /// (last-writer-wins).
    pub fn enqueue(&self, update: StatusUpdate) -> Result<()> {
        let mut items = self.load()?;
        items.retain(|item| item.update.task_id != update.task_id);
        items.push(PendingUpdate {
            update,
            attempts: 0,
            last_attempt_at: None,
        });
        self.save(&items)
    }

    /// Retry every queued update once.
    pub async fn drain(&self, api: &dyn CoordinatorApi) -> Result<DrainStats> {
        let items = self.load()?;
        if items.is_empty() {
            return Ok(DrainStats::default());
        }

        let mut stats = DrainStats::default();
        let mut retained = Vec::new();

        for mut item in items {
            if item.attempts >= MAX_ATTEMPTS {
                tracing::warn!(
                    task_id = %item.update.task_id,
                    attempts = item.attempts,
                    "dropping status update after too many attempts"
                );
                stats.discarded += 1;
                continue;
            }

            match api.post_status(&item.update).await {
                Ok(()) => {
                    tracing::info!(
                        task_id = %item.update.task_id,
                        attempts = item.attempts,
                        "queued status update delivered"
                    );
                    stats.delivered += 1;
                }
                Err(err) => {
                    item.attempts += 1;
                    item.last_attempt_at = Some(Utc::now());
                    tracing::debug!(
                        task_id = %item.update.task_id,
                        attempts = item.attempts,
                        error = %err,
                        "status update still undeliverable"
                    );
                    stats.retained += 1;
                    retained.push(item);
                }
            }
        }

        self.save(&retained)?;
        Ok(stats)
    }

    /// Deliver an update now, with bounded linear backoff, queueing it on
    /// final failure. Returns whether the update went through directly.
    pub async fn send_or_enqueue(
        &self,
        api: &dyn CoordinatorApi,
        update: StatusUpdate,
    ) -> Result<bool> {
        for attempt in 1..=IMMEDIATE_RETRIES {
            match api.post_status(&update).await {
                Ok(()) => return Ok(true),
                Err(err) => {
                    tracing::debug!(
                        task_id = %update.task_id,
                        attempt,
                        error = %err,
                        "status post failed"
                    );
                    if attempt < IMMEDIATE_RETRIES {
                        tokio::time::sleep(BACKOFF_BASE * attempt).await;
                    }
                }
            }
        }

        tracing::warn!(
            task_id = %update.task_id,
            "coordinator unreachable, queueing status update"
        );
        self.enqueue(update)?;
        Ok(false)
    }
}
