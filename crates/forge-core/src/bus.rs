//! In-process broadcast bus.
//!
//! A bounded multi-producer fan-out. Publishing never blocks and never
//! fails the writer: with no subscribers the event is dropped, and a slow
//! subscriber observes `Lagged` on its receiver rather than back-pressuring
//! handlers. Events carry ids and small payloads only; consumers pull full
//! state through the sync API when they need it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use forge_db::models::TaskStatus;

/// Default channel capacity before laggards start losing events.
pub const DEFAULT_CAPACITY: usize = 256;

/// A typed event on the bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum BusEvent {
    #[serde(rename = "task:update")]
    TaskUpdate {
        project_id: String,
        task_id: String,
        status: TaskStatus,
        version: i64,
    },
    #[serde(rename = "task:locked")]
    TaskLocked {
        project_id: String,
        task_id: String,
        node_id: String,
        expires_at: DateTime<Utc>,
    },
    #[serde(rename = "task:unlocked")]
    TaskUnlocked {
        project_id: String,
        task_id: String,
    },
    #[serde(rename = "task:progress")]
    TaskProgress {
        project_id: String,
        task_id: String,
        iteration: i64,
    },
    #[serde(rename = "task:stuck")]
    TaskStuck {
        project_id: String,
        task_id: String,
        reason: String,
    },
    #[serde(rename = "queue:update")]
    QueueUpdate { project_id: String },
    #[serde(rename = "node:registered")]
    NodeRegistered {
        project_id: String,
        node_id: String,
    },
}

impl BusEvent {
    /// The event's wire tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskUpdate { .. } => "task:update",
            Self::TaskLocked { .. } => "task:locked",
            Self::TaskUnlocked { .. } => "task:unlocked",
            Self::TaskProgress { .. } => "task:progress",
            Self::TaskStuck { .. } => "task:stuck",
            Self::QueueUpdate { .. } => "queue:update",
            Self::NodeRegistered { .. } => "node:registered",
        }
    }
}

/// Handle to the broadcast channel. Cheap to clone; all clones publish into
/// the same fan-out.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<BusEvent>,
}

impl BroadcastBus {
    /// Create a bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Best-effort: an error (no live subscribers) is
    /// swallowed.
    pub fn publish(&self, event: BusEvent) {
        if let Err(err) = self.tx.send(event) {
            tracing::trace!(dropped = %err.0.kind(), "no bus subscribers");
        }
    }

    /// Subscribe to the bus. The receiver sees events published after this
    /// call; falling more than the capacity behind loses the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
