//! Coordinator core for the forge platform.
//!
//! Everything the coordinator does to keep the distributed view of tasks
//! consistent lives here: the sync protocol (handshake/push/pull), the
//! conflict resolver, the task state machine, the lock & lease manager,
//! operator interventions, the queue/dependency DAG, and the broadcast bus.
//! The HTTP layer in `forge-cli` is a thin mapping onto these functions.

pub mod bus;
pub mod clock;
pub mod coordinator;
pub mod error;
pub mod intervention;
pub mod lock;
pub mod queue;
pub mod resolve;
pub mod state;
pub mod status;
pub mod sync;

pub use coordinator::Coordinator;
pub use error::SyncError;
