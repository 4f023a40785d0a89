//! Agent core for the forge platform.
//!
//! One agent runs per workspace and owns a single active task. The
//! iteration driver consumes the parent runtime's transcript once per turn,
//! scores success criteria, watches for stuck patterns, checkpoints the
//! working tree, and reports progress to the coordinator -- falling back to
//! a durable outbox whenever the network is away.

pub mod checkpoint;
pub mod client;
pub mod command;
pub mod criteria;
pub mod driver;
pub mod gates;
pub mod layout;
pub mod outbox;
pub mod state;
pub mod stuck;
pub mod transcript;

pub use client::{CoordinatorApi, CoordinatorClient};
pub use driver::{IterationDriver, TickOutcome};
pub use state::AgentState;
