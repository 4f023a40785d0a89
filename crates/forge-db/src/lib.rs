//! Durable store for the forge coordination core.
//!
//! Holds the SQLite-backed tables shared by the coordinator and replicated
//! to by agents: projects, tasks, dependency edges, nodes, interventions,
//! iteration records, and the append-only sync log.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
