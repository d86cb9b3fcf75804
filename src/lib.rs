//! huntarr - Run orchestration and event streaming for job-application automation
//!
//! Drives multi-stage pipeline runs (discover, rank, prepare, submit, verify)
//! through a durable state machine, suspends them when a human has to clear
//! a challenge, and streams every step as an ordered event log.
//!
//! # Architecture
//!
//! - Runs are durable records; a suspended run is a persisted `paused`
//!   status, never a parked task, so execution survives restarts
//! - Each tick executes one node and commits its outcome, events and
//!   records in a single transaction
//! - Events carry per-run sequential ids; batch readers and live
//!   subscribers see them in the same order
//!
//! # Modules
//!
//! - `domain`: Data structures (Run, RunEvent, ManualAction, Application)
//! - `store`: SQLite persistence
//! - `core`: Orchestration logic (StateMachine, EventLog, ManualQueue, Orchestrator)
//! - `pipeline`: The default job-hunt pipeline nodes
//! - `adapters`: External automation integrations
//! - `api`: HTTP/SSE surface
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Start the orchestrator and API
//! huntarr serve --addr 127.0.0.1:8000
//!
//! # Inspect runs
//! huntarr runs
//! huntarr status <run-id>
//! huntarr events <run-id> --after 0
//! ```

pub mod adapters;
pub mod api;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod pipeline;
pub mod store;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, OrchestratorError, OrchestratorSettings};
pub use domain::{ManualAction, Run, RunEvent, RunStatus};
pub use store::Store;
