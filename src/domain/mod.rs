//! Domain types for the huntarr orchestrator.
//!
//! This module contains the core data structures:
//! - Run: Pipeline execution record
//! - RunEvent: Immutable, ordered records of what happened
//! - ManualAction: Human-in-the-loop suspension requests
//! - Application: Output records written by pipeline nodes

pub mod application;
pub mod events;
pub mod manual_action;
pub mod run;
pub mod search_config;

// Re-export commonly used types
pub use application::{Application, ApplicationStatus, JobPosting, NewApplication};
pub use events::{event_types, EventLevel, NewEvent, RunEvent};
pub use manual_action::{
    ManualAction, ManualActionFilter, ManualActionRequest, ManualActionStatus,
};
pub use run::{MetricDeltas, Run, RunMetrics, RunMode, RunStatus};
pub use search_config::{InvalidSearchConfig, SearchConfig};
