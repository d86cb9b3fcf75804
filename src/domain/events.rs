//! Run events for the append-only event log.
//!
//! Events are immutable, ordered records of everything that happens
//! during a run. Ids are allocated per run, start at 1 and have no gaps.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single persisted event in a run's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Position in the run's sequence, used as the `after_id` cursor
    pub id: i64,

    /// The run this event belongs to
    pub run_id: String,

    /// Severity
    pub level: EventLevel,

    /// Emitting stage, if any
    pub node: Option<String>,

    /// Symbolic tag (see [`event_types`])
    pub event_type: String,

    /// Human-readable text
    pub message: String,

    /// Structured detail
    pub payload_json: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
}

/// An event that has not been assigned an id yet
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub level: EventLevel,
    pub node: Option<String>,
    pub event_type: String,
    pub message: String,
    pub payload: Option<serde_json::Value>,
}

impl NewEvent {
    /// Create a new event at the given level
    pub fn new(level: EventLevel, event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            node: None,
            event_type: event_type.into(),
            message: message.into(),
            payload: None,
        }
    }

    pub fn info(event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventLevel::Info, event_type, message)
    }

    pub fn warning(event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventLevel::Warning, event_type, message)
    }

    pub fn error(event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventLevel::Error, event_type, message)
    }

    /// Attach the emitting node
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Attach a structured payload
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown event level '{}'", other)),
        }
    }
}

/// Event types emitted by the orchestrator itself.
/// Nodes are free to emit their own tags.
pub mod event_types {
    pub const RUN_CREATED: &str = "run_created";
    pub const RUN_STARTED: &str = "run_started";
    pub const RUN_PAUSED: &str = "run_paused";
    pub const RUN_RESUMED: &str = "run_resumed";
    pub const RUN_COMPLETED: &str = "run_completed";
    pub const RUN_FAILED: &str = "run_failed";
    pub const NODE_ADVANCED: &str = "node_advanced";
    pub const MANUAL_ACTION_CREATED: &str = "manual_action_created";
    pub const MANUAL_ACTION_DEFERRED: &str = "manual_action_deferred";
    pub const MANUAL_SESSION_STARTED: &str = "manual_session_started";
    pub const MANUAL_ACTION_RESOLVED: &str = "manual_action_resolved";
}
