//! Run records.
//!
//! A Run is one execution of the automation pipeline. Its lifecycle is
//! driven exclusively by the orchestrator through `core::state_machine`;
//! this module only holds the data and a few derived queries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::search_config::SearchConfig;

/// A pipeline execution run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Opaque unique identifier
    pub id: String,

    /// Origin of the invocation
    pub mode: RunMode,

    /// Externally visible lifecycle status
    pub status: RunStatus,

    /// Stage currently executing or last attempted (None before start)
    pub current_node: Option<String>,

    /// Discovery parameters captured at creation, never mutated
    pub search_config: SearchConfig,

    /// Inter-node working state, owned by the orchestrator
    pub state_json: serde_json::Value,

    /// Outcome counters
    pub metrics: RunMetrics,

    /// Last fatal error (only set on failure)
    pub error: Option<String>,

    /// Set while an operator has paused the run
    pub operator_paused: bool,

    /// Pending manual action blocking progress, if any
    pub blocked_by_manual_action: Option<String>,

    /// Manual action resolved since the last node execution.
    /// Handed to the node on its next execution, then cleared.
    #[serde(skip)]
    pub resumed_action_id: Option<String>,

    /// Number of node executions so far (bounded by the safety budget)
    pub node_executions: u64,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Create a new queued run
    pub fn new(id: String, mode: RunMode, search_config: SearchConfig, now: DateTime<Utc>) -> Self {
        Self {
            id,
            mode,
            status: RunStatus::Queued,
            current_node: None,
            search_config,
            state_json: serde_json::Value::Object(serde_json::Map::new()),
            metrics: RunMetrics::default(),
            error: None,
            operator_paused: false,
            blocked_by_manual_action: None,
            resumed_action_id: None,
            node_executions: 0,
            created_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Check if the run has reached completed or failed
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if the run has been started at least once
    pub fn has_started(&self) -> bool {
        self.started_at.is_some()
    }
}

/// Origin of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Manual,
    Scheduled,
}

impl Default for RunMode {
    fn default() -> Self {
        Self::Manual
    }
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
        }
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "scheduled" => Ok(Self::Scheduled),
            other => Err(format!("unknown run mode '{}'", other)),
        }
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet picked up
    Queued,

    /// Executing nodes
    Running,

    /// Blocked by an operator pause and/or a pending manual action
    Paused,

    /// Finished successfully (terminal)
    Completed,

    /// Finished with an error (terminal)
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

/// Outcome counters of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    #[serde(default)]
    pub discovered: u64,
    #[serde(default)]
    pub applied: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub manual_required: u64,
    #[serde(default)]
    pub skipped: u64,
}

impl RunMetrics {
    /// Add a set of deltas. Deltas are unsigned, so counters never decrease.
    pub fn apply(&mut self, deltas: &MetricDeltas) {
        self.discovered += deltas.discovered;
        self.applied += deltas.applied;
        self.failed += deltas.failed;
        self.manual_required += deltas.manual_required;
        self.skipped += deltas.skipped;
    }
}

/// Increments reported by a node alongside its outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDeltas {
    #[serde(default)]
    pub discovered: u64,
    #[serde(default)]
    pub applied: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub manual_required: u64,
    #[serde(default)]
    pub skipped: u64,
}

impl MetricDeltas {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn discovered(n: u64) -> Self {
        Self {
            discovered: n,
            ..Self::default()
        }
    }

    pub fn applied(n: u64) -> Self {
        Self {
            applied: n,
            ..Self::default()
        }
    }

    pub fn failed(n: u64) -> Self {
        Self {
            failed: n,
            ..Self::default()
        }
    }

    pub fn skipped(n: u64) -> Self {
        Self {
            skipped: n,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
