//! Error taxonomy for the orchestration core.

use thiserror::Error;

use crate::domain::{InvalidSearchConfig, RunStatus};
use crate::store::StoreError;

/// Errors surfaced by the orchestrator, manual action queue and event log
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Referenced run, manual action or event does not exist
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// Operation attempted against an incompatible status
    #[error("cannot {operation} run '{run_id}' while it is {status}")]
    InvalidState {
        run_id: String,
        status: RunStatus,
        operation: &'static str,
    },

    /// Operation not valid for a manual action in its current status
    #[error("cannot {operation} manual action '{action_id}': {reason}")]
    InvalidActionState {
        action_id: String,
        operation: &'static str,
        reason: String,
    },

    /// A manual action is outstanding for the run
    #[error("run '{run_id}' is blocked by pending manual action '{action_id}'")]
    ManualActionPending { run_id: String, action_id: String },

    /// Malformed input rejected before reaching the core
    #[error("invalid payload: {0}")]
    PayloadValidation(String),

    /// Durable storage failure
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl OrchestratorError {
    pub fn run_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "run",
            id: id.into(),
        }
    }

    pub fn action_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "manual action",
            id: id.into(),
        }
    }

    /// Whether retrying the same call could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

impl From<InvalidSearchConfig> for OrchestratorError {
    fn from(err: InvalidSearchConfig) -> Self {
        Self::PayloadValidation(err.to_string())
    }
}

/// Failure inside a pipeline node's `execute`.
///
/// Never leaves the orchestrator: it is always converted into a failed run.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("{0}")]
    Message(String),

    #[error("external automation error: {0}")]
    Automation(String),

    #[error("invalid run state: {0}")]
    State(#[from] serde_json::Error),
}

impl NodeError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

impl From<anyhow::Error> for NodeError {
    fn from(err: anyhow::Error) -> Self {
        Self::Automation(format!("{:#}", err))
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
