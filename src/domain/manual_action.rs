//! Manual actions: points where a run needs a human in the loop.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A human-intervention request raised against a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualAction {
    pub id: String,
    pub run_id: String,

    /// Node that was suspended (None for operator-raised actions)
    pub node: Option<String>,

    pub job_id: Option<String>,
    pub company: Option<String>,
    pub title: Option<String>,

    /// Symbolic type, e.g. captcha, otp, login_challenge
    pub action_type: String,

    pub status: ManualActionStatus,

    /// Context captured when the action was raised
    pub details: serde_json::Value,

    /// Details supplied by the operator on resolution
    pub resolution: Option<serde_json::Value>,

    /// Remote browser session for the operator
    pub session_url: Option<String>,

    /// Set when an operator opened the session (annotation only)
    pub session_started_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ManualAction {
    pub fn is_pending(&self) -> bool {
        self.status == ManualActionStatus::Pending
    }
}

/// Manual action status: `pending -> resolved`, nothing else
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualActionStatus {
    Pending,
    Resolved,
}

impl ManualActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
        }
    }
}

impl fmt::Display for ManualActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ManualActionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            other => Err(format!("unknown manual action status '{}'", other)),
        }
    }
}

/// Request to suspend a run pending human action.
///
/// Produced by nodes (via `NodeOutcome::Suspend`) or by operators
/// through the API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManualActionRequest {
    pub action_type: String,

    #[serde(default)]
    pub job_id: Option<String>,

    #[serde(default)]
    pub company: Option<String>,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub details: Option<serde_json::Value>,

    #[serde(default)]
    pub session_url: Option<String>,
}

impl ManualActionRequest {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            ..Self::default()
        }
    }

    /// Attach job context
    pub fn for_job(
        mut self,
        job_id: impl Into<String>,
        company: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        self.job_id = Some(job_id.into());
        self.company = Some(company.into());
        self.title = Some(title.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Filter for listing manual actions
#[derive(Debug, Clone, Default)]
pub struct ManualActionFilter {
    pub status: Option<ManualActionStatus>,
    pub run_id: Option<String>,
}
