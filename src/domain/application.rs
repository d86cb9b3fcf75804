//! Job postings and application records produced by pipeline nodes.
//!
//! These are output artifacts from the orchestrator's point of view: it
//! records them but does not interpret them.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A discovered job posting as carried through `state_json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
    pub id: String,

    #[serde(default)]
    pub source: Option<String>,

    pub title: String,
    pub company: String,

    #[serde(default)]
    pub location: Option<String>,

    pub url: String,

    #[serde(default)]
    pub description: String,

    /// Set by the ranking stage
    #[serde(default)]
    pub score: Option<f64>,
}

/// An application attempt recorded against a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub run_id: String,
    pub job_id: String,
    pub company: Option<String>,
    pub title: Option<String>,
    pub status: ApplicationStatus,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Application to be persisted with a node outcome
#[derive(Debug, Clone, PartialEq)]
pub struct NewApplication {
    pub job_id: String,
    pub company: Option<String>,
    pub title: Option<String>,
    pub status: ApplicationStatus,
    pub details: serde_json::Value,
}

impl NewApplication {
    pub fn for_job(job: &JobPosting, status: ApplicationStatus) -> Self {
        Self {
            job_id: job.id.clone(),
            company: Some(job.company.clone()),
            title: Some(job.title.clone()),
            status,
            details: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Submitted,
    Failed,
    Skipped,
    Pending,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Pending => "pending",
        }
    }
}

impl FromStr for ApplicationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(Self::Submitted),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "pending" => Ok(Self::Pending),
            other => Err(format!("unknown application status '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_posting_defaults() {
        let job: JobPosting = serde_json::from_value(json!({
            "id": "job-1",
            "title": "Platform Engineer",
            "company": "Acme",
            "url": "https://boards.greenhouse.io/acme/jobs/1"
        }))
        .unwrap();

        assert!(job.score.is_none());
        assert!(job.description.is_empty());
    }

    #[test]
    fn test_new_application_copies_job_context() {
        let job = JobPosting {
            id: "job-9".to_string(),
            source: Some("remoteok".to_string()),
            title: "SRE".to_string(),
            company: "Globex".to_string(),
            location: None,
            url: "https://jobs.lever.co/globex/9".to_string(),
            description: String::new(),
            score: Some(0.8),
        };

        let app = NewApplication::for_job(&job, ApplicationStatus::Submitted)
            .with_details(json!({"confirmation_text": "Thanks!"}));

        assert_eq!(app.job_id, "job-9");
        assert_eq!(app.company.as_deref(), Some("Globex"));
        assert_eq!(app.details["confirmation_text"], "Thanks!");
    }
}
