//! Adapter interfaces for external systems.
//!
//! Scraping, document generation and browser submission live outside this
//! crate. The pipeline reaches them through the [`Automation`] trait.

pub mod http;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{ApplicationStatus, JobPosting, ManualAction, SearchConfig};

pub use http::HttpAutomation;

/// Documents prepared for one application
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Documents {
    #[serde(default)]
    pub resume_path: Option<String>,

    #[serde(default)]
    pub cover_letter_path: Option<String>,

    /// Questionnaire answers, opaque to the orchestrator
    #[serde(default)]
    pub answers: serde_json::Value,
}

/// Outcome of a submission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    Submitted,
    Skipped,
    Failed,
    /// Blocked by a challenge a human must clear
    ManualRequired,
}

impl SubmitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::ManualRequired => "manual_required",
        }
    }

    /// Application record status for a finished attempt
    pub fn application_status(&self) -> ApplicationStatus {
        match self {
            Self::Submitted => ApplicationStatus::Submitted,
            Self::Skipped => ApplicationStatus::Skipped,
            Self::Failed => ApplicationStatus::Failed,
            Self::ManualRequired => ApplicationStatus::Pending,
        }
    }
}

/// Result reported by the submission automation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResult {
    pub status: SubmitStatus,

    #[serde(default)]
    pub source_portal: Option<String>,

    #[serde(default)]
    pub failure_code: Option<String>,

    #[serde(default)]
    pub confirmation_text: Option<String>,

    /// Challenge type when `status` is `manual_required`
    #[serde(default)]
    pub manual_action_type: Option<String>,

    #[serde(default)]
    pub artifacts: serde_json::Value,
}

impl SubmitResult {
    pub fn new(status: SubmitStatus) -> Self {
        Self {
            status,
            source_portal: None,
            failure_code: None,
            confirmation_text: None,
            manual_action_type: None,
            artifacts: serde_json::Value::Null,
        }
    }

    pub fn failed(failure_code: impl Into<String>) -> Self {
        Self {
            failure_code: Some(failure_code.into()),
            ..Self::new(SubmitStatus::Failed)
        }
    }

    pub fn challenge(action_type: impl Into<String>) -> Self {
        Self {
            manual_action_type: Some(action_type.into()),
            ..Self::new(SubmitStatus::ManualRequired)
        }
    }
}

/// External job automation
#[async_trait]
pub trait Automation: Send + Sync {
    /// Human-readable name
    fn name(&self) -> &str;

    /// Find candidate jobs for a search
    async fn discover(&self, config: &SearchConfig) -> Result<Vec<JobPosting>>;

    /// Prepare tailored documents for a job
    async fn prepare_documents(&self, run_id: &str, job: &JobPosting) -> Result<Documents>;

    /// Attempt a submission. `resumed` is the manual action an operator just
    /// resolved for this job, if any.
    async fn submit(
        &self,
        run_id: &str,
        job: &JobPosting,
        documents: &Documents,
        resumed: Option<&ManualAction>,
    ) -> Result<SubmitResult>;
}

/// Automation used when no external service is configured.
///
/// Discovers nothing and skips every submission.
#[derive(Debug, Clone, Default)]
pub struct NullAutomation;

#[async_trait]
impl Automation for NullAutomation {
    fn name(&self) -> &str {
        "null"
    }

    async fn discover(&self, _config: &SearchConfig) -> Result<Vec<JobPosting>> {
        Ok(Vec::new())
    }

    async fn prepare_documents(&self, _run_id: &str, _job: &JobPosting) -> Result<Documents> {
        Ok(Documents::default())
    }

    async fn submit(
        &self,
        _run_id: &str,
        _job: &JobPosting,
        _documents: &Documents,
        _resumed: Option<&ManualAction>,
    ) -> Result<SubmitResult> {
        Ok(SubmitResult {
            failure_code: Some("automation_unavailable".to_string()),
            ..SubmitResult::new(SubmitStatus::Skipped)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_submit_result_wire_format() {
        let result: SubmitResult = serde_json::from_value(json!({
            "status": "manual_required",
            "failure_code": "captcha_detected",
            "manual_action_type": "captcha"
        }))
        .unwrap();

        assert_eq!(result, SubmitResult {
            failure_code: Some("captcha_detected".to_string()),
            ..SubmitResult::challenge("captcha")
        });
    }

    #[test]
    fn test_status_maps_to_application_status() {
        assert_eq!(SubmitStatus::Submitted.application_status(), ApplicationStatus::Submitted);
        assert_eq!(SubmitStatus::ManualRequired.application_status(), ApplicationStatus::Pending);
    }

    #[tokio::test]
    async fn test_null_automation_skips() {
        let automation = NullAutomation;
        assert!(automation.discover(&SearchConfig::default()).await.unwrap().is_empty());

        let job = JobPosting {
            id: "j".to_string(),
            source: None,
            title: "t".to_string(),
            company: "c".to_string(),
            location: None,
            url: "https://example.test".to_string(),
            description: String::new(),
            score: None,
        };
        let result = automation
            .submit("r", &job, &Documents::default(), None)
            .await
            .unwrap();
        assert_eq!(result.status, SubmitStatus::Skipped);
    }
}
