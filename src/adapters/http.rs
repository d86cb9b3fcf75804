//! HTTP client for an external automation service.
//!
//! Endpoints (all POST, JSON):
//! - `/discover`  `{search_config}` -> `{jobs: [...]}`
//! - `/documents` `{run_id, job}` -> `Documents`
//! - `/submit`    `{run_id, job, documents, manual_action}` -> `SubmitResult`

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Automation, Documents, SubmitResult};
use crate::domain::{JobPosting, ManualAction, SearchConfig};

/// Automation service client
pub struct HttpAutomation {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct DiscoverRequest<'a> {
    search_config: &'a SearchConfig,
}

#[derive(Debug, Deserialize)]
struct DiscoverResponse {
    #[serde(default)]
    jobs: Vec<JobPosting>,
}

#[derive(Debug, Serialize)]
struct DocumentsRequest<'a> {
    run_id: &'a str,
    job: &'a JobPosting,
}

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    run_id: &'a str,
    job: &'a JobPosting,
    documents: &'a Documents,
    #[serde(skip_serializing_if = "Option::is_none")]
    manual_action: Option<&'a ManualAction>,
}

impl HttpAutomation {
    /// Create a client with a per-request timeout
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "Calling automation service");

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach automation service at {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Automation service error ({}) on {}: {}", status, path, text)
        }

        response
            .json::<R>()
            .await
            .with_context(|| format!("Invalid response from {}", path))
    }
}

#[async_trait]
impl Automation for HttpAutomation {
    fn name(&self) -> &str {
        "http"
    }

    async fn discover(&self, config: &SearchConfig) -> Result<Vec<JobPosting>> {
        let response: DiscoverResponse = self
            .post("/discover", &DiscoverRequest {
                search_config: config,
            })
            .await?;
        Ok(response.jobs)
    }

    async fn prepare_documents(&self, run_id: &str, job: &JobPosting) -> Result<Documents> {
        self.post("/documents", &DocumentsRequest { run_id, job }).await
    }

    async fn submit(
        &self,
        run_id: &str,
        job: &JobPosting,
        documents: &Documents,
        resumed: Option<&ManualAction>,
    ) -> Result<SubmitResult> {
        self.post("/submit", &SubmitRequest {
            run_id,
            job,
            documents,
            manual_action: resumed,
        })
        .await
    }
}
