//! Discovery parameters snapshotted into a run at creation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Search parameters for job discovery.
///
/// Unknown keys are kept in `extra` so a snapshot never loses what the
/// caller sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub role_keywords: Vec<String>,

    #[serde(default)]
    pub exclude_keywords: Vec<String>,

    #[serde(default = "default_locations")]
    pub locations: Vec<String>,

    #[serde(default)]
    pub remote_only: bool,

    #[serde(default)]
    pub salary_min: Option<u64>,

    #[serde(default)]
    pub salary_max: Option<u64>,

    #[serde(default)]
    pub natural_language_override: Option<String>,

    #[serde(default = "default_aggressive_scraping")]
    pub aggressive_scraping: bool,

    #[serde(default = "default_max_jobs_per_run")]
    pub max_jobs_per_run: u32,

    /// Apply-now runs target a single known job
    #[serde(default)]
    pub target_job_id: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_locations() -> Vec<String> {
    vec!["GCC".to_string(), "Remote".to_string()]
}
fn default_aggressive_scraping() -> bool {
    true
}
fn default_max_jobs_per_run() -> u32 {
    50
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            role_keywords: Vec::new(),
            exclude_keywords: Vec::new(),
            locations: default_locations(),
            remote_only: false,
            salary_min: None,
            salary_max: None,
            natural_language_override: None,
            aggressive_scraping: default_aggressive_scraping(),
            max_jobs_per_run: default_max_jobs_per_run(),
            target_job_id: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl SearchConfig {
    /// Parse and validate a config from an arbitrary JSON value
    pub fn from_value(value: serde_json::Value) -> Result<Self, InvalidSearchConfig> {
        let value = match value {
            serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
            other => other,
        };
        let config: Self = serde_json::from_value(value)
            .map_err(|e| InvalidSearchConfig::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check field-level constraints
    pub fn validate(&self) -> Result<(), InvalidSearchConfig> {
        if self.max_jobs_per_run == 0 {
            return Err(InvalidSearchConfig::MaxJobsZero);
        }

        if let (Some(min), Some(max)) = (self.salary_min, self.salary_max) {
            if min > max {
                return Err(InvalidSearchConfig::SalaryBounds { min, max });
            }
        }

        Ok(())
    }
}

/// Search config validation errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InvalidSearchConfig {
    #[error("search_config is malformed: {0}")]
    Malformed(String),

    #[error("max_jobs_per_run must be at least 1")]
    MaxJobsZero,

    #[error("salary_min ({min}) exceeds salary_max ({max})")]
    SalaryBounds { min: u64, max: u64 },
}
