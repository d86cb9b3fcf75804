//! Job scoring against a search config.

use serde::{Deserialize, Serialize};

use crate::domain::{JobPosting, SearchConfig};

/// Why a job scored the way it did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreExplanation {
    pub matched_keywords: Vec<String>,
    pub excluded_keywords: Vec<String>,
    pub remote_bias: bool,
    pub location_match: bool,
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Score a job. Negative scores are filtered out by the ranking node.
pub fn score_job(job: &JobPosting, config: &SearchConfig) -> (f64, ScoreExplanation) {
    let title = normalize(&job.title);
    let description = normalize(&job.description);
    let location = normalize(job.location.as_deref().unwrap_or(""));
    let mentions = |needle: &str| title.contains(needle) || description.contains(needle);

    let mut score = 0.0;
    let mut explanation = ScoreExplanation {
        remote_bias: config.remote_only,
        ..Default::default()
    };

    for keyword in &config.role_keywords {
        let kw = normalize(keyword);
        if !kw.is_empty() && mentions(&kw) {
            score += 20.0;
            explanation.matched_keywords.push(keyword.clone());
        }
    }

    for keyword in &config.exclude_keywords {
        let kw = normalize(keyword);
        if !kw.is_empty() && mentions(&kw) {
            score -= 30.0;
            explanation.excluded_keywords.push(keyword.clone());
        }
    }

    if config.remote_only {
        if location.contains("remote") || mentions("remote") {
            score += 15.0;
        } else {
            score -= 20.0;
        }
    }

    let location_match = config
        .locations
        .iter()
        .map(|loc| normalize(loc))
        .any(|loc| !loc.is_empty() && location.contains(&loc));
    if location_match {
        score += 10.0;
        explanation.location_match = true;
    }

    if let Some(prompt) = &config.natural_language_override {
        let overlap = normalize(prompt)
            .split(' ')
            .filter(|token| !token.is_empty() && mentions(token))
            .count();
        score += (overlap as f64 * 2.0).min(20.0);
    }

    (score, explanation)
}
