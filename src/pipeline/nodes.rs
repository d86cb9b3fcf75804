//! Job-hunt pipeline nodes.
//!
//! Working state lives in the run's `state_json` under these keys:
//! `candidate_jobs`, `selected_jobs`, `job_cursor`, `current_job`,
//! `documents`, `apply_attempt`, `challenge_attempts`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::names;
use super::ranking::{score_job, ScoreExplanation};
use crate::adapters::{Automation, Documents, SubmitResult, SubmitStatus};
use crate::core::error::NodeError;
use crate::core::registry::{NodeContext, NodeOutcome, PipelineNode};
use crate::domain::{JobPosting, ManualActionRequest, MetricDeltas, NewApplication, NewEvent};

const CANDIDATE_JOBS: &str = "candidate_jobs";
const SELECTED_JOBS: &str = "selected_jobs";
const JOB_CURSOR: &str = "job_cursor";
const CURRENT_JOB: &str = "current_job";
const DOCUMENTS: &str = "documents";
const APPLY_ATTEMPT: &str = "apply_attempt";
const CHALLENGE_ATTEMPTS: &str = "challenge_attempts";

/// Challenges per job before the submission is given up
const MAX_CHALLENGES_PER_JOB: u32 = 3;

/// Initial working state for an apply-now run over known jobs.
///
/// `discover_jobs` skips the automation when a targeted run already holds
/// candidates.
pub fn seeded_state(jobs: &[JobPosting]) -> Result<serde_json::Value, serde_json::Error> {
    Ok(json!({ CANDIDATE_JOBS: serde_json::to_value(jobs)? }))
}

fn current_job(ctx: &NodeContext) -> Result<JobPosting, NodeError> {
    ctx.get(CURRENT_JOB)?
        .ok_or_else(|| NodeError::msg(format!("node '{}' ran without a selected job", ctx.node)))
}

/// Fetch candidate jobs from the automation backend
pub struct DiscoverJobs {
    automation: Arc<dyn Automation>,
}

impl DiscoverJobs {
    pub fn new(automation: Arc<dyn Automation>) -> Self {
        Self { automation }
    }
}

#[async_trait]
impl PipelineNode for DiscoverJobs {
    fn name(&self) -> &str {
        names::DISCOVER_JOBS
    }

    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeOutcome, NodeError> {
        let config = ctx.search_config.clone();

        if config.target_job_id.is_some() {
            let seeded: Vec<JobPosting> = ctx.get(CANDIDATE_JOBS)?.unwrap_or_default();
            if !seeded.is_empty() {
                ctx.info("targeted_discovery_skip", "Skipping discovery for targeted apply-now run");
                return Ok(NodeOutcome::advance(names::RANK_AND_FILTER));
            }
        }

        let discovered = self.automation.discover(&config).await?;

        let mut seen = HashSet::new();
        let jobs: Vec<JobPosting> = discovered
            .into_iter()
            .filter(|job| match &config.target_job_id {
                Some(target) => &job.id == target,
                None => true,
            })
            .filter(|job| seen.insert(job.id.clone()))
            .collect();

        ctx.set(CANDIDATE_JOBS, &jobs)?;
        ctx.emit(
            NewEvent::info(
                "jobs_discovered",
                format!("Discovered {} jobs", jobs.len()),
            )
            .with_payload(json!({ "count": jobs.len(), "source": self.automation.name() })),
        );

        Ok(NodeOutcome::advance_with(
            names::RANK_AND_FILTER,
            MetricDeltas::discovered(jobs.len() as u64),
        ))
    }
}

/// Score candidates and keep the best `max_jobs_per_run`
pub struct RankAndFilter;

#[async_trait]
impl PipelineNode for RankAndFilter {
    fn name(&self) -> &str {
        names::RANK_AND_FILTER
    }

    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeOutcome, NodeError> {
        let config = ctx.search_config.clone();
        let candidates: Vec<JobPosting> = ctx.get(CANDIDATE_JOBS)?.unwrap_or_default();
        let ranked = candidates.len();

        let (selected, explanations): (Vec<JobPosting>, Vec<serde_json::Value>) =
            if config.target_job_id.is_some() {
                ctx.info("targeted_rank_skip", "Skipping ranking for targeted apply-now run");
                (candidates, Vec::new())
            } else {
                let mut scored: Vec<(JobPosting, ScoreExplanation)> = candidates
                    .into_iter()
                    .filter_map(|mut job| {
                        let (score, explanation) = score_job(&job, &config);
                        job.score = Some(score);
                        (score >= 0.0).then_some((job, explanation))
                    })
                    .collect();
                scored.sort_by(|(a, _), (b, _)| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                scored.truncate(config.max_jobs_per_run as usize);
                scored
                    .into_iter()
                    .map(|(job, explanation)| {
                        let entry = json!({
                            "job_id": job.id,
                            "score": job.score,
                            "explanation": explanation,
                        });
                        (job, entry)
                    })
                    .unzip()
            };

        ctx.emit(
            NewEvent::info(
                "jobs_ranked",
                format!("Ranked {} jobs, selected {}", ranked, selected.len()),
            )
            .with_payload(json!({
                "ranked": ranked,
                "selected": selected.len(),
                "scores": explanations,
            })),
        );

        ctx.set(SELECTED_JOBS, &selected)?;
        ctx.set(JOB_CURSOR, &0usize)?;
        ctx.remove(CANDIDATE_JOBS);

        Ok(NodeOutcome::advance(names::PICK_NEXT_JOB))
    }
}

/// Move the cursor to the next selected job, or finish
pub struct PickNextJob;

#[async_trait]
impl PipelineNode for PickNextJob {
    fn name(&self) -> &str {
        names::PICK_NEXT_JOB
    }

    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeOutcome, NodeError> {
        let cursor: usize = ctx.get(JOB_CURSOR)?.unwrap_or(0);
        let selected: Vec<JobPosting> = ctx.get(SELECTED_JOBS)?.unwrap_or_default();

        let Some(job) = selected.get(cursor) else {
            ctx.remove(CURRENT_JOB);
            return Ok(NodeOutcome::advance(names::FINALIZE_RUN));
        };

        ctx.set(CURRENT_JOB, job)?;
        ctx.set(JOB_CURSOR, &(cursor + 1))?;
        ctx.remove(CHALLENGE_ATTEMPTS);
        ctx.emit(
            NewEvent::info(
                "job_selected",
                format!("Applying to {} at {}", job.title, job.company),
            )
            .with_payload(json!({
                "job_id": job.id,
                "position": cursor + 1,
                "of": selected.len(),
            })),
        );

        Ok(NodeOutcome::advance(names::PREPARE_DOCUMENTS))
    }
}

/// Generate tailored documents for the current job
pub struct PrepareDocuments {
    automation: Arc<dyn Automation>,
}

impl PrepareDocuments {
    pub fn new(automation: Arc<dyn Automation>) -> Self {
        Self { automation }
    }
}

#[async_trait]
impl PipelineNode for PrepareDocuments {
    fn name(&self) -> &str {
        names::PREPARE_DOCUMENTS
    }

    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeOutcome, NodeError> {
        let job = current_job(ctx)?;

        match self.automation.prepare_documents(&ctx.run_id, &job).await {
            Ok(documents) => {
                ctx.set(DOCUMENTS, &documents)?;
                ctx.emit(
                    NewEvent::info("docs_ready", "Generated tailored documents")
                        .with_payload(serde_json::to_value(&documents)?),
                );
                Ok(NodeOutcome::advance(names::SUBMIT_APPLICATION))
            }
            Err(e) => {
                // A document failure costs this job, not the run
                let attempt = SubmitResult {
                    artifacts: json!({ "error": format!("{:#}", e) }),
                    ..SubmitResult::failed("documents_error")
                };
                ctx.set(APPLY_ATTEMPT, &attempt)?;
                ctx.warn("docs_failed", format!("Document generation failed: {:#}", e));
                Ok(NodeOutcome::advance(names::VERIFY_SUBMISSION))
            }
        }
    }
}

/// Submit the application; suspend on challenges
pub struct SubmitApplication {
    automation: Arc<dyn Automation>,
}

impl SubmitApplication {
    pub fn new(automation: Arc<dyn Automation>) -> Self {
        Self { automation }
    }
}

#[async_trait]
impl PipelineNode for SubmitApplication {
    fn name(&self) -> &str {
        names::SUBMIT_APPLICATION
    }

    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeOutcome, NodeError> {
        let job = current_job(ctx)?;
        let documents: Documents = ctx.get(DOCUMENTS)?.unwrap_or_default();
        let resumed = ctx
            .resumed_action
            .clone()
            .filter(|action| action.job_id.as_deref().map_or(true, |id| id == job.id));

        let mut result = match self
            .automation
            .submit(&ctx.run_id, &job, &documents, resumed.as_ref())
            .await
        {
            Ok(result) => result,
            Err(e) => SubmitResult {
                artifacts: json!({ "error": format!("{:#}", e) }),
                ..SubmitResult::failed("automation_error")
            },
        };

        if result.status == SubmitStatus::ManualRequired {
            let attempts = ctx.get::<u32>(CHALLENGE_ATTEMPTS)?.unwrap_or(0) + 1;
            if attempts > MAX_CHALLENGES_PER_JOB {
                result = SubmitResult {
                    source_portal: result.source_portal.clone(),
                    artifacts: result.artifacts.clone(),
                    ..SubmitResult::failed("challenge_unresolved")
                };
            } else {
                ctx.set(CHALLENGE_ATTEMPTS, &attempts)?;
                let action_type = result
                    .manual_action_type
                    .clone()
                    .unwrap_or_else(|| "unexpected_form".to_string());

                ctx.warn(
                    "challenge_detected",
                    format!("Manual intervention required: {}", action_type),
                );

                let request = ManualActionRequest::new(action_type)
                    .for_job(job.id.clone(), job.company.clone(), job.title.clone())
                    .with_details(json!({
                        "reason": result.failure_code.as_deref().unwrap_or("manual_step_required"),
                        "job_url": job.url,
                        "source_portal": result.source_portal,
                        "artifacts": result.artifacts,
                        "attempt": attempts,
                    }));
                return Ok(NodeOutcome::Suspend(request));
            }
        }

        ctx.set(APPLY_ATTEMPT, &result)?;
        ctx.emit(
            NewEvent::info("submission_attempt", "Submission attempt completed")
                .with_payload(serde_json::to_value(&result)?),
        );

        Ok(NodeOutcome::advance(names::VERIFY_SUBMISSION))
    }
}

/// Count the attempt and record the application
pub struct VerifySubmission;

#[async_trait]
impl PipelineNode for VerifySubmission {
    fn name(&self) -> &str {
        names::VERIFY_SUBMISSION
    }

    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeOutcome, NodeError> {
        let job = current_job(ctx)?;
        let attempt: SubmitResult = ctx
            .get(APPLY_ATTEMPT)?
            .unwrap_or_else(|| SubmitResult::failed("missing_attempt"));

        let deltas = match attempt.status {
            SubmitStatus::Submitted => MetricDeltas::applied(1),
            SubmitStatus::Skipped => MetricDeltas::skipped(1),
            SubmitStatus::Failed | SubmitStatus::ManualRequired => MetricDeltas::failed(1),
        };

        ctx.record_application(
            NewApplication::for_job(&job, attempt.status.application_status()).with_details(json!({
                "source_portal": attempt.source_portal,
                "failure_code": attempt.failure_code,
                "confirmation_text": attempt.confirmation_text,
                "artifacts": attempt.artifacts,
            })),
        );
        ctx.emit(
            NewEvent::info(
                "verification",
                format!("Application status: {}", attempt.status.as_str()),
            )
            .with_payload(json!({ "status": attempt.status, "job_id": job.id })),
        );

        for key in [CURRENT_JOB, DOCUMENTS, APPLY_ATTEMPT, CHALLENGE_ATTEMPTS] {
            ctx.remove(key);
        }

        Ok(NodeOutcome::advance_with(names::PICK_NEXT_JOB, deltas))
    }
}

/// Terminal node
pub struct FinalizeRun;

#[async_trait]
impl PipelineNode for FinalizeRun {
    fn name(&self) -> &str {
        names::FINALIZE_RUN
    }

    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeOutcome, NodeError> {
        let metrics = ctx.metrics;
        ctx.emit(
            NewEvent::info("run_summary", "Run finished")
                .with_payload(json!({ "metrics": metrics })),
        );
        Ok(NodeOutcome::Complete(MetricDeltas::none()))
    }
}
