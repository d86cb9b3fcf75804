//! The default job-hunt pipeline.
//!
//! ```text
//! discover_jobs -> rank_and_filter -> pick_next_job -> finalize_run
//!                                       ^     |
//!                                       |     v
//!              verify_submission <- submit_application <- prepare_documents
//! ```
//!
//! `submit_application` suspends the run when the automation reports a
//! challenge and retries with the resolved action once a human clears it.

pub mod nodes;
pub mod ranking;

use std::sync::Arc;

use crate::adapters::Automation;
use crate::core::registry::{NodeRegistry, RegistryError};

pub use nodes::{
    seeded_state, DiscoverJobs, FinalizeRun, PickNextJob, PrepareDocuments, RankAndFilter,
    SubmitApplication, VerifySubmission,
};

/// Node names
pub mod names {
    pub const DISCOVER_JOBS: &str = "discover_jobs";
    pub const RANK_AND_FILTER: &str = "rank_and_filter";
    pub const PICK_NEXT_JOB: &str = "pick_next_job";
    pub const PREPARE_DOCUMENTS: &str = "prepare_documents";
    pub const SUBMIT_APPLICATION: &str = "submit_application";
    pub const VERIFY_SUBMISSION: &str = "verify_submission";
    pub const FINALIZE_RUN: &str = "finalize_run";
}

/// Build the job-hunt registry over an automation backend
pub fn hunt_registry(automation: Arc<dyn Automation>) -> Result<NodeRegistry, RegistryError> {
    NodeRegistry::builder()
        .node(DiscoverJobs::new(Arc::clone(&automation)))
        .node(RankAndFilter)
        .node(PickNextJob)
        .node(PrepareDocuments::new(Arc::clone(&automation)))
        .node(SubmitApplication::new(automation))
        .node(VerifySubmission)
        .node(FinalizeRun)
        .entry(names::DISCOVER_JOBS)
        .build()
}
