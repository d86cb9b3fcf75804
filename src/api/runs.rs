//! Run endpoints.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use tracing::info;

use super::{limit_param, ApiError, ApiState, Items, RequestId};
use crate::core::OrchestratorError;
use crate::domain::{JobPosting, Run, RunMode, SearchConfig};
use crate::pipeline::seeded_state;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    #[serde(default)]
    pub mode: RunMode,

    /// Validated into a [`SearchConfig`]
    #[serde(default)]
    pub search_config: serde_json::Value,

    /// Known jobs for an apply-now run; discovery is skipped when present
    #[serde(default)]
    pub jobs: Option<Vec<JobPosting>>,
}

pub async fn list_runs(
    State(state): State<ApiState>,
    rid: RequestId,
    query: Result<Query<ListRunsQuery>, QueryRejection>,
) -> Result<Json<Items<Run>>, ApiError> {
    let Query(query) = query.map_err(|e| rid.wrap(e))?;
    let limit = limit_param(query.limit, DEFAULT_LIMIT, MAX_LIMIT).map_err(|e| rid.wrap(e))?;

    let items = state
        .orchestrator
        .list_runs(limit)
        .map_err(|e| rid.wrap(e))?;
    Ok(Json(Items { items }))
}

pub async fn create_run(
    State(state): State<ApiState>,
    rid: RequestId,
    body: Result<Json<CreateRunRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Run>), ApiError> {
    let Json(request) = body.map_err(|e| rid.wrap(e))?;

    let search_config = SearchConfig::from_value(request.search_config)
        .map_err(|e| rid.wrap(OrchestratorError::from(e)))?;

    let initial_state = match &request.jobs {
        Some(jobs) => seeded_state(jobs)
            .map_err(|e| rid.wrap(ApiError::bad_request(format!("invalid jobs: {}", e))))?,
        None => serde_json::Value::Null,
    };

    let run = state
        .orchestrator
        .create_run_with_state(request.mode, search_config, initial_state)
        .map_err(|e| rid.wrap(e))?;

    info!(request_id = %rid.0, run_id = %run.id, "Run created via API");
    Ok((StatusCode::CREATED, Json(run)))
}

pub async fn get_run(
    State(state): State<ApiState>,
    rid: RequestId,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    let run = state
        .orchestrator
        .get_run(&run_id)
        .map_err(|e| rid.wrap(e))?;
    Ok(Json(run))
}

pub async fn pause_run(
    State(state): State<ApiState>,
    rid: RequestId,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    let run = state
        .orchestrator
        .pause(&run_id)
        .map_err(|e| rid.wrap(e))?;
    Ok(Json(run))
}

pub async fn resume_run(
    State(state): State<ApiState>,
    rid: RequestId,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    let run = state
        .orchestrator
        .resume(&run_id)
        .map_err(|e| rid.wrap(e))?;
    Ok(Json(run))
}
