//! Manual action queue endpoints.

use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use tracing::info;

use super::{limit_param, ApiError, ApiState, Items, RequestId};
use crate::domain::{ManualAction, ManualActionFilter, ManualActionRequest, ManualActionStatus};

const DEFAULT_LIMIT: usize = 200;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub run_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub run_id: String,

    #[serde(flatten)]
    pub request: ManualActionRequest,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    #[serde(default = "default_resolve_status")]
    pub status: String,

    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

fn default_resolve_status() -> String {
    ManualActionStatus::Resolved.as_str().to_string()
}

pub async fn list(
    State(state): State<ApiState>,
    rid: RequestId,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Items<ManualAction>>, ApiError> {
    let Query(query) = query.map_err(|e| rid.wrap(e))?;
    let limit = limit_param(query.limit, DEFAULT_LIMIT, MAX_LIMIT).map_err(|e| rid.wrap(e))?;

    let status = query
        .status
        .as_deref()
        .map(str::parse::<ManualActionStatus>)
        .transpose()
        .map_err(|e| rid.wrap(ApiError::bad_request(e)))?;

    let filter = ManualActionFilter {
        status,
        run_id: query.run_id,
    };
    let items = state
        .orchestrator
        .manual_queue()
        .list(&filter, limit)
        .map_err(|e| rid.wrap(e))?;
    Ok(Json(Items { items }))
}

/// Operator-raised action; blocks the run like a node suspension
pub async fn create(
    State(state): State<ApiState>,
    rid: RequestId,
    body: Result<Json<CreateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ManualAction>), ApiError> {
    let Json(body) = body.map_err(|e| rid.wrap(e))?;
    if body.run_id.trim().is_empty() {
        return Err(rid.wrap(ApiError::bad_request("run_id must not be empty")));
    }

    let action = state
        .orchestrator
        .raise_manual_action(&body.run_id, body.request)
        .map_err(|e| rid.wrap(e))?;

    info!(request_id = %rid.0, action_id = %action.id, run_id = %action.run_id, "Manual action raised via API");
    Ok((StatusCode::CREATED, Json(action)))
}

pub async fn get(
    State(state): State<ApiState>,
    rid: RequestId,
    Path(action_id): Path<String>,
) -> Result<Json<ManualAction>, ApiError> {
    let action = state
        .orchestrator
        .manual_queue()
        .get(&action_id)
        .map_err(|e| rid.wrap(e))?;
    Ok(Json(action))
}

pub async fn start_session(
    State(state): State<ApiState>,
    rid: RequestId,
    Path(action_id): Path<String>,
) -> Result<Json<ManualAction>, ApiError> {
    let action = state
        .orchestrator
        .manual_queue()
        .start_session(&action_id)
        .map_err(|e| rid.wrap(e))?;
    Ok(Json(action))
}

/// Resolve and resume; repeating the call returns the same record
pub async fn resolve(
    State(state): State<ApiState>,
    rid: RequestId,
    Path(action_id): Path<String>,
    body: Bytes,
) -> Result<Json<ManualAction>, ApiError> {
    // An empty body means "resolved" with no details
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        ResolveRequest {
            status: default_resolve_status(),
            details: None,
        }
    } else {
        serde_json::from_slice::<ResolveRequest>(&body)
            .map_err(|e| rid.wrap(ApiError::bad_request(format!("invalid JSON body: {}", e))))?
    };

    if request.status != ManualActionStatus::Resolved.as_str() {
        return Err(rid.wrap(ApiError::bad_request(format!(
            "status must be 'resolved', got '{}'",
            request.status
        ))));
    }

    let action = state
        .orchestrator
        .resolve_manual_action(&action_id, request.details)
        .map_err(|e| rid.wrap(e))?;
    Ok(Json(action))
}

pub async fn delete(
    State(state): State<ApiState>,
    rid: RequestId,
    Path(action_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .orchestrator
        .manual_queue()
        .delete(&action_id)
        .map_err(|e| rid.wrap(e))?;
    Ok(StatusCode::NO_CONTENT)
}
