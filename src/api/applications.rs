//! Application records written by pipeline nodes.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use super::{limit_param, ApiError, ApiState, Items, RequestId};
use crate::domain::Application;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub run_id: Option<String>,
    pub limit: Option<usize>,
}

pub async fn list(
    State(state): State<ApiState>,
    rid: RequestId,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Items<Application>>, ApiError> {
    let Query(query) = query.map_err(|e| rid.wrap(e))?;
    let limit = limit_param(query.limit, DEFAULT_LIMIT, MAX_LIMIT).map_err(|e| rid.wrap(e))?;

    let items = state
        .orchestrator
        .list_applications(query.run_id.as_deref(), limit)
        .map_err(|e| rid.wrap(e))?;
    Ok(Json(Items { items }))
}
