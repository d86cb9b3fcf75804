//! Run event endpoints: paginated batch reads and the live SSE stream.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::{Stream, StreamExt};
use serde::Deserialize;

use super::{limit_param, ApiError, ApiState, RequestId};
use crate::domain::RunEvent;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 250;
const KEEP_ALIVE: Duration = Duration::from_secs(15);
const SSE_EVENT_NAME: &str = "run_event";

#[derive(Debug, Deserialize)]
pub struct BatchQuery {
    pub limit: Option<usize>,
    pub after_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub after_id: Option<i64>,
}

fn after_id_param(after_id: Option<i64>) -> Result<i64, ApiError> {
    match after_id {
        Some(id) if id < 0 => Err(ApiError::bad_request("after_id must not be negative")),
        Some(id) => Ok(id),
        None => Ok(0),
    }
}

/// `GET /api/runs/:id/events/batch?limit=&after_id=`
pub async fn batch(
    State(state): State<ApiState>,
    rid: RequestId,
    Path(run_id): Path<String>,
    query: Result<Query<BatchQuery>, QueryRejection>,
) -> Result<Json<Vec<RunEvent>>, ApiError> {
    let Query(query) = query.map_err(|e| rid.wrap(e))?;
    let limit = limit_param(query.limit, DEFAULT_LIMIT, MAX_LIMIT).map_err(|e| rid.wrap(e))?;
    let after_id = after_id_param(query.after_id).map_err(|e| rid.wrap(e))?;

    let events = state
        .orchestrator
        .event_log()
        .batch(&run_id, after_id, limit)
        .map_err(|e| rid.wrap(e))?;
    Ok(Json(events))
}

fn last_event_id(headers: &HeaderMap) -> Option<i64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn to_sse(event: &RunEvent) -> Event {
    let sse = Event::default()
        .event(SSE_EVENT_NAME)
        .id(event.id.to_string());
    match serde_json::to_string(event) {
        Ok(data) => sse.data(data),
        Err(_) => sse.data("{}"),
    }
}

/// `GET /api/runs/:id/events`
///
/// Replays from `after_id` (query) or `Last-Event-ID` (header), defaulting
/// to the start of the run, then follows live. The stream ends once the run
/// is terminal and drained.
pub async fn stream(
    State(state): State<ApiState>,
    rid: RequestId,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    query: Result<Query<StreamQuery>, QueryRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let Query(query) = query.map_err(|e| rid.wrap(e))?;
    let log = state.orchestrator.event_log();

    let after_id = after_id_param(query.after_id.or_else(|| last_event_id(&headers)))
        .map_err(|e| rid.wrap(e))?;
    let events = log.tail(&run_id, after_id).map_err(|e| rid.wrap(e))?;

    let stream = events.map(|event| Ok(to_sse(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE)))
}
