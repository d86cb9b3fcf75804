//! HTTP API consumed by the dashboard.
//!
//! A thin layer over the orchestrator: input validation, delegation and
//! error mapping. Routes:
//!
//! | Method & path | Handler |
//! |---|---|
//! | GET /api/health | [`health`] |
//! | GET, POST /api/runs | [`runs::list_runs`], [`runs::create_run`] |
//! | GET /api/runs/:id | [`runs::get_run`] |
//! | POST /api/runs/:id/pause, /resume | [`runs::pause_run`], [`runs::resume_run`] |
//! | GET /api/runs/:id/events/batch | [`events::batch`] |
//! | GET /api/runs/:id/events | [`events::stream`] (SSE) |
//! | GET, POST /api/manual-actions | [`manual_actions::list`], [`manual_actions::create`] |
//! | GET, DELETE /api/manual-actions/:id | [`manual_actions::get`], [`manual_actions::delete`] |
//! | POST /api/manual-actions/:id/start-session | [`manual_actions::start_session`] |
//! | POST /api/manual-actions/:id/resolve | [`manual_actions::resolve`] |
//! | GET /api/applications | [`applications::list`] |

pub mod applications;
pub mod errors;
pub mod events;
pub mod manual_actions;
pub mod runs;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::{from_fn, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::core::Orchestrator;
pub use errors::ApiError;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

impl ApiState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/runs", get(runs::list_runs).post(runs::create_run))
        .route("/api/runs/:id", get(runs::get_run))
        .route("/api/runs/:id/pause", post(runs::pause_run))
        .route("/api/runs/:id/resume", post(runs::resume_run))
        .route("/api/runs/:id/events", get(events::stream))
        .route("/api/runs/:id/events/batch", get(events::batch))
        .route(
            "/api/manual-actions",
            get(manual_actions::list).post(manual_actions::create),
        )
        .route(
            "/api/manual-actions/:id",
            get(manual_actions::get).delete(manual_actions::delete),
        )
        .route(
            "/api/manual-actions/:id/start-session",
            post(manual_actions::start_session),
        )
        .route("/api/manual-actions/:id/resolve", post(manual_actions::resolve))
        .route("/api/applications", get(applications::list))
        .layer(from_fn(request_id_middleware))
        .with_state(state)
}

/// `{items: [...]}` list envelope
#[derive(Debug, Serialize)]
pub struct Items<T> {
    pub items: Vec<T>,
}

/// Request id, taken from `x-request-id` or generated
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl RequestId {
    /// Convert an error and tag it with this request
    pub fn wrap(&self, err: impl Into<ApiError>) -> ApiError {
        err.into().with_request_id(self.0.clone())
    }
}

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequestId {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestId>()
            .cloned()
            .unwrap_or_else(|| RequestId(request_id(&parts.headers))))
    }
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let rid = request_id(request.headers());
    request.extensions_mut().insert(RequestId(rid.clone()));

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let mut response = next.run(request).await;

    info!(
        request_id = %rid,
        %method,
        %path,
        status = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "HTTP request"
    );
    if let Ok(value) = HeaderValue::from_str(&rid) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Check an optional `limit` against `1..=max`
pub(crate) fn limit_param(limit: Option<usize>, default: usize, max: usize) -> Result<usize, ApiError> {
    match limit {
        None => Ok(default),
        Some(n) if (1..=max).contains(&n) => Ok(n),
        Some(n) => Err(ApiError::bad_request(format!(
            "limit must be between 1 and {}, got {}",
            max, n
        ))),
    }
}

pub async fn health(State(state): State<ApiState>, rid: RequestId) -> Result<Json<Value>, ApiError> {
    let database_time = state
        .orchestrator
        .store()
        .database_time()
        .map_err(|e| rid.wrap(crate::core::OrchestratorError::from(e)))?;

    Ok(Json(json!({ "status": "ok", "database_time": database_time })))
}
