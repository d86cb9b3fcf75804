//! HTTP error mapping for API handlers.
//!
//! Every error body has the shape
//! `{"request_id": "...", "error": {"code": "...", "message": "...", "details": ...}}`.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;

use crate::core::OrchestratorError;

#[derive(Clone, Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(ErrorState),
    NotFound(ErrorState),
    InvalidState(ErrorState),
    ManualActionPending(ErrorState),
    Internal(ErrorState),
}

#[derive(Clone, Debug)]
pub struct ErrorState {
    pub message: String,
    pub request_id: Option<String>,
    pub details: Option<Value>,
}

impl ErrorState {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            request_id: None,
            details: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
struct ErrorEnvelope {
    request_id: String,
    error: ErrorBody,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(ErrorState::new(message))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(ErrorState::new(message))
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(ErrorState::new(message))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(ErrorState::new(message))
    }

    fn state_mut(&mut self) -> &mut ErrorState {
        match self {
            Self::BadRequest(s)
            | Self::NotFound(s)
            | Self::InvalidState(s)
            | Self::ManualActionPending(s)
            | Self::Internal(s) => s,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.state_mut().request_id = Some(request_id.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.state_mut().details = Some(details);
        self
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidState(_) | Self::ManualActionPending(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "invalid_argument",
            Self::NotFound(_) => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::ManualActionPending(_) => "manual_action_pending",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let message = err.to_string();
        match err {
            OrchestratorError::NotFound { kind, id } => {
                Self::not_found(message).with_details(json!({ "kind": kind, "id": id }))
            }
            OrchestratorError::InvalidState {
                run_id,
                status,
                operation,
            } => Self::invalid_state(message).with_details(json!({
                "run_id": run_id,
                "status": status,
                "operation": operation,
            })),
            OrchestratorError::InvalidActionState {
                action_id,
                operation,
                ..
            } => Self::invalid_state(message).with_details(json!({
                "manual_action_id": action_id,
                "operation": operation,
            })),
            OrchestratorError::ManualActionPending { run_id, action_id } => {
                Self::ManualActionPending(ErrorState::new(message)).with_details(json!({
                    "run_id": run_id,
                    "manual_action_id": action_id,
                }))
            }
            OrchestratorError::PayloadValidation(_) => Self::bad_request(message),
            OrchestratorError::Storage(e) => {
                error!(error = %e, "Storage failure while serving request");
                Self::internal("storage failure")
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let state = match self {
            Self::BadRequest(s)
            | Self::NotFound(s)
            | Self::InvalidState(s)
            | Self::ManualActionPending(s)
            | Self::Internal(s) => s,
        };
        let request_id = state
            .request_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let body = ErrorEnvelope {
            request_id,
            error: ErrorBody {
                code,
                message: state.message,
                details: state.details,
            },
        };
        (status, Json(body)).into_response()
    }
}
