//! Errors surfaced to websocket and HTTP callers

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use armdock_connectors::ConnectorError;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to start process: {0}")]
    Spawn(String),

    #[error("Session {0} has no running process")]
    NotRunning(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    PreconditionFailed(String),

    #[error("Cannot {action} while session is {phase}")]
    InvalidPhase { action: &'static str, phase: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    /// Stable snake_case code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Spawn(_) => "spawn_failed",
            SessionError::NotRunning(_) => "session_not_running",
            SessionError::NotFound(_) => "session_not_found",
            SessionError::PreconditionFailed(_) => "precondition_failed",
            SessionError::InvalidPhase { .. } => "invalid_phase",
            SessionError::Store(e) => e.code(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            SessionError::Spawn(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SessionError::NotRunning(_) | SessionError::InvalidPhase { .. } => {
                StatusCode::CONFLICT
            }
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::PreconditionFailed(_) => StatusCode::BAD_REQUEST,
            SessionError::Store(e) => e.status(),
        }
    }

    /// Map a connector failure that happened inside session `id`.
    pub fn from_connector(id: &str, err: ConnectorError) -> Self {
        match err {
            ConnectorError::NotRunning => SessionError::NotRunning(id.to_string()),
            other => SessionError::Spawn(other.to_string()),
        }
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}
