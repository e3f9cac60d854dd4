// [[AVIARY]]/apps/control-plane/src/error.rs
// Purpose: Domain error kinds and their HTTP mapping.
// Architecture: Shared Error Layer
// Dependencies: thiserror, Axum

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::controller::ControllerError;
use crate::fabric::FabricError;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("missing or malformed identity")]
    Unauthorized,

    #[error("permission denied")]
    PermissionDenied,

    #[error("conflict: {reason}")]
    Conflict { reason: String },

    #[error("no started runtime available; provisioning more, retry shortly")]
    PoolEmpty,

    #[error(transparent)]
    Fabric(#[from] FabricError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error("{phase} did not finish within {budget} attempts")]
    Timeout { phase: &'static str, budget: u32 },

    #[error("{0}")]
    Validation(String),
}

impl ControlError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        ControlError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        ControlError::Conflict {
            reason: reason.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ControlError::NotFound { .. } => StatusCode::NOT_FOUND,
            ControlError::Unauthorized => StatusCode::UNAUTHORIZED,
            ControlError::PermissionDenied => StatusCode::FORBIDDEN,
            ControlError::Conflict { .. } => StatusCode::CONFLICT,
            ControlError::PoolEmpty => StatusCode::SERVICE_UNAVAILABLE,
            ControlError::Fabric(_)
            | ControlError::Controller(_)
            | ControlError::Timeout { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ControlError::Validation(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
