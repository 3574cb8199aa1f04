use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use parley_sync::SyncError;
use parley_types::api::ErrorResponse;

#[derive(Debug, Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub SyncError);

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            SyncError::Validation(_) => StatusCode::BAD_REQUEST,
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncError::Conflict(_) => StatusCode::CONFLICT,
            SyncError::Transient { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SyncError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self.0 {
            SyncError::Internal(detail) => {
                error!("Internal error: {}", detail);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(ErrorResponse {
            error: message,
            retryable: self.0.is_retryable(),
            message_id: self.0.message_id(),
        });
        (status, body).into_response()
    }
}
