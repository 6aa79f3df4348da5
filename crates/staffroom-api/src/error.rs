use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use staffroom_chat::ChatError;
use staffroom_types::api::ErrorResponse;

/// HTTP face of [`ChatError`].
#[derive(Debug)]
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::AccessDenied | ChatError::Forbidden => StatusCode::FORBIDDEN,
            ChatError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ChatError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self.0 {
            ChatError::Storage { op, source } => {
                error!("{} failed: {:#}", op, source);
                "internal storage error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
