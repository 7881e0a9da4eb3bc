use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chatwave_shared::ChatError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error("Missing or invalid x-user-id header")]
    Unauthenticated,

    #[error("File suggestions are not configured on this server")]
    SuggestionsDisabled,

    #[error("File suggestion failed: {0}")]
    Suggestion(String),
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Chat(err) => {
                let status = match err {
                    ChatError::NotFound(_) => StatusCode::NOT_FOUND,
                    ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
                    ChatError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
                    ChatError::AlreadyExists(_) | ChatError::Conflict(_) => StatusCode::CONFLICT,
                    ChatError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, err.kind().as_str())
            }
            ApiError::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            ApiError::SuggestionsDisabled | ApiError::Suggestion(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        if status.is_server_error() {
            tracing::warn!(error = %self, "request failed");
        }

        let body = serde_json::json!({
            "error": self.to_string(),
            "kind": kind,
        });

        (status, axum::Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
