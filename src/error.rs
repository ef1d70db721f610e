// =============================================================================
// API Error — typed boundary between handlers and HTTP responses
// =============================================================================
//
// Internal plumbing uses `anyhow` with context; the axum layer converts
// everything into one of these variants so clients always receive a JSON
// body with a message instead of a raw propagated error.
// =============================================================================

use axum::{http::StatusCode, response::IntoResponse, Json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or semantically invalid request (bad scan request,
    /// unknown feed name, unparsable SQL).
    #[error("{0}")]
    BadRequest(String),

    /// Anything else — surfaced as HTTP 500 with the message.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "detail": self.to_string() });
        (status, Json(body)).into_response()
    }
}
