//! Error types for the observer API.
//!
//! [`ObserverError`] converts into a JSON error response through its
//! [`IntoResponse`](axum::response::IntoResponse) implementation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors that can occur while answering an observer request.
#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    /// The requested entity or resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// No tick has completed yet, or no operator is attached.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A query parameter was out of range.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A value could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IntoResponse for ObserverError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            Self::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}
