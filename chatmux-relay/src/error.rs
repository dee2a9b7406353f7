//! Error types for chatmux-relay

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main error type for the relay service
#[derive(Error, Debug)]
pub enum Error {
    /// Storage, enrichment or configuration error from the common library
    #[error(transparent)]
    Common(#[from] chatmux_common::Error),

    /// File I/O errors (offset files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Request rejected by policy (e.g. origin not allowed)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience Result type using the relay Error
pub type Result<T> = std::result::Result<T, Error>;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Error::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            Error::Common(chatmux_common::Error::InvalidInput(_)) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST")
            }
            Error::Common(chatmux_common::Error::NotFound(_)) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}
