//! HTTP-visible gateway errors.
//!
//! Errors inside an established session never reach this type; they are
//! sent over the WebSocket as `"Error: ..."` lines.

use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use spool_runtime::RuntimeError;
use thiserror::Error;

use crate::protocol::Malformed;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The session limit is reached; the upgrade is refused.
    #[error("too many sessions (limit {limit})")]
    TooManySessions { limit: usize },

    #[error(transparent)]
    InvalidPrompt(#[from] Malformed),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("generation timed out after {0:?}")]
    TimedOut(Duration),
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::TooManySessions { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InvalidPrompt(Malformed::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::InvalidPrompt(_) => StatusCode::BAD_REQUEST,
            GatewayError::Runtime(RuntimeError::QueueFull { .. } | RuntimeError::Closed) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Runtime(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
