use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use switchboard_core::gateway::GatewayError;
use switchboard_core::types::RequestId;
use thiserror::Error;
use tracing::error;

/// Failure of a single HTTP call. Rendered as `{"detail": ...}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unknown request category: {category}")]
    UnknownCategory { category: String },

    #[error("Response for request {request_id} not found")]
    ResponseNotFound { request_id: RequestId },

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnknownCategory { .. } | Self::ResponseNotFound { .. } => StatusCode::NOT_FOUND,
            Self::Gateway(GatewayError::SessionNotFound { .. }) => StatusCode::NOT_FOUND,
            Self::Gateway(GatewayError::InvalidRequest { .. }) => StatusCode::BAD_REQUEST,
            Self::Gateway(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(target: "http", error = %self, "Request failed");
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

/// Failure to run the HTTP server itself.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP server error: {0}")]
    Serve(#[source] std::io::Error),
}
