//! Error taxonomy for the gateway (spec §7) and its HTTP rendering.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// One variant per row of the error taxonomy table.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("malformed range header: {0}")]
    MalformedRange(String),

    #[error("range not satisfiable")]
    RangeUnsatisfiable,

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("upstream timed out")]
    UpstreamTimeout,

    /// The client went away mid-stream. Never rendered: the engine detects
    /// this from a write failure and tears down quietly.
    #[error("client aborted")]
    ClientAborted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProxyError::UpstreamTimeout
        } else {
            ProxyError::UpstreamError(e.to_string())
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(rename = "requestId")]
    request_id: String,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MalformedRange(_) => StatusCode::BAD_REQUEST,
            ProxyError::RangeUnsatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            ProxyError::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::ClientAborted => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render this error as a response for a given request id (spec §7 JSON shapes).
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        let status = self.status();
        let (error, message) = match &self {
            ProxyError::MalformedRange(m) => ("malformed_range", Some(m.clone())),
            ProxyError::RangeUnsatisfiable => ("range_unsatisfiable", None),
            ProxyError::UpstreamError(m) => ("upstream_error", Some(m.clone())),
            ProxyError::UpstreamTimeout => ("upstream_timeout", None),
            ProxyError::ClientAborted => ("client_aborted", None),
            ProxyError::Internal(m) => ("internal_error", Some(m.clone())),
        };
        let body = ErrorBody {
            error,
            message,
            request_id: request_id.to_string(),
        };
        (status, axum::Json(body)).into_response()
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        self.into_response_with_id("unknown")
    }
}
