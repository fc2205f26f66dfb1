//! CORS middleware: the exact header set of spec §6.2, applied to every
//! response including errors, plus a configurable preflight max-age
//! (following `with_cors_preflight_max_age`'s role in the storage-server
//! sibling this gateway is modeled on).

use axum::extract::{Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use crate::AppState;

const ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS, PROPFIND, PROPPATCH, MKCOL, COPY, MOVE";
const ALLOW_HEADERS: &str =
    "Authorization, Content-Type, Depth, Destination, If, Lock-Token, Overwrite, Timeout, X-Requested-With, Range";
const EXPOSE_HEADERS: &str = "Content-Length, Content-Type, Date, Last-Modified, ETag, Accept-Ranges, Content-Range";

pub async fn cors_layer(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    apply_cors_headers(&mut resp, state.config.cors_max_age_secs);
    resp
}

pub fn apply_cors_headers(resp: &mut Response, max_age_secs: u64) {
    let headers = resp.headers_mut();
    headers.insert(
        HeaderName::from_static("access-control-allow-origin"),
        HeaderValue::from_static("*"),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-methods"),
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-headers"),
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    headers.insert(
        HeaderName::from_static("access-control-expose-headers"),
        HeaderValue::from_static(EXPOSE_HEADERS),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-credentials"),
        HeaderValue::from_static("true"),
    );
    headers.insert(
        HeaderName::from_static("access-control-max-age"),
        HeaderValue::from_str(&max_age_secs.to_string()).unwrap_or_else(|_| HeaderValue::from_static("600")),
    );
}

/// `OPTIONS *` handler: 200 with CORS headers only (spec §4.7).
pub async fn options_handler() -> Response {
    axum::http::StatusCode::OK.into_response()
}
