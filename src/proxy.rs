//! Transparent reverse-proxy fallback (spec §4.7, last row): forwards
//! whatever isn't a stats/preload/video-range request straight through to
//! the origin, streaming both directions.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;

use crate::AppState;

const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".mov", ".avi", ".mkv", ".webm", ".m4v"];

/// Headers that describe hop-to-hop semantics or carry client-origin
/// identity the upstream shouldn't see; stripped before forwarding.
fn is_forwardable(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "host" | "origin" | "referer" | "connection" | "keep-alive" | "transfer-encoding"
    )
}

pub async fn forward(state: Arc<AppState>, method: Method, path_and_query: String, headers: HeaderMap, body: Body) -> Response {
    let url = state.origin_url(&path_and_query);
    let client = state.origin.pool_client_for(&url);

    let mut req = client.request(method, &url);
    for (name, value) in headers.iter() {
        if is_forwardable(name) {
            req = req.header(name, value);
        }
    }

    let body_stream = body.into_data_stream();
    req = req.body(reqwest::Body::wrap_stream(body_stream.map(|r| r.map_err(std::io::Error::other))));

    let upstream = match req.send().await {
        Ok(r) => r,
        Err(e) => return (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    };

    let status = upstream.status();
    let mut resp_headers = HeaderMap::new();
    for (name, value) in upstream.headers().iter() {
        resp_headers.insert(name.clone(), value.clone());
    }
    if is_video_path(&path_and_query) {
        resp_headers.insert(axum::http::header::ACCEPT_RANGES, axum::http::HeaderValue::from_static("bytes"));
    }

    let stream = upstream.bytes_stream();
    let body = Body::from_stream(stream);

    let mut builder = Response::builder().status(status);
    for (name, value) in resp_headers.iter() {
        builder = builder.header(name, value);
    }
    builder.body(body).unwrap_or_else(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response())
}

fn is_video_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    VIDEO_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}
