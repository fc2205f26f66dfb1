//! Request Router (C8): classifies every inbound request by method and
//! path and dispatches to the engine, the admin endpoints, or the
//! transparent reverse-proxy fallback (spec §4.7).

use std::sync::Arc;

use axum::extract::{Extension, Query, Request, State};
use axum::http::{HeaderValue, Method, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tracing::{info, info_span, Instrument};

use crate::cache::{ByteRange, RedirectEntry};
use crate::error::ProxyError;
use crate::{cors, engine, proxy, AppState};

const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".mov", ".avi", ".mkv", ".webm", ".m4v"];
const DEFAULT_PRELOAD_SIZE: u64 = 2 * 1024 * 1024;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/stats", get(stats_handler))
        .route("/api/preload", get(preload_handler))
        .fallback(dispatch)
        .layer(axum::middleware::from_fn_with_state(state.clone(), request_id_layer))
        .layer(axum::middleware::from_fn_with_state(state.clone(), cors::cors_layer))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Liveness only answers "is the process up"; readiness additionally
/// confirms the origin host is configured, which is as much as this
/// gateway can check without making a network call on every probe.
async fn readyz(State(state): State<Arc<AppState>>) -> Response {
    if state.config.target_host.is_empty() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    StatusCode::OK.into_response()
}

/// Request-scoped id, the same value used for `/api/stats`'s active-request
/// table and the `X-Request-Id` response header, so logs, stats, and the
/// client-visible header all agree on one number per request.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub u64);

/// Allocates a `RequestId`, wraps the rest of the pipeline in a span
/// carrying it, stamps it on the response, and logs completion with the
/// final status (spec §A.1, §B).
async fn request_id_layer(State(state): State<Arc<AppState>>, mut req: Request, next: Next) -> Response {
    let id = state.active.next_id();
    req.extensions_mut().insert(RequestId(id));

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let span = info_span!("request", request_id = id, %method, %path);

    async move {
        let mut resp = next.run(req).await;
        resp.headers_mut().insert("x-request-id", HeaderValue::from_str(&id.to_string()).expect("decimal u64 is valid header value"));
        info!(status = resp.status().as_u16(), "request completed");
        resp
    }
    .instrument(span)
    .await
}

fn is_video_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    VIDEO_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

async fn dispatch(
    State(state): State<Arc<AppState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    method: Method,
    uri: Uri,
    headers: axum::http::HeaderMap,
    body: axum::body::Body,
) -> Response {
    if method == Method::OPTIONS {
        return cors::options_handler().await;
    }

    let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or(uri.path()).to_string();
    let range_header = headers.get(axum::http::header::RANGE).and_then(|v| v.to_str().ok()).map(str::to_string);

    if is_video_path(uri.path()) {
        if let Some(range_header) = range_header {
            let url = state.origin_url(&path_and_query);
            state.stats.record_request(true);
            return match engine::handle_range_request(state.clone(), url, range_header, request_id).await {
                Ok(resp) => resp,
                Err(e) => e.into_response_with_id(&request_id.to_string()),
            };
        }
    }

    state.stats.record_request(false);
    proxy::forward(state, method, path_and_query, headers, body).await
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    axum::Json(state.stats.snapshot(&state.active, &state.caches)).into_response()
}

#[derive(Deserialize)]
struct PreloadParams {
    path: Option<String>,
    start: Option<u64>,
    size: Option<u64>,
}

#[derive(serde::Serialize)]
struct PreloadResponse {
    status: &'static str,
    range: String,
    size: u64,
}

async fn preload_handler(
    State(state): State<Arc<AppState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Query(params): Query<PreloadParams>,
) -> Response {
    let Some(path) = params.path else {
        return ProxyError::MalformedRange("missing 'path' query parameter".to_string()).into_response_with_id(&request_id.to_string());
    };
    let start = params.start.unwrap_or(0);
    let size = params.size.unwrap_or(DEFAULT_PRELOAD_SIZE);
    let end = start + size - 1;

    let url = state.origin_url(&path);
    let range = ByteRange { start, end };
    let dedup_key = format!("{url}#{start}-{end}");

    if state.caches.segments.has(&url, range) || state.caches.preload.get(&dedup_key).is_some() {
        tracing::debug!(request_id, %url, "preload already cached");
        return axum::Json(PreloadResponse { status: "cached", range: format!("{start}-{end}"), size }).into_response();
    }

    match preload_fetch(&state, &url, start, end).await {
        Ok(()) => {
            tracing::info!(request_id, %url, start, end, "preload completed");
            // Short-TTL marker so a burst of identical preload calls (the
            // player often fires one per probe) doesn't refetch the same
            // window if it gets evicted from the segment cache before the
            // marker expires.
            state.caches.preload.put(dedup_key, ());
            axum::Json(PreloadResponse { status: "preloaded", range: format!("{start}-{end}"), size }).into_response()
        }
        Err(e) => e.into_response_with_id(&request_id.to_string()),
    }
}

/// Fetches `[start, end]` from origin (or the cached redirect target) and
/// stores whatever aligned segments it covers, without streaming a
/// response back to any client (spec §6.3). Reuses [`engine::SegmentFillFilter`]
/// rather than re-deriving segment-boundary bookkeeping: the filter is the
/// one place that knows how to map a possibly-unaligned response stream
/// onto aligned `(url, segStart)` cache keys correctly.
async fn preload_fetch(state: &Arc<AppState>, url: &str, start: u64, end: u64) -> Result<(), ProxyError> {
    use crate::origin::Classified;
    use futures_util::StreamExt;

    let target = if let Some(redirect) = state.caches.redirect.get(&url.to_string()) {
        redirect.cdn_url
    } else {
        url.to_string()
    };

    let total = engine::resolve_size(state, url).await?;
    let range_hdr = format!("bytes={start}-{end}");
    let seg_size = state.config.segment_bytes;

    match state.origin.get(&target, Some(&range_hdr)).await? {
        Classified::Partial(resp) => {
            let mut stream = resp.into_body_stream();
            let mut filter = engine::SegmentFillFilter::new(start, start, end.min(total - 1), end.min(total - 1), seg_size, total);
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(ProxyError::from)?;
                let outcome = filter.feed(chunk);
                if let Some((seg_start, bytes)) = outcome.filled_segment {
                    state.caches.segments.put(url, seg_start, bytes);
                }
                if outcome.finished {
                    break;
                }
            }
            Ok(())
        }
        Classified::Full(resp) => {
            let mut stream = resp.into_body_stream();
            let mut filter = engine::SegmentFillFilter::new(0, start, end.min(total - 1), end.min(total - 1), seg_size, total);
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(ProxyError::from)?;
                let outcome = filter.feed(chunk);
                if let Some((seg_start, bytes)) = outcome.filled_segment {
                    state.caches.segments.put(url, seg_start, bytes);
                }
                if outcome.finished {
                    break;
                }
            }
            Ok(())
        }
        Classified::Redirect(resp) => {
            if let Some(location) = resp.location() {
                state.caches.redirect.put(url.to_string(), RedirectEntry { cdn_url: location });
            }
            Ok(())
        }
        Classified::Other(status) => Err(ProxyError::UpstreamError(format!("preload fetch got {status}"))),
    }
}

