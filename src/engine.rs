//! Streaming Range Engine (C7): the state machine of spec §4.6 — parse,
//! consult the caches, fetch from origin or CDN, and stream the result to
//! the client without ever buffering a full body.
//!
//! The callback-shaped "cache bytes as they happen to arrive" idea from
//! the source material is rebuilt here as the reader → filter → writer
//! pipeline spec §9 calls for: [`SegmentFillFilter`] is the filter, an
//! `async_stream` generator is the writer, and the upstream body is the
//! reader. `router::preload_fetch` reuses the same filter rather than
//! re-deriving segment-fill bookkeeping a second time.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use tracing::debug;

use crate::active::ActiveRequests;
use crate::cache::{ByteRange, MetadataEntry, RedirectEntry};
use crate::error::ProxyError;
use crate::origin::{Classified, OriginResponse};
use crate::range::{self, ParsedRange};
use crate::AppState;

const DEFAULT_MIME: &str = "video/mp4";

pub async fn handle_range_request(
    state: Arc<AppState>,
    url: String,
    range_header: String,
    request_id: u64,
) -> Result<Response, ProxyError> {
    let total = resolve_size(&state, &url).await?;
    let parsed = range::parse_and_expand(&range_header, total).map_err(|e| ProxyError::MalformedRange(e.to_string()))?;
    debug!(request_id, %url, %range_header, fetch_start = parsed.start, fetch_end = parsed.end, "range parsed");

    let guard = ActiveRequests::begin(&state.active, request_id, "GET", &url, Some(range_header.clone()));

    if let Some(redirect) = state.caches.redirect.get(&url) {
        debug!(request_id, %url, "redirect cache hit");
        return match fetch_from_cdn(&state, &redirect.cdn_url, parsed, total, &url, guard).await {
            Ok(resp) => Ok(resp),
            Err(_first_err) => {
                let fresh = refresh_redirect(&state, &url).await?;
                let guard = ActiveRequests::begin(&state.active, request_id, "GET", &url, Some(range_header.clone()));
                fetch_from_cdn(&state, &fresh, parsed, total, &url, guard).await
            }
        };
    }

    let range_for_lookup = ByteRange { start: parsed.start, end: parsed.end };
    let coalesced = state.caches.segments.coalesce(&url, range_for_lookup);
    if let Some(bytes) = state.caches.segments.assemble(&coalesced, range_for_lookup) {
        debug!(request_id, %url, "segment cache hit");
        let mime = content_type_for(&state, &url);
        return serve_from_cache_bytes(&parsed, total, bytes, mime, &state);
    }
    debug!(request_id, %url, "segment cache miss, fetching from origin");

    let (fetch_start, fetch_end) = align_fetch_range(&parsed, state.config.segment_bytes);
    let range_hdr = format!("bytes={fetch_start}-{fetch_end}");

    match state.origin.get(&url, Some(&range_hdr)).await? {
        Classified::Partial(resp) => {
            debug!(request_id, %url, "origin returned 206, streaming passthrough");
            stream_passthrough(state, resp, url, parsed, fetch_start, fetch_end, total, guard).await
        }
        Classified::Redirect(resp) => {
            let location = resp
                .location()
                .ok_or_else(|| ProxyError::UpstreamError("redirect missing Location".to_string()))?;
            debug!(request_id, %url, %location, "origin redirected");
            state.caches.redirect.put(url.clone(), RedirectEntry { cdn_url: location.clone() });
            fetch_from_cdn(&state, &location, parsed, total, &url, guard).await
        }
        Classified::Full(resp) => {
            debug!(request_id, %url, "origin returned 200, slicing from full body");
            stream_slice_from_full_body(state, resp, url, parsed, total, guard).await
        }
        Classified::Other(status) => Err(ProxyError::UpstreamError(format!("origin responded with {status}"))),
    }
}

pub(crate) async fn resolve_size(state: &Arc<AppState>, url: &str) -> Result<u64, ProxyError> {
    if let Some(meta) = state.caches.metadata.get(&url.to_string()) {
        return if meta.content_length == 0 {
            Err(ProxyError::RangeUnsatisfiable)
        } else {
            Ok(meta.content_length)
        };
    }

    let (status, headers) = state.origin.head(url).await?;
    if !status.is_success() {
        return Err(ProxyError::UpstreamError(format!("HEAD returned {status}")));
    }

    let content_length: u64 = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_MIME)
        .to_string();
    let last_modified = headers.get(header::LAST_MODIFIED).and_then(|v| v.to_str().ok()).map(str::to_string);
    let etag = headers.get(header::ETAG).and_then(|v| v.to_str().ok()).map(str::to_string);

    state.caches.metadata.put(
        url.to_string(),
        MetadataEntry { content_length, content_type, last_modified, etag },
    );

    if content_length == 0 {
        Err(ProxyError::RangeUnsatisfiable)
    } else {
        Ok(content_length)
    }
}

async fn refresh_redirect(state: &Arc<AppState>, url: &str) -> Result<String, ProxyError> {
    match state.origin.get(url, None).await? {
        Classified::Redirect(resp) => {
            let location = resp
                .location()
                .ok_or_else(|| ProxyError::UpstreamError("redirect missing Location".to_string()))?;
            state.caches.redirect.put(url.to_string(), RedirectEntry { cdn_url: location.clone() });
            Ok(location)
        }
        Classified::Partial(_) | Classified::Full(_) => Err(ProxyError::UpstreamError("origin no longer redirects".to_string())),
        Classified::Other(status) => Err(ProxyError::UpstreamError(format!("origin responded with {status}"))),
    }
}

async fn fetch_from_cdn(
    state: &Arc<AppState>,
    cdn_url: &str,
    parsed: ParsedRange,
    total: u64,
    origin_url: &str,
    guard: crate::active::ActiveRequestGuard,
) -> Result<Response, ProxyError> {
    let (fetch_start, fetch_end) = align_fetch_range(&parsed, state.config.segment_bytes);
    let range_hdr = format!("bytes={fetch_start}-{fetch_end}");

    // Strategy C never forwards the client's own headers; only a neutral
    // User-Agent and the Range header reach the CDN (spec §4.6.4).
    match state.origin.get(cdn_url, Some(&range_hdr)).await? {
        Classified::Partial(resp) => {
            stream_passthrough(state.clone(), resp, origin_url.to_string(), parsed, fetch_start, fetch_end, total, guard).await
        }
        Classified::Full(resp) => stream_slice_from_full_body(state.clone(), resp, origin_url.to_string(), parsed, total, guard).await,
        Classified::Redirect(_) => Err(ProxyError::UpstreamError("CDN issued a second redirect".to_string())),
        Classified::Other(status) => Err(ProxyError::UpstreamError(format!("CDN responded with {status}"))),
    }
}

/// When the client's request sits in the first half of a segment, widen
/// the outbound fetch down to the segment boundary so the whole segment
/// can be cached (spec §4.6.5).
fn align_fetch_range(parsed: &ParsedRange, seg_size: u64) -> (u64, u64) {
    let seg_start = (parsed.start / seg_size) * seg_size;
    let offset_in_seg = parsed.start - seg_start;
    if offset_in_seg < seg_size / 2 {
        (seg_start, parsed.end)
    } else {
        (parsed.start, parsed.end)
    }
}

fn content_type_for(state: &Arc<AppState>, url: &str) -> String {
    state
        .caches
        .metadata
        .get(&url.to_string())
        .map(|m| m.content_type)
        .unwrap_or_else(|| DEFAULT_MIME.to_string())
}

fn range_response_headers(start: u64, end: u64, total: u64, len: u64, mime: &str) -> Vec<(header::HeaderName, String)> {
    vec![
        (header::CONTENT_RANGE, format!("bytes {start}-{end}/{total}")),
        (header::CONTENT_LENGTH, len.to_string()),
        (header::ACCEPT_RANGES, "bytes".to_string()),
        (header::CONTENT_TYPE, mime.to_string()),
    ]
}

fn serve_from_cache_bytes(parsed: &ParsedRange, total: u64, bytes: Bytes, mime: String, state: &Arc<AppState>) -> Result<Response, ProxyError> {
    let client_len = parsed.client_len();
    let sliced = bytes.slice(0..client_len as usize);
    state.stats.record_bytes(client_len);

    let mut builder = Response::builder().status(StatusCode::PARTIAL_CONTENT);
    for (name, value) in range_response_headers(parsed.start, parsed.original_end, total, client_len, &mime) {
        builder = builder.header(name, value);
    }
    builder.body(Body::from(sliced)).map_err(|e| ProxyError::Internal(e.to_string()))
}

/// Strategy A (spec §4.6.2): origin/CDN returned 206. Copies the body to
/// the client, truncating to the client's originally requested interval,
/// and opportunistically fills the segment cache with whatever complete
/// aligned window it observes along the way. `guard` is moved into the
/// generator so the request counts as active for as long as bytes are
/// actually being streamed, not just until the response is constructed.
async fn stream_passthrough(
    state: Arc<AppState>,
    resp: OriginResponse,
    url: String,
    parsed: ParsedRange,
    fetch_start: u64,
    fetch_end: u64,
    total: u64,
    guard: crate::active::ActiveRequestGuard,
) -> Result<Response, ProxyError> {
    let mime = resp.content_type().unwrap_or_else(|| DEFAULT_MIME.to_string());
    let client_len = parsed.client_len();
    let seg_size = state.config.segment_bytes;

    let body_stream = async_stream::stream! {
        let _guard = guard;
        let mut upstream = resp.into_body_stream();
        let mut filter = SegmentFillFilter::new(fetch_start, parsed.start, parsed.original_end, fetch_end, seg_size, total);
        while let Some(chunk) = upstream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    yield Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
                    break;
                }
            };
            let outcome = filter.feed(chunk);
            if let Some((seg_start, bytes)) = outcome.filled_segment {
                state.caches.segments.put(&url, seg_start, bytes);
            }
            if let Some(piece) = outcome.client_chunk {
                state.stats.record_bytes(piece.len() as u64);
                yield Ok(piece);
            }
            if outcome.finished {
                break;
            }
        }
    };

    let mut builder = Response::builder().status(StatusCode::PARTIAL_CONTENT);
    for (name, value) in range_response_headers(parsed.start, parsed.original_end, total, client_len, &mime) {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from_stream(body_stream))
        .map_err(|e| ProxyError::Internal(e.to_string()))
}

/// Strategy B (spec §4.6.3): origin returned the whole file. Slices out
/// only the requested interval as chunks arrive, discarding the rest.
/// See [`stream_passthrough`] for why `guard` is moved into the generator.
async fn stream_slice_from_full_body(
    state: Arc<AppState>,
    resp: OriginResponse,
    url: String,
    parsed: ParsedRange,
    total: u64,
    guard: crate::active::ActiveRequestGuard,
) -> Result<Response, ProxyError> {
    let mime = resp.content_type().unwrap_or_else(|| DEFAULT_MIME.to_string());
    let client_len = parsed.client_len();
    let seg_size = state.config.segment_bytes;

    let body_stream = async_stream::stream! {
        let _guard = guard;
        let mut upstream = resp.into_body_stream();
        let mut filter = SegmentFillFilter::new(0, parsed.start, parsed.original_end, parsed.end, seg_size, total);
        while let Some(chunk) = upstream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    yield Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
                    break;
                }
            };
            let outcome = filter.feed(chunk);
            if let Some((seg_start, bytes)) = outcome.filled_segment {
                state.caches.segments.put(&url, seg_start, bytes);
            }
            if let Some(piece) = outcome.client_chunk {
                state.stats.record_bytes(piece.len() as u64);
                yield Ok(piece);
            }
            if outcome.finished {
                break;
            }
        }
    };

    let mut builder = Response::builder().status(StatusCode::PARTIAL_CONTENT);
    for (name, value) in range_response_headers(parsed.start, parsed.original_end, total, client_len, &mime) {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from_stream(body_stream))
        .map_err(|e| ProxyError::Internal(e.to_string()))
}

pub(crate) struct FeedOutcome {
    pub(crate) client_chunk: Option<Bytes>,
    pub(crate) filled_segment: Option<(u64, Bytes)>,
    pub(crate) finished: bool,
}

/// The filter half of the reader → filter → writer pipeline (spec §9):
/// a small state object that consumes upstream chunks and emits (a) the
/// client-visible slice and (b) complete aligned segments, as a side
/// output, the moment a `seg_size` window is fully observed.
///
/// `fetch_start` need not be segment-aligned (Strategy A's "second half"
/// case in `align_fetch_range` leaves it at the client's own unaligned
/// start). `pending_seg_start` is always rounded up to the next boundary
/// at or after `fetch_start` in that case — rounding down would label a
/// segment the upstream body never actually supplies the prefix of,
/// since the outbound Range only begins at `fetch_start`, and that
/// segment would then never complete.
pub(crate) struct SegmentFillFilter {
    seg_size: u64,
    total: u64,
    cursor: u64,
    client_start: u64,
    client_end: u64,
    client_sent: u64,
    client_target: u64,
    hard_end: u64,
    pending_seg_start: u64,
    pending: Vec<u8>,
    client_done_at: Option<u64>,
}

impl SegmentFillFilter {
    pub(crate) fn new(fetch_start: u64, client_start: u64, client_end: u64, hard_end: u64, seg_size: u64, total: u64) -> Self {
        let pending_seg_start = if fetch_start % seg_size == 0 {
            fetch_start
        } else {
            fetch_start.div_ceil(seg_size) * seg_size
        };
        Self {
            seg_size,
            total,
            cursor: fetch_start,
            client_start,
            client_end,
            client_sent: 0,
            client_target: client_end - client_start + 1,
            hard_end,
            pending_seg_start,
            pending: Vec::new(),
            client_done_at: None,
        }
    }

    pub(crate) fn feed(&mut self, chunk: Bytes) -> FeedOutcome {
        if chunk.is_empty() {
            return FeedOutcome { client_chunk: None, filled_segment: None, finished: self.cursor > self.hard_end };
        }

        let chunk_start = self.cursor;
        let chunk_end = chunk_start + chunk.len() as u64 - 1;
        self.cursor += chunk.len() as u64;

        let client_chunk = {
            let lo = chunk_start.max(self.client_start);
            let hi = chunk_end.min(self.client_end);
            if lo <= hi {
                let off = (lo - chunk_start) as usize;
                let len = (hi - lo + 1) as usize;
                self.client_sent += len as u64;
                Some(chunk.slice(off..off + len))
            } else {
                None
            }
        };

        let mut filled_segment = None;
        if self.pending_seg_start < self.total {
            let seg_lo = self.pending_seg_start;
            let seg_hi = (self.pending_seg_start + self.seg_size - 1).min(self.total - 1);
            let want_start = seg_lo + self.pending.len() as u64;
            let lo = chunk_start.max(want_start);
            let hi = chunk_end.min(seg_hi);
            if lo <= hi {
                let off = (lo - chunk_start) as usize;
                let len = (hi - lo + 1) as usize;
                self.pending.extend_from_slice(&chunk[off..off + len]);
            }
            let full_len = (seg_hi - seg_lo + 1) as usize;
            if self.pending.len() >= full_len {
                let bytes = Bytes::from(std::mem::take(&mut self.pending));
                filled_segment = Some((seg_lo, bytes));
                self.pending_seg_start += self.seg_size;
            }
        }

        let client_done = self.client_sent >= self.client_target;
        if client_done && self.client_done_at.is_none() {
            self.client_done_at = Some(self.cursor);
        }
        // Once the client is satisfied, cache-fill is best-effort only: it
        // may finish out the in-flight segment, but never past one more
        // segment worth of extra upstream reads (spec §8's "at most
        // bytes_written_to_client + SEG" bound), so an unreachable segment
        // (see struct docs) can't keep the upstream reader open forever.
        let over_budget = self.client_done_at.is_some_and(|at| self.cursor.saturating_sub(at) >= self.seg_size);
        let finished = (client_done && filled_segment.is_some()) || over_budget || self.cursor > self.hard_end;

        FeedOutcome { client_chunk, filled_segment, finished }
    }
}
