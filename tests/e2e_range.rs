//! End-to-end scenarios against an in-process mock WebDAV origin, driven
//! the way the corpus drives its own axum servers: bind a real listener,
//! exercise it with `tower::ServiceExt::oneshot` and an HTTP client body
//! collected via `http_body_util`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use axum::routing::get;
use http_body_util::BodyExt;
use tower::ServiceExt;

use video_gateway::cache::ByteRange;
use video_gateway::config::Config;
use video_gateway::AppState;

const TOTAL: u64 = 10 * 1024 * 1024; // 10 MiB fake video
const SEG: u64 = 2 * 1024 * 1024;

fn pattern_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

fn slice(start: u64, end: u64) -> Vec<u8> {
    (start..=end).map(pattern_byte).collect()
}

#[derive(Clone)]
struct MockOrigin {
    hits: Arc<AtomicU64>,
    mode: MockMode,
}

#[derive(Clone, Copy, PartialEq)]
enum MockMode {
    Native206,
    AlwaysFull200,
}

async fn mock_head(State(origin): State<MockOrigin>) -> Response {
    origin.hits.fetch_add(1, Ordering::SeqCst);
    Response::builder()
        .status(StatusCode::OK)
        .header("content-length", TOTAL.to_string())
        .header("content-type", "video/mp4")
        .body(Body::empty())
        .unwrap()
}

async fn mock_get(State(origin): State<MockOrigin>, headers: HeaderMap) -> Response {
    origin.hits.fetch_add(1, Ordering::SeqCst);
    let range = headers.get("range").and_then(|v| v.to_str().ok());

    match (origin.mode, range) {
        (MockMode::Native206, Some(range)) => {
            let (start, end) = parse_test_range(range, TOTAL);
            let body = slice(start, end);
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header("content-range", format!("bytes {start}-{end}/{TOTAL}"))
                .header("content-length", body.len().to_string())
                .header("content-type", "video/mp4")
                .body(Body::from(body))
                .unwrap()
        }
        _ => {
            let body = slice(0, TOTAL - 1);
            Response::builder()
                .status(StatusCode::OK)
                .header("content-length", body.len().to_string())
                .header("content-type", "video/mp4")
                .body(Body::from(body))
                .unwrap()
        }
    }
}

fn parse_test_range(header: &str, total: u64) -> (u64, u64) {
    let rest = header.strip_prefix("bytes=").unwrap();
    let (s, e) = rest.split_once('-').unwrap();
    let start: u64 = s.parse().unwrap();
    let end: u64 = if e.is_empty() { total - 1 } else { e.parse::<u64>().unwrap().min(total - 1) };
    (start, end)
}

async fn spawn_mock_origin(mode: MockMode) -> (SocketAddr, Arc<AtomicU64>) {
    let hits = Arc::new(AtomicU64::new(0));
    let origin = MockOrigin { hits: hits.clone(), mode };
    let app = axum::Router::new()
        .route("/webdav/video.mp4", get(mock_get).head(mock_head))
        .with_state(origin);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    // Give the listener a moment to start accepting.
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, hits)
}

fn test_config(target_host: SocketAddr) -> Config {
    let mut cfg = Config::default();
    cfg.target_host = target_host.to_string();
    cfg.target_path = "/webdav".to_string();
    cfg.segment_bytes = SEG;
    cfg.cache_cap_bytes = 500 * 1024 * 1024;
    cfg
}

async fn get_range(app: axum::Router, path: &str, range: &str) -> (StatusCode, HeaderMap, Vec<u8>) {
    let req = Request::builder().uri(path).header("range", range).body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, headers, body)
}

#[tokio::test]
async fn scenario_1_native_206_passthrough_with_expansion_and_cache_fill() {
    let (addr, _hits) = spawn_mock_origin(MockMode::Native206).await;
    let state = AppState::new(test_config(addr)).unwrap();
    let app = video_gateway::app(state.clone());

    let (status, headers, body) = get_range(app, "/video.mp4", "bytes=0-1023").await;

    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(headers.get("content-range").unwrap(), &format!("bytes 0-1023/{TOTAL}"));
    assert_eq!(headers.get("content-length").unwrap(), "1024");
    assert_eq!(body.len(), 1024);
    assert_eq!(body, slice(0, 1023));

    let url = state.origin_url("/video.mp4");
    assert!(state.caches.segments.get_aligned(&url, 0).is_some(), "segment 0 should have been cached");
}

#[tokio::test]
async fn scenario_2_stream_slice_from_full_body() {
    let (addr, hits) = spawn_mock_origin(MockMode::AlwaysFull200).await;
    let state = AppState::new(test_config(addr)).unwrap();
    let app = video_gateway::app(state.clone());

    let (status, headers, body) = get_range(app, "/video.mp4", "bytes=0-1023").await;

    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(headers.get("content-length").unwrap(), "1024");
    assert_eq!(body, slice(0, 1023));
    // HEAD + GET only; the engine must not have downloaded the whole 10 MiB body.
    assert!(hits.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn scenario_4_cache_hit_reads_zero_upstream_bytes() {
    let (addr, hits) = spawn_mock_origin(MockMode::Native206).await;
    let state = AppState::new(test_config(addr)).unwrap();

    let app1 = video_gateway::app(state.clone());
    let _ = get_range(app1, "/video.mp4", "bytes=0-1023").await;
    let hits_after_first = hits.load(Ordering::SeqCst);

    let app2 = video_gateway::app(state.clone());
    let (status, _headers, body) = get_range(app2, "/video.mp4", "bytes=512-1535").await;

    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(body, slice(512, 1535));
    assert_eq!(hits.load(Ordering::SeqCst), hits_after_first, "second request must not touch the origin");
}

#[tokio::test]
async fn preload_endpoint_populates_cache_without_a_later_fetch() {
    let (addr, hits) = spawn_mock_origin(MockMode::Native206).await;
    let state = AppState::new(test_config(addr)).unwrap();
    let app = video_gateway::app(state.clone());

    let req = Request::builder()
        .uri("/api/preload?path=/video.mp4&start=0&size=2097152")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "preloaded");

    let url = state.origin_url("/video.mp4");
    assert!(state.caches.segments.get_aligned(&url, 0).is_some());

    let app2 = video_gateway::app(state.clone());
    let req2 = Request::builder()
        .uri("/api/preload?path=/video.mp4&start=0&size=2097152")
        .body(Body::empty())
        .unwrap();
    let resp2 = app2.oneshot(req2).await.unwrap();
    let body2 = resp2.into_body().collect().await.unwrap().to_bytes();
    let json2: serde_json::Value = serde_json::from_slice(&body2).unwrap();
    assert_eq!(json2["status"], "cached");
    let _ = hits;
}

#[tokio::test]
async fn stats_endpoint_reports_request_and_cache_counts() {
    let (addr, _hits) = spawn_mock_origin(MockMode::Native206).await;
    let state = AppState::new(test_config(addr)).unwrap();
    let app = video_gateway::app(state.clone());
    let _ = get_range(app, "/video.mp4", "bytes=0-1023").await;

    let app2 = video_gateway::app(state.clone());
    let req = Request::builder().uri("/api/stats").body(Body::empty()).unwrap();
    let resp = app2.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(json["totalRequests"].as_u64().unwrap() >= 1);
    assert!(json["cache"]["segmentEntries"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn options_and_regular_responses_carry_exact_cors_headers() {
    let (addr, _hits) = spawn_mock_origin(MockMode::Native206).await;
    let state = AppState::new(test_config(addr)).unwrap();
    let app = video_gateway::app(state.clone());

    let req = Request::builder().method("OPTIONS").uri("/anything").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let headers = resp.headers();
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
    assert_eq!(headers.get("access-control-allow-credentials").unwrap(), "true");
    assert!(headers.get("access-control-allow-methods").unwrap().to_str().unwrap().contains("PROPFIND"));
    assert!(headers.get("access-control-expose-headers").unwrap().to_str().unwrap().contains("Content-Range"));
}

#[tokio::test]
async fn malformed_range_yields_400_with_error_body() {
    let (addr, _hits) = spawn_mock_origin(MockMode::Native206).await;
    let state = AppState::new(test_config(addr)).unwrap();
    let app = video_gateway::app(state.clone());

    let (status, _headers, body) = get_range(app, "/video.mp4", "nonsense").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "malformed_range");
}

#[tokio::test]
async fn byte_range_helper_reports_single_segment_presence() {
    let (addr, _hits) = spawn_mock_origin(MockMode::Native206).await;
    let state = AppState::new(test_config(addr)).unwrap();
    let url = state.origin_url("/video.mp4");

    assert!(!state.caches.segments.has(&url, ByteRange { start: 0, end: 10 }));
    state.caches.segments.put(&url, 0, bytes::Bytes::from(slice(0, SEG - 1)));
    assert!(state.caches.segments.has(&url, ByteRange { start: 0, end: 10 }));
}

#[tokio::test]
async fn unaligned_second_half_request_never_caches_under_the_wrong_segment_key() {
    // A start offset in the second half of segment 1 leaves align_fetch_range's
    // fetch_start unaligned (no widening down to the segment boundary), the
    // regression this closes: the engine must not label any cached bytes
    // under segment 1's start offset if it can never observe the full
    // aligned window starting there.
    let (addr, _hits) = spawn_mock_origin(MockMode::Native206).await;
    let state = AppState::new(test_config(addr)).unwrap();
    let app = video_gateway::app(state.clone());

    let start = SEG + SEG * 3 / 4; // second half of segment 1
    let end = start + 1023;
    let (status, _headers, body) = get_range(app, "/video.mp4", &format!("bytes={start}-{end}")).await;

    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(body, slice(start, end));

    let url = state.origin_url("/video.mp4");
    if let Some(cached) = state.caches.segments.get_aligned(&url, SEG) {
        // If segment 1 did get cached, every byte of it must be genuine
        // file content at that offset, never a mislabeled stream prefix.
        assert_eq!(cached, bytes::Bytes::from(slice(SEG, 2 * SEG - 1)));
    }
}

#[tokio::test]
async fn every_response_carries_a_request_id_header() {
    let (addr, _hits) = spawn_mock_origin(MockMode::Native206).await;
    let state = AppState::new(test_config(addr)).unwrap();

    let app_ok = video_gateway::app(state.clone());
    let (_status, headers_ok, _body) = get_range(app_ok, "/video.mp4", "bytes=0-1023").await;
    let id_ok: u64 = headers_ok.get("x-request-id").unwrap().to_str().unwrap().parse().unwrap();

    let app_err = video_gateway::app(state.clone());
    let (_status, headers_err, _body) = get_range(app_err, "/video.mp4", "nonsense").await;
    let id_err: u64 = headers_err.get("x-request-id").unwrap().to_str().unwrap().parse().unwrap();

    assert_ne!(id_ok, id_err, "distinct requests get distinct ids");
}

#[tokio::test]
async fn healthz_and_readyz_report_ok() {
    let (addr, _hits) = spawn_mock_origin(MockMode::Native206).await;
    let state = AppState::new(test_config(addr)).unwrap();

    let app = video_gateway::app(state.clone());
    let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let app2 = video_gateway::app(state.clone());
    let req2 = Request::builder().uri("/readyz").body(Body::empty()).unwrap();
    let resp2 = app2.oneshot(req2).await.unwrap();
    assert_eq!(resp2.status(), StatusCode::OK);
}
