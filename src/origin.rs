//! Origin Client (C6): issues HEAD/GET (with or without `Range`) against
//! the origin and, on redirect, against a CDN; classifies the response
//! per spec §4.5. The caller owns the body stream and is responsible for
//! reading it exactly once.

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use futures_core::Stream;

use crate::error::ProxyError;
use crate::pool::ConnectionPool;

const NEUTRAL_USER_AGENT: &str = "video-gateway/1.0";

/// A response still attached to its (unread) body stream.
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    inner: reqwest::Response,
}

impl OriginResponse {
    /// Consumes `self`, returning the body as a stream of chunks. May be
    /// called exactly once; the type system enforces this via `self` by
    /// value.
    pub fn into_body_stream(self) -> impl Stream<Item = Result<Bytes, reqwest::Error>> {
        self.inner.bytes_stream()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
    }

    pub fn content_type(&self) -> Option<String> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    pub fn location(&self) -> Option<String> {
        self.headers
            .get(http::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }
}

/// The classified outcome of an origin/CDN GET, per spec §4.5.
pub enum Classified {
    /// 206 Partial Content — upstream honored the Range.
    Partial(OriginResponse),
    /// 200 OK — upstream returned the whole body; caller must stream-slice.
    Full(OriginResponse),
    /// 301/302 — follow `Location` with a fresh GET.
    Redirect(OriginResponse),
    /// Anything else.
    Other(StatusCode),
}

pub struct OriginClient {
    pool: ConnectionPool,
}

impl OriginClient {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Exposes the pooled client for a given URL's scheme, for the
    /// transparent reverse-proxy fallback which needs to build an
    /// arbitrary-method request rather than just HEAD/GET.
    pub fn pool_client_for(&self, url: &str) -> &reqwest::Client {
        self.pool.client_for(url)
    }

    /// HEAD the origin to learn `Content-Length` and friends (used to
    /// populate the Metadata Cache). Strips `Origin`/`Referer`, sets
    /// `Host` implicitly via the request URL.
    pub async fn head(&self, url: &str) -> Result<(StatusCode, HeaderMap), ProxyError> {
        let resp = self
            .pool
            .client_for(url)
            .head(url)
            .header(http::header::USER_AGENT, NEUTRAL_USER_AGENT)
            .send()
            .await?;
        Ok((resp.status(), resp.headers().clone()))
    }

    /// GET `url`, optionally with a `Range` header. Does not forward the
    /// original client's headers (spec §4.6.4): only a neutral
    /// `User-Agent` and, if present, `Range` are sent.
    pub async fn get(&self, url: &str, range_header: Option<&str>) -> Result<Classified, ProxyError> {
        let mut req = self
            .pool
            .client_for(url)
            .get(url)
            .header(http::header::USER_AGENT, NEUTRAL_USER_AGENT);
        if let Some(range) = range_header {
            req = req.header(http::header::RANGE, range);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let wrapped = OriginResponse { status, headers, inner: resp };

        Ok(match status {
            StatusCode::PARTIAL_CONTENT => Classified::Partial(wrapped),
            StatusCode::OK => Classified::Full(wrapped),
            StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => {
                Classified::Redirect(wrapped)
            }
            other => Classified::Other(other),
        })
    }
}
