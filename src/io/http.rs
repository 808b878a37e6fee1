//! HTTP Range transport (RFC 7233).
//!
//! [`RangeClient`] answers two questions about an origin: how big is the
//! resource (HEAD probe) and what are bytes `start..start+len` (range GET).
//! Servers that ignore the `Range` header and answer `200 OK` are handled
//! transparently: the bytes before `start` are discarded and the exposed
//! window capped, so callers always observe the window they asked for.
//!
//! [`HttpRangeReader`] layers the [`ReadAt`](super::ReadAt) contract on top:
//! every call opens its own short-lived range fetch, so concurrent reads
//! need no shared cursor and nothing is cached between calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE, USER_AGENT};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use super::ReadAt;
use crate::config::Config;
use crate::error::{ArchiveError, Result};

/// HTTP client wrapper that knows how to probe and range-fetch a resource.
///
/// The header map may be mutated after construction ([`set_header`],
/// [`set_headers`]); request construction takes a read lock, so mutation is
/// safe while requests are in flight.
///
/// [`set_header`]: RangeClient::set_header
/// [`set_headers`]: RangeClient::set_headers
pub struct RangeClient {
    client: reqwest::Client,
    headers: RwLock<HashMap<String, String>>,
    user_agent: String,
}

impl RangeClient {
    /// Build a client from the library configuration.
    ///
    /// An injected `http_client` is used as-is. Otherwise a pooled client is
    /// built; a [`Timeout::Unlimited`](crate::Timeout::Unlimited)
    /// configuration leaves the client without a request timer, which is
    /// required for streaming large extractions.
    pub fn new(config: &Config) -> Result<Self> {
        let client = match &config.http_client {
            Some(client) => client.clone(),
            None => {
                let mut builder = reqwest::Client::builder()
                    .pool_max_idle_per_host(10)
                    .pool_idle_timeout(Duration::from_secs(90));
                if let Some(deadline) = config.timeout.deadline() {
                    builder = builder.timeout(deadline);
                }
                builder.build()?
            }
        };

        Ok(Self {
            client,
            headers: RwLock::new(config.headers.clone()),
            user_agent: config.user_agent.clone(),
        })
    }

    /// Set a custom header for all subsequent requests.
    pub fn set_header(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut headers = self.headers.write().expect("header lock poisoned");
        headers.insert(key.into(), value.into());
    }

    /// Merge multiple custom headers.
    pub fn set_headers(&self, new_headers: HashMap<String, String>) {
        let mut headers = self.headers.write().expect("header lock poisoned");
        headers.extend(new_headers);
    }

    fn apply_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let headers = self.headers.read().expect("header lock poisoned");
        for (key, value) in headers.iter() {
            request = request.header(key.as_str(), value.as_str());
        }
        if !self.user_agent.is_empty() {
            request = request.header(USER_AGENT, self.user_agent.as_str());
        }
        request
    }

    /// Probe the resource with a HEAD request.
    ///
    /// Returns the resource size and whether the origin advertises
    /// `Accept-Ranges: bytes`. A missing or unparsable `Content-Length` is an
    /// error: the archive size cannot be established without it.
    pub async fn head(&self, url: &str) -> Result<(u64, bool)> {
        let response = self.apply_headers(self.client.head(url)).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ArchiveError::UrlAccess(format!(
                "unexpected status code: {status}"
            )));
        }

        let size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| {
                ArchiveError::UrlAccess("origin did not return Content-Length".into())
            })?;

        let supports_range = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "bytes")
            .unwrap_or(false);

        Ok((size, supports_range))
    }

    /// Fetch a byte window of the resource.
    ///
    /// `length` of `None` means read to the end (`Range: bytes=start-`).
    /// Accepted responses are `206 Partial Content` and `200 OK`; on 200 with
    /// `start > 0` the returned body discards the leading bytes itself.
    pub async fn range_request(
        &self,
        url: &str,
        start: u64,
        length: Option<u64>,
    ) -> Result<RangeBody> {
        if length == Some(0) {
            return Ok(RangeBody::empty());
        }

        let range = match length {
            Some(n) => format!("bytes={start}-{}", start + n - 1),
            None => format!("bytes={start}-"),
        };

        let response = self
            .apply_headers(self.client.get(url))
            .header(RANGE, range)
            .send()
            .await?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => Ok(RangeBody::new(response, 0, length)),
            StatusCode::OK => {
                // Origin ignored the Range header and is sending the whole
                // resource from offset zero.
                let remaining = length.or_else(|| {
                    response
                        .content_length()
                        .map(|total| total.saturating_sub(start))
                });
                Ok(RangeBody::new(response, start, remaining))
            }
            status => Err(ArchiveError::UrlAccess(format!(
                "unexpected status code: {status}"
            ))),
        }
    }
}

/// Streaming body of a range fetch, restricted to the requested window.
pub struct RangeBody {
    response: Option<reqwest::Response>,
    skip: u64,
    remaining: Option<u64>,
}

impl RangeBody {
    fn new(response: reqwest::Response, skip: u64, remaining: Option<u64>) -> Self {
        Self {
            response: Some(response),
            skip,
            remaining,
        }
    }

    fn empty() -> Self {
        Self {
            response: None,
            skip: 0,
            remaining: Some(0),
        }
    }

    /// Next chunk of the window, or `None` at the end.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.remaining == Some(0) {
                return Ok(None);
            }
            let Some(response) = self.response.as_mut() else {
                return Ok(None);
            };
            let Some(mut chunk) = response.chunk().await? else {
                return Ok(None);
            };

            if self.skip > 0 {
                if (chunk.len() as u64) <= self.skip {
                    self.skip -= chunk.len() as u64;
                    continue;
                }
                chunk = chunk.split_off(self.skip as usize);
                self.skip = 0;
            }

            if let Some(remaining) = self.remaining {
                if (chunk.len() as u64) > remaining {
                    chunk.truncate(remaining as usize);
                }
                self.remaining = Some(remaining - chunk.len() as u64);
            }

            if chunk.is_empty() {
                continue;
            }
            return Ok(Some(chunk));
        }
    }
}

/// Random-access reader over a remote resource via HTTP Range requests.
///
/// Each `read_at` opens its own range fetch; there is no shared cursor and
/// no cache, so concurrent calls are independent. Transient network errors
/// (timeouts, connection resets) are retried with a linear backoff before
/// giving up.
pub struct HttpRangeReader {
    client: Arc<RangeClient>,
    url: String,
    size: u64,
    token: CancellationToken,
    /// Cumulative bytes received from the origin.
    transferred: AtomicU64,
    max_retry: u32,
}

impl HttpRangeReader {
    /// Create a reader over `url` with a known total size.
    ///
    /// The reader derives its own cancellation token from `parent`; closing
    /// the reader cancels in-flight fetches without touching the parent.
    pub fn new(
        client: Arc<RangeClient>,
        url: impl Into<String>,
        size: u64,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            size,
            token: parent.child_token(),
            transferred: AtomicU64::new(0),
            max_retry: 3,
        }
    }

    /// Total bytes received from the origin so far.
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    /// Cancel all in-flight fetches. Idempotent.
    pub fn close(&self) {
        self.token.cancel();
    }

    fn is_transient(err: &ArchiveError) -> bool {
        matches!(err, ArchiveError::Http(e) if e.is_timeout() || e.is_connect())
    }
}

#[async_trait]
impl ReadAt for HttpRangeReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || offset >= self.size {
            return Ok(0);
        }

        let expected = (buf.len() as u64).min(self.size - offset) as usize;
        let mut received = 0usize;
        let mut retry = 0u32;

        while received < expected {
            if self.token.is_cancelled() {
                return Err(ArchiveError::Canceled);
            }

            let start = offset + received as u64;
            let window = (expected - received) as u64;

            let fetched = tokio::select! {
                _ = self.token.cancelled() => Err(ArchiveError::Canceled),
                body = self.fill(start, window, &mut buf[received..expected]) => body,
            };

            match fetched {
                Ok(0) => {
                    // The origin ended the stream inside the window; retry
                    // the remainder a bounded number of times.
                    retry += 1;
                    if retry > self.max_retry {
                        return Err(ArchiveError::UrlAccess(format!(
                            "origin ended range response early ({received} of {expected} bytes)"
                        )));
                    }
                }
                Ok(n) => {
                    received += n;
                    self.transferred.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(err) if Self::is_transient(&err) => {
                    retry += 1;
                    if retry > self.max_retry {
                        return Err(err);
                    }
                    let backoff = Duration::from_millis(500 * retry as u64);
                    tokio::select! {
                        _ = self.token.cancelled() => return Err(ArchiveError::Canceled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Ok(received)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

impl HttpRangeReader {
    /// Issue one range fetch and copy as much of it as fits into `buf`.
    async fn fill(&self, start: u64, window: u64, buf: &mut [u8]) -> Result<usize> {
        let mut body = self
            .client
            .range_request(&self.url, start, Some(window))
            .await?;

        let mut copied = 0usize;
        while copied < buf.len() {
            match body.chunk().await? {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len() - copied);
                    buf[copied..copied + n].copy_from_slice(&chunk[..n]);
                    copied += n;
                }
                None => break,
            }
        }
        Ok(copied)
    }
}
