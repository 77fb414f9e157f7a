//! HTTP transport seam
//!
//! The engine never speaks HTTP itself. Everything goes through the
//! [`Transport`] trait, which issues a single request (no redirect following)
//! and hands back status, headers and a streamed body. [`ReqwestTransport`]
//! is the production implementation.

use crate::error::DownloadError;
use async_trait::async_trait;
use bytes::Bytes;
use fastdl_types::{ChunkRange, Settings};
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{self, HeaderMap};
use reqwest::{redirect, Client, Method, StatusCode};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Failure reported by a transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("TLS validation failed: {}", .0.join("; "))]
    Tls(Vec<String>),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Timed out")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Body error: {0}")]
    Body(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Head,
    Get,
}

/// Byte range for the `Range` header, `end` inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }

    /// Range to request for a planned chunk, `None` when the whole resource
    /// is fetched with a plain GET.
    pub fn for_chunk(range: &ChunkRange) -> Option<Self> {
        range.range_header_value().map(|_| ByteRange {
            start: range.start,
            end: range.end,
        })
    }
}

/// A single outgoing request
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: RequestMethod,
    pub url: Url,
    pub range: Option<ByteRange>,
    pub headers: Vec<(String, String)>,
    /// Accept an invalid certificate chain for this request only
    pub ignore_ssl_errors: bool,
}

impl TransportRequest {
    pub fn head(url: Url) -> Self {
        Self {
            method: RequestMethod::Head,
            url,
            range: None,
            headers: Vec::new(),
            ignore_ssl_errors: false,
        }
    }

    pub fn get(url: Url) -> Self {
        Self {
            method: RequestMethod::Get,
            ..Self::head(url)
        }
    }

    pub fn with_range(mut self, range: Option<ByteRange>) -> Self {
        self.range = range;
        self
    }

    pub fn with_headers(mut self, headers: &[(String, String)]) -> Self {
        self.headers = headers.to_vec();
        self
    }

    pub fn ignoring_ssl_errors(mut self, ignore: bool) -> Self {
        self.ignore_ssl_errors = ignore;
        self
    }
}

/// Response head plus a streamed body
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BoxStream<'static, Result<Bytes, TransportError>>,
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl TransportResponse {
    fn header_str(&self, name: header::HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// `Content-Length`, read from the header rather than the body size hint
    pub fn content_length(&self) -> Option<u64> {
        self.header_str(header::CONTENT_LENGTH)
            .and_then(|v| v.trim().parse().ok())
    }

    /// True if the server sent `Accept-Ranges: bytes`
    pub fn accepts_byte_ranges(&self) -> bool {
        self.header_str(header::ACCEPT_RANGES)
            .map(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")))
            .unwrap_or(false)
    }

    /// Complete length from `Content-Range: bytes 0-0/12345`; `*` means unknown
    pub fn content_range_total(&self) -> Option<u64> {
        self.header_str(header::CONTENT_RANGE)
            .and_then(|v| v.rsplit('/').next())
            .filter(|total| *total != "*")
            .and_then(|total| total.trim().parse().ok())
    }

    /// First and last byte positions from `Content-Range: bytes 10-19/100`
    pub fn content_range(&self) -> Option<(u64, u64)> {
        let value = self.header_str(header::CONTENT_RANGE)?;
        let spec = value.trim().strip_prefix("bytes")?.trim_start();
        let (range, _) = spec.split_once('/')?;
        let (first, last) = range.split_once('-')?;
        Some((first.trim().parse().ok()?, last.trim().parse().ok()?))
    }

    pub fn location(&self) -> Option<&str> {
        self.header_str(header::LOCATION)
    }
}

/// HTTP transport capability the engine depends on
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue one request. Redirect responses are returned as-is.
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    /// Used for requests that carry an SSL override
    permissive: Client,
}

impl ReqwestTransport {
    /// Create a transport configured from the engine settings
    pub fn new(settings: &Settings) -> Result<Self, DownloadError> {
        let client = Self::builder(settings)
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()
            .map_err(|e| DownloadError::Config(e.to_string()))?;
        let permissive = Self::builder(settings)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| DownloadError::Config(e.to_string()))?;

        Ok(Self { client, permissive })
    }

    fn builder(settings: &Settings) -> reqwest::ClientBuilder {
        Client::builder()
            .user_agent(settings.user_agent.clone())
            .redirect(redirect::Policy::none())
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .read_timeout(Duration::from_secs(settings.read_timeout_secs))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let client = if request.ignore_ssl_errors {
            &self.permissive
        } else {
            &self.client
        };
        let method = match request.method {
            RequestMethod::Head => Method::HEAD,
            RequestMethod::Get => Method::GET,
        };

        let mut builder = client.request(method, request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(range) = request.range {
            builder = builder.header(header::RANGE, range.header_value());
        }

        debug!("{:?} {} range={:?}", request.method, request.url, request.range);
        let response = builder.send().await.map_err(classify)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(classify))
            .boxed();

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

/// Sort a reqwest failure into the transport taxonomy.
fn classify(error: reqwest::Error) -> TransportError {
    let chain = error_chain(&error);

    if error.is_connect() && chain.iter().any(|m| looks_like_tls(m)) {
        // The outermost message is reqwest's generic "error sending request"
        let details = if chain.len() > 1 {
            chain[1..].to_vec()
        } else {
            chain
        };
        return TransportError::Tls(details);
    }

    let message = chain.join(": ");
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_connect() {
        TransportError::Connect(message)
    } else if error.is_body() || error.is_decode() {
        TransportError::Body(message)
    } else {
        TransportError::Protocol(message)
    }
}

fn error_chain(error: &(dyn std::error::Error + 'static)) -> Vec<String> {
    let mut messages = vec![error.to_string()];
    let mut source = error.source();
    while let Some(inner) = source {
        messages.push(inner.to_string());
        source = inner.source();
    }
    messages
}

fn looks_like_tls(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["certificate", "tls", "ssl", "handshake"]
        .iter()
        .any(|needle| message.contains(needle))
}
