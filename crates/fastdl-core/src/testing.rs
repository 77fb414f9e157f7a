//! Scripted in-memory transport for engine tests

use crate::transport::{RequestMethod, Transport, TransportError, TransportRequest, TransportResponse};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::StatusCode;
use std::collections::{HashMap, HashSet};

const PIECE_SIZE: usize = 16 * 1024;

struct Resource {
    data: Bytes,
    ranges: bool,
    advertise_length: bool,
    reject_head: bool,
}

/// Fault injected into the GET whose range starts at a given offset
#[derive(Clone)]
enum Fault {
    /// Deliver this many bytes, then fail the body
    BreakAfter(usize, TransportError),
    /// Fail the connection with TLS errors unless the request ignores them
    Tls(Vec<String>),
    /// Fail TLS even when the request ignores SSL errors
    TlsAlways(Vec<String>),
    /// Deliver this many bytes, then never finish
    StallAfter(usize),
    /// Answer 206 with bytes taken from another offset, labelled as such
    ServeFrom(u64),
    /// Answer 206 without a `Content-Range` header
    NoContentRange,
}

#[derive(Default)]
struct Script {
    redirects: HashMap<String, String>,
    failures: HashMap<String, TransportError>,
    resources: HashMap<String, Resource>,
    faults: HashMap<u64, Fault>,
    ignore_range: HashSet<String>,
}

/// Serves resources by URL path, honouring `Range`, with scripted faults
#[derive(Default)]
pub(crate) struct MockTransport {
    script: Mutex<Script>,
    requests: Mutex<Vec<TransportRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource(self, path: &str, data: Vec<u8>) -> Self {
        self.script.lock().resources.insert(
            path.to_string(),
            Resource {
                data: Bytes::from(data),
                ranges: true,
                advertise_length: true,
                reject_head: false,
            },
        );
        self
    }

    pub fn redirect(self, from: &str, to: &str) -> Self {
        self.script
            .lock()
            .redirects
            .insert(from.to_string(), to.to_string());
        self
    }

    pub fn fail(self, path: &str, error: TransportError) -> Self {
        self.script.lock().failures.insert(path.to_string(), error);
        self
    }

    pub fn hide_length(self, path: &str) -> Self {
        self.with_resource(path, |r| r.advertise_length = false)
    }

    pub fn no_ranges(self, path: &str) -> Self {
        self.with_resource(path, |r| r.ranges = false)
    }

    pub fn reject_head(self, path: &str) -> Self {
        self.with_resource(path, |r| r.reject_head = true)
    }

    /// Advertise range support on HEAD but answer ranged GETs with 200
    pub fn ignore_range(self, path: &str) -> Self {
        self.script.lock().ignore_range.insert(path.to_string());
        self
    }

    pub fn break_range_after(self, start: u64, bytes: usize) -> Self {
        self.fault(
            start,
            Fault::BreakAfter(bytes, TransportError::Body("connection reset".into())),
        )
    }

    pub fn tls_errors_for_range(self, start: u64) -> Self {
        self.fault(start, Fault::Tls(vec!["self-signed certificate".into()]))
    }

    pub fn tls_errors_always_for_range(self, start: u64) -> Self {
        self.fault(start, Fault::TlsAlways(vec!["certificate expired".into()]))
    }

    pub fn stall_range_after(self, start: u64, bytes: usize) -> Self {
        self.fault(start, Fault::StallAfter(bytes))
    }

    pub fn misplace_range(self, start: u64, served_start: u64) -> Self {
        self.fault(start, Fault::ServeFrom(served_start))
    }

    pub fn omit_content_range(self, start: u64) -> Self {
        self.fault(start, Fault::NoContentRange)
    }

    fn fault(self, start: u64, fault: Fault) -> Self {
        self.script.lock().faults.insert(start, fault);
        self
    }

    fn with_resource(self, path: &str, f: impl FnOnce(&mut Resource)) -> Self {
        if let Some(resource) = self.script.lock().resources.get_mut(path) {
            f(resource);
        }
        self
    }

    /// Every request seen so far, in order
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().clone()
    }

    /// GET requests only
    pub fn gets(&self) -> Vec<TransportRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == RequestMethod::Get)
            .collect()
    }
}

fn reply(status: StatusCode, headers: HeaderMap, pieces: Vec<Result<Bytes, TransportError>>) -> TransportResponse {
    TransportResponse {
        status,
        headers,
        body: stream::iter(pieces).boxed(),
    }
}

fn split(data: Bytes) -> Vec<Result<Bytes, TransportError>> {
    let mut pieces = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + PIECE_SIZE).min(data.len());
        pieces.push(Ok(data.slice(offset..end)));
        offset = end;
    }
    pieces
}

fn header_value(value: String) -> HeaderValue {
    HeaderValue::from_str(&value).expect("valid header value")
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        self.requests.lock().push(request.clone());

        let script = self.script.lock();
        let path = request.url.path().to_string();

        if let Some(error) = script.failures.get(&path) {
            return Err(error.clone());
        }

        if let Some(location) = script.redirects.get(&path) {
            let mut headers = HeaderMap::new();
            headers.insert(header::LOCATION, header_value(location.clone()));
            return Ok(reply(StatusCode::FOUND, headers, Vec::new()));
        }

        let Some(resource) = script.resources.get(&path) else {
            return Ok(reply(StatusCode::NOT_FOUND, HeaderMap::new(), Vec::new()));
        };
        let total = resource.data.len() as u64;

        let mut headers = HeaderMap::new();
        if resource.ranges {
            headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        }

        if request.method == RequestMethod::Head {
            if resource.reject_head {
                return Ok(reply(StatusCode::METHOD_NOT_ALLOWED, HeaderMap::new(), Vec::new()));
            }
            if resource.advertise_length {
                headers.insert(header::CONTENT_LENGTH, header_value(total.to_string()));
            }
            return Ok(reply(StatusCode::OK, headers, Vec::new()));
        }

        let honour_range = resource.ranges && !script.ignore_range.contains(&path) && total > 0;
        let fault = request
            .range
            .and_then(|range| script.faults.get(&range.start).cloned());

        let (status, start, end) = match request.range {
            Some(range) if honour_range => {
                let end = range.end.unwrap_or(total - 1).min(total - 1);
                match fault {
                    Some(Fault::ServeFrom(served)) => {
                        let served_end = (served + (end - range.start)).min(total - 1);
                        (StatusCode::PARTIAL_CONTENT, served, served_end)
                    }
                    _ => (StatusCode::PARTIAL_CONTENT, range.start, end),
                }
            }
            _ => (StatusCode::OK, 0, total.saturating_sub(1)),
        };

        if status == StatusCode::PARTIAL_CONTENT && !matches!(fault, Some(Fault::NoContentRange)) {
            headers.insert(
                header::CONTENT_RANGE,
                header_value(format!("bytes {}-{}/{}", start, end, total)),
            );
        }

        let body = if total == 0 {
            Bytes::new()
        } else {
            resource.data.slice(start as usize..=end as usize)
        };
        if resource.advertise_length {
            headers.insert(header::CONTENT_LENGTH, header_value(body.len().to_string()));
        }

        match fault {
            Some(Fault::Tls(errors)) if !request.ignore_ssl_errors => Err(TransportError::Tls(errors)),
            Some(Fault::TlsAlways(errors)) => Err(TransportError::Tls(errors)),
            Some(Fault::BreakAfter(bytes, error)) => {
                let mut pieces = split(body.slice(..bytes.min(body.len())));
                pieces.push(Err(error));
                Ok(reply(status, headers, pieces))
            }
            Some(Fault::StallAfter(bytes)) => {
                let pieces = split(body.slice(..bytes.min(body.len())));
                Ok(TransportResponse {
                    status,
                    headers,
                    body: stream::iter(pieces).chain(stream::pending()).boxed(),
                })
            }
            _ => Ok(reply(status, headers, split(body))),
        }
    }
}
