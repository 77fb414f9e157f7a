//! Range prober - resolves the target before any chunk is planned
//!
//! Follows redirects hop by hop (the transport never does), then reads the
//! final response head for the content length and range support.

use crate::error::DownloadError;
use crate::transport::{ByteRange, Transport, TransportRequest};
use reqwest::StatusCode;
use tracing::{debug, info, warn};
use url::Url;

/// What the prober learned about the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// Final URL after redirects
    pub url: Url,
    pub content_length: Option<u64>,
    pub accepts_ranges: bool,
}

impl ResolvedTarget {
    /// Ranges are usable only when the server honours them and the length is known
    pub fn is_simultaneous_download_possible(&self) -> bool {
        self.accepts_ranges && matches!(self.content_length, Some(length) if length > 0)
    }
}

/// Parse and check a target URL: absolute, http(s), with a host.
pub fn parse_target(url: &str) -> Result<Url, DownloadError> {
    let parsed = Url::parse(url).map_err(|_| DownloadError::InvalidUrl(url.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(DownloadError::InvalidUrl(url.to_string()));
    }
    Ok(parsed)
}

/// Probe `url`, following at most `max_redirects` hops.
///
/// `on_redirect` is called once per followed hop with the new location.
/// Uses HEAD; a server that rejects HEAD (405/501) is asked for the first
/// byte with a ranged GET instead. Failures are not retried.
pub async fn probe<F>(
    transport: &dyn Transport,
    url: Url,
    max_redirects: u32,
    headers: &[(String, String)],
    mut on_redirect: F,
) -> Result<ResolvedTarget, DownloadError>
where
    F: FnMut(&Url) + Send,
{
    let mut current = url;
    let mut redirects = 0u32;
    let mut use_get = false;

    loop {
        let request = if use_get {
            TransportRequest::get(current.clone()).with_range(Some(ByteRange {
                start: 0,
                end: Some(0),
            }))
        } else {
            TransportRequest::head(current.clone())
        }
        .with_headers(headers);

        debug!("Probing {} (get fallback: {})", current, use_get);
        let response = transport
            .send(request)
            .await
            .map_err(DownloadError::from_probe)?;
        let status = response.status;

        if status.is_redirection() && status != StatusCode::NOT_MODIFIED {
            if redirects >= max_redirects {
                warn!("Giving up on {} after {} redirects", current, redirects);
                return Err(DownloadError::TooManyRedirects {
                    budget: max_redirects,
                });
            }

            let location = response.location().ok_or_else(|| {
                DownloadError::Protocol(format!("HTTP {} without Location from {}", status, current))
            })?;
            let next = current.join(location).map_err(|e| {
                DownloadError::Protocol(format!("Bad redirect location {:?}: {}", location, e))
            })?;

            redirects += 1;
            info!("Redirected ({}/{}) to {}", redirects, max_redirects, next);
            on_redirect(&next);
            current = next;
            continue;
        }

        if !use_get
            && (status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::NOT_IMPLEMENTED)
        {
            info!("HEAD rejected with {}, probing with a ranged GET", status);
            use_get = true;
            continue;
        }

        if !status.is_success() {
            return Err(DownloadError::Protocol(format!(
                "{} returned HTTP {}",
                current, status
            )));
        }

        let (content_length, accepts_ranges) = if status == StatusCode::PARTIAL_CONTENT {
            (response.content_range_total(), true)
        } else if use_get {
            // Server ignored the range and started sending the whole body
            (response.content_length(), false)
        } else {
            (response.content_length(), response.accepts_byte_ranges())
        };

        let target = ResolvedTarget {
            url: current,
            content_length,
            accepts_ranges,
        };
        info!(
            "Resolved {} (length: {:?}, ranges: {})",
            target.url, target.content_length, target.accepts_ranges
        );
        return Ok(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use crate::transport::{ReqwestTransport, TransportError};
    use fastdl_types::{ErrorCode, Settings};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn resolves_length_and_range_support() {
        let transport = MockTransport::new().resource("/file.bin", vec![0u8; 4096]);

        let target = probe(&transport, url("http://mock.test/file.bin"), 3, &[], |_| {})
            .await
            .unwrap();
        assert_eq!(target.url.as_str(), "http://mock.test/file.bin");
        assert_eq!(target.content_length, Some(4096));
        assert!(target.accepts_ranges);
        assert!(target.is_simultaneous_download_possible());
    }

    #[tokio::test]
    async fn missing_length_disables_simultaneous_download() {
        let transport = MockTransport::new()
            .resource("/stream", vec![1u8; 100])
            .hide_length("/stream");

        let target = probe(&transport, url("http://mock.test/stream"), 3, &[], |_| {})
            .await
            .unwrap();
        assert_eq!(target.content_length, None);
        assert!(!target.is_simultaneous_download_possible());
    }

    #[tokio::test]
    async fn missing_accept_ranges_means_no_range_support() {
        let transport = MockTransport::new()
            .resource("/plain", vec![1u8; 50_000])
            .no_ranges("/plain");

        let target = probe(&transport, url("http://mock.test/plain"), 3, &[], |_| {})
            .await
            .unwrap();
        assert_eq!(target.content_length, Some(50_000));
        assert!(!target.accepts_ranges);
        assert!(!target.is_simultaneous_download_possible());
    }

    #[tokio::test]
    async fn follows_redirects_within_budget() {
        let transport = MockTransport::new()
            .redirect("/a", "/b")
            .redirect("/b", "http://mock.test/c")
            .resource("/c", vec![0u8; 10]);

        let mut hops = Vec::new();
        let target = probe(&transport, url("http://mock.test/a"), 3, &[], |u| {
            hops.push(u.to_string())
        })
        .await
        .unwrap();

        assert_eq!(hops, vec!["http://mock.test/b", "http://mock.test/c"]);
        assert_eq!(target.url.as_str(), "http://mock.test/c");
    }

    #[tokio::test]
    async fn exhausted_redirect_budget_fails() {
        let transport = MockTransport::new()
            .redirect("/r1", "/r2")
            .redirect("/r2", "/r3")
            .redirect("/r3", "/r4")
            .redirect("/r4", "/file")
            .resource("/file", vec![0u8; 10]);

        let mut hops = 0;
        let error = probe(&transport, url("http://mock.test/r1"), 3, &[], |_| hops += 1)
            .await
            .unwrap_err();

        assert_eq!(error.code(), ErrorCode::TooManyRedirects);
        assert_eq!(hops, 3);
    }

    #[tokio::test]
    async fn zero_budget_rejects_first_redirect() {
        let transport = MockTransport::new()
            .redirect("/a", "/b")
            .resource("/b", vec![0u8; 10]);

        let error = probe(&transport, url("http://mock.test/a"), 0, &[], |_| {})
            .await
            .unwrap_err();
        assert!(matches!(error, DownloadError::TooManyRedirects { budget: 0 }));
    }

    #[tokio::test]
    async fn transport_failures_surface_once() {
        let transport = MockTransport::new().fail("/down", TransportError::Timeout);

        let error = probe(&transport, url("http://mock.test/down"), 3, &[], |_| {})
            .await
            .unwrap_err();
        assert_eq!(error.code(), ErrorCode::Timeout);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn error_status_is_protocol_error() {
        let transport = MockTransport::new();
        let error = probe(&transport, url("http://mock.test/missing"), 3, &[], |_| {})
            .await
            .unwrap_err();
        assert_eq!(error.code(), ErrorCode::ProtocolError);
    }

    #[tokio::test]
    async fn head_rejection_falls_back_to_ranged_get() {
        let transport = MockTransport::new()
            .resource("/nohead", vec![9u8; 777])
            .reject_head("/nohead");

        let target = probe(&transport, url("http://mock.test/nohead"), 3, &[], |_| {})
            .await
            .unwrap();
        assert_eq!(target.content_length, Some(777));
        assert!(target.accepts_ranges);

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[1].range,
            Some(ByteRange { start: 0, end: Some(0) })
        );
    }

    #[tokio::test]
    async fn forwards_caller_headers() {
        let transport = MockTransport::new().resource("/file", vec![0u8; 10]);
        let headers = vec![("Authorization".to_string(), "Bearer t".to_string())];

        probe(&transport, url("http://mock.test/file"), 3, &headers, |_| {})
            .await
            .unwrap();
        assert_eq!(transport.requests()[0].headers, headers);
    }

    #[test]
    fn rejects_structurally_invalid_urls() {
        assert!(parse_target("not a url").is_err());
        assert!(parse_target("ftp://example.com/file").is_err());
        assert!(parse_target("http://").is_err());
        assert!(parse_target("https://example.com/file.iso").is_ok());
    }

    #[tokio::test]
    async fn probes_real_server_through_redirect() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("location", "/new"))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/new"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("accept-ranges", "bytes")
                    .set_body_bytes(vec![0u8; 2048]),
            )
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(&Settings::default()).unwrap();
        let mut hops = Vec::new();
        let target = probe(
            &transport,
            url(&format!("{}/old", server.uri())),
            3,
            &[],
            |u| hops.push(u.path().to_string()),
        )
        .await
        .unwrap();

        assert_eq!(hops, vec!["/new"]);
        assert_eq!(target.url.path(), "/new");
        assert!(target.accepts_ranges);
        assert_eq!(target.content_length, Some(2048));
    }
}
