use axum::{
    body::{Body, HttpBody},
    extract::Request,
    http::{header, HeaderMap},
    response::Response,
};
use reqwest::Url;
use std::time::Duration;
use tracing::debug;

use crate::error::{UpstreamError, UpstreamErrorKind};

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Forwards admitted requests to their upstream.
///
/// Bodies are streamed in both directions. Each call is bounded by a
/// timeout that covers connecting, sending and reading the response body.
/// Failures are returned as-is; nothing is retried here, since the quota for
/// the attempt has already been charged.
#[derive(Clone)]
pub struct ProxyDispatcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl ProxyDispatcher {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, timeout }
    }

    /// Default per-call timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build the upstream URL for a request, keeping its path and query
    pub fn upstream_url(upstream: &Url, path_and_query: &str) -> Result<Url, UpstreamError> {
        let base = upstream.as_str().trim_end_matches('/');
        Url::parse(&format!("{}{}", base, path_and_query)).map_err(|e| {
            UpstreamError::new(
                UpstreamErrorKind::ProtocolError,
                format!("cannot build upstream url: {}", e),
            )
        })
    }

    /// Send `request` to `upstream` and stream the response back
    pub async fn forward(
        &self,
        request: Request,
        upstream: &Url,
        timeout: Duration,
    ) -> Result<Response, UpstreamError> {
        let (parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = Self::upstream_url(upstream, path_and_query)?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);

        debug!("Forwarding {} {}", parts.method, target);

        let mut builder = self
            .client
            .request(parts.method, target)
            .headers(headers)
            .timeout(timeout);

        if body.size_hint().exact() != Some(0) {
            builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream_response = builder.send().await.map_err(classify)?;

        let status = upstream_response.status();
        let mut response_headers = upstream_response.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        let mut response = Response::new(Body::from_stream(upstream_response.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

fn classify(error: reqwest::Error) -> UpstreamError {
    let kind = if error.is_timeout() {
        UpstreamErrorKind::Timeout
    } else if error.is_connect() {
        UpstreamErrorKind::ConnectionRefused
    } else {
        UpstreamErrorKind::ProtocolError
    };
    UpstreamError::new(kind, error.to_string())
}
