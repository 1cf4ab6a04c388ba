//! Live backend calls.
//!
//! The engine talks to backends through the [`Upstream`] trait so tests can
//! substitute a stub. [`HttpUpstream`] forwards over `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::redirect;
use tracing::debug;

use crate::error::LiveCallError;
use crate::model::{Headers, RequestData, ResponseData};

/// Maximum live response body accepted (32 MiB).
pub const MAX_LIVE_BODY: usize = 32 * 1024 * 1024;

/// Headers never forwarded to the backend.
const SKIPPED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
    "x-tapedeck-bounds",
];

/// A live backend.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Forwards `request` to `base_url` and returns the backend's response.
    ///
    /// # Errors
    ///
    /// Returns a [`LiveCallError`] if no usable response was obtained.
    async fn call(&self, base_url: &str, request: &RequestData) -> Result<ResponseData, LiveCallError>;
}

/// `base_url` joined with `request`'s path and query.
///
/// # Errors
///
/// Returns [`LiveCallError::InvalidUrl`] if the result is not a URL.
pub fn upstream_url(base_url: &str, request: &RequestData) -> Result<reqwest::Url, LiveCallError> {
    let joined = format!("{}{}", base_url.trim_end_matches('/'), request.url);
    reqwest::Url::parse(&joined).map_err(|e| LiveCallError::InvalidUrl {
        url: joined,
        message: e.to_string(),
    })
}

/// Returns `true` if `name` is forwarded to the backend.
#[must_use]
pub fn is_forwarded(name: &str) -> bool {
    !SKIPPED_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// `reqwest`-backed upstream.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    timeout: Duration,
    max_body: usize,
}

impl HttpUpstream {
    /// Creates an upstream with the given per-call timeout.
    ///
    /// Redirects are passed through to the caller, never followed.
    ///
    /// # Errors
    ///
    /// Returns [`LiveCallError::Network`] if the client cannot be built.
    pub fn new(timeout: Duration, user_agent: Option<&str>) -> Result<Self, LiveCallError> {
        let mut builder = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(timeout);
        if let Some(agent) = user_agent {
            builder = builder.user_agent(agent.to_string());
        }
        let client = builder
            .build()
            .map_err(|e| LiveCallError::Network(e.to_string()))?;
        Ok(Self {
            client,
            timeout,
            max_body: MAX_LIVE_BODY,
        })
    }

    /// Builder: cap accepted response bodies at `limit` bytes.
    #[must_use]
    pub const fn with_max_body(mut self, limit: usize) -> Self {
        self.max_body = limit;
        self
    }

    /// Reads the body chunk by chunk, giving up as soon as it passes the
    /// limit.
    async fn read_body(&self, mut response: reqwest::Response) -> Result<Vec<u8>, LiveCallError> {
        let too_large = LiveCallError::BodyTooLarge { limit: self.max_body };
        if response
            .content_length()
            .is_some_and(|len| len > self.max_body as u64)
        {
            return Err(too_large);
        }
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| LiveCallError::Network(e.to_string()))?
        {
            if body.len() + chunk.len() > self.max_body {
                return Err(too_large);
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn call(&self, base_url: &str, request: &RequestData) -> Result<ResponseData, LiveCallError> {
        let url = upstream_url(base_url, request)?;
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            LiveCallError::InvalidUrl {
                url: url.to_string(),
                message: e.to_string(),
            }
        })?;
        debug!(method = %method, url = %url, "live call");

        let mut builder = self.client.request(method, url);
        for entry in request.headers.iter().filter(|e| is_forwarded(&e.name)) {
            builder = builder.header(entry.name.as_str(), entry.value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = tokio::time::timeout(self.timeout, builder.send())
            .await
            .map_err(|_| LiveCallError::Timeout)?
            .map_err(|e| {
                if e.is_timeout() {
                    LiveCallError::Timeout
                } else {
                    LiveCallError::Network(e.to_string())
                }
            })?;

        let code = response.status().as_u16();
        let headers: Headers = response
            .headers()
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
            .collect();
        let bytes = tokio::time::timeout(self.timeout, self.read_body(response))
            .await
            .map_err(|_| LiveCallError::Timeout)??;

        Ok(ResponseData {
            code,
            headers,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_base_and_path() {
        let req = RequestData::new("GET", "/orders?id=1");
        let url = upstream_url("http://backend:9000/", &req).unwrap();
        assert_eq!(url.as_str(), "http://backend:9000/orders?id=1");
    }

    #[test]
    fn invalid_base_is_reported() {
        let req = RequestData::new("GET", "/x");
        assert!(matches!(
            upstream_url("not a url", &req),
            Err(LiveCallError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        assert!(!is_forwarded("Host"));
        assert!(!is_forwarded("content-length"));
        assert!(!is_forwarded("Transfer-Encoding"));
        assert!(!is_forwarded("X-Tapedeck-Bounds"));
        assert!(is_forwarded("Authorization"));
    }

    async fn backend(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        use axum::body::{Body, Bytes};
        use axum::routing::get;

        let router = axum::Router::new()
            .route("/big", get(|| async { "a".repeat(4096) }))
            .route(
                "/stream",
                get(|| async {
                    let chunks = (0..8).map(|_| Ok::<_, std::io::Error>(Bytes::from(vec![b'a'; 512])));
                    Body::from_stream(futures_util::stream::iter(chunks))
                }),
            )
            .route("/small", get(|| async { "ok" }));
        let url = backend(router).await;
        let upstream = HttpUpstream::new(Duration::from_secs(5), None)
            .unwrap()
            .with_max_body(1024);

        for path in ["/big", "/stream"] {
            let err = upstream.call(&url, &RequestData::new("GET", path)).await.unwrap_err();
            assert!(matches!(err, LiveCallError::BodyTooLarge { limit: 1024 }), "{path}: {err}");
            assert_eq!(err.status_code(), 502);
        }
        let ok = upstream.call(&url, &RequestData::new("GET", "/small")).await.unwrap();
        assert_eq!(ok.body, "ok");
    }

    #[tokio::test]
    async fn unreachable_backend_is_network_error() {
        let upstream = HttpUpstream::new(Duration::from_secs(2), None).unwrap();
        let req = RequestData::new("GET", "/x");
        let err = upstream.call("http://127.0.0.1:1", &req).await.unwrap_err();
        assert_eq!(err.status_code(), 502);
    }
}
