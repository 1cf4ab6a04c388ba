//! Request and response snapshots stored on chapters and passed through the
//! replay pipeline.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::headers::Headers;

/// Snapshot of an HTTP request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestData {
    /// HTTP method, upper case.
    pub method: String,
    /// Path plus optional `?query`, without scheme or host.
    pub url: String,
    /// Request headers.
    #[serde(default)]
    pub headers: Headers,
    /// Request body as text.
    #[serde(default)]
    pub body: String,
}

impl RequestData {
    /// Creates a request snapshot with no headers or body.
    #[must_use]
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            url: url.into(),
            headers: Headers::new(),
            body: String::new(),
        }
    }

    /// Builder-style header append.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Builder-style body setter.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// The path portion of the URL.
    #[must_use]
    pub fn path(&self) -> &str {
        self.url.split_once('?').map_or(self.url.as_str(), |(p, _)| p)
    }

    /// The raw query string, if any.
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.url.split_once('?').map(|(_, q)| q).filter(|q| !q.is_empty())
    }

    /// Query pairs in order of appearance. A key without `=` has an empty value.
    #[must_use]
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.query()
            .map(|q| {
                q.split('&')
                    .filter(|pair| !pair.is_empty())
                    .map(|pair| match pair.split_once('=') {
                        Some((k, v)) => (k.to_string(), v.to_string()),
                        None => (pair.to_string(), String::new()),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Canonical URL: path followed by query pairs sorted by key then value.
    ///
    /// Two requests that differ only in query-pair order share a canonical URL.
    #[must_use]
    pub fn canonical_url(&self) -> String {
        let mut pairs = self.query_pairs();
        if pairs.is_empty() {
            return self.path().to_string();
        }
        pairs.sort();
        let query: Vec<String> = pairs
            .into_iter()
            .map(|(k, v)| if v.is_empty() { k } else { format!("{k}={v}") })
            .collect();
        format!("{}?{}", self.path(), query.join("&"))
    }

    /// Content hash identifying this request for memoized chapter resolution.
    ///
    /// SHA-256 over method, canonical URL, sorted lower-cased headers and the
    /// body, hex encoded.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let mut headers: Vec<(String, &str)> = self
            .headers
            .iter()
            .map(|e| (e.name.to_ascii_lowercase(), e.value.as_str()))
            .collect();
        headers.sort_unstable();

        let mut hasher = Sha256::new();
        hasher.update(self.method.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.canonical_url().as_bytes());
        hasher.update(b"\n");
        for (name, value) in headers {
            hasher.update(name.as_bytes());
            hasher.update(b":");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(b"\n");
        hasher.update(self.body.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Snapshot of an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseData {
    /// HTTP status code.
    pub code: u16,
    /// Response headers.
    #[serde(default)]
    pub headers: Headers,
    /// Response body as text.
    #[serde(default)]
    pub body: String,
}

impl ResponseData {
    /// Creates a response with the given status and no headers or body.
    #[must_use]
    pub const fn status(code: u16) -> Self {
        Self {
            code,
            headers: Headers::new(),
            body: String::new(),
        }
    }

    /// Builder-style header append.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Builder-style body setter.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }
}

/// Well-known status codes surfaced by the replay pipeline.
pub mod status {
    /// New chapter recorded without a live backend.
    pub const CREATED: u16 = 201;
    /// Await chapter with nothing recorded yet.
    pub const NO_CONTENT: u16 = 204;
    /// Bounded session expired, disabled or empty.
    pub const FORBIDDEN: u16 = 403;
    /// No matching chapter.
    pub const GONE: u16 = 410;
    /// Bounded session matched a tape but produced no response.
    pub const PRECONDITION_FAILED: u16 = 412;
    /// Live call failed or the upstream URL is invalid.
    pub const BAD_GATEWAY: u16 = 502;
    /// Live call could not be attempted.
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}
