//! # AlbumKit Net
//!
//! Request/response types and the network capability used by the AlbumKit
//! offline layer.
//!
//! ## Design Goals
//!
//! 1. **Injectable network**: everything above this crate talks to the
//!    [`NetworkClient`] trait, so tests substitute scripted fakes
//! 2. **Fetch-shaped requests**: requests carry the credentials, cache,
//!    redirect and referrer metadata a page-level `fetch()` would
//! 3. **Route matching**: client-side route tables for application-shell
//!    fallback

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub mod client;
pub mod pattern;

pub use client::{ClientConfig, HttpClient};
pub use pattern::{PatternType, RouteTable, UrlPattern};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unreachable: {0}")]
    Unreachable(String),

    #[error("Redirect refused for {0}")]
    RedirectRefused(String),

    #[error("Response body is not text: {0}")]
    BodyNotText(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Credentials mode for requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialsMode {
    /// Never send cookies.
    Omit,
    /// Send cookies only for same-origin requests.
    #[default]
    SameOrigin,
    /// Always send cookies.
    Include,
}

/// HTTP cache mode requested by the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    #[default]
    Default,
    NoStore,
    Reload,
    NoCache,
    ForceCache,
    OnlyIfCached,
}

/// Redirect handling requested by the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RedirectMode {
    #[default]
    Follow,
    Error,
    Manual,
}

/// An intercepted HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub credentials: CredentialsMode,
    pub cache: CacheMode,
    pub redirect: RedirectMode,
    pub referrer: Option<String>,
}

impl Request {
    /// Create a request with the given method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
            credentials: CredentialsMode::SameOrigin,
            cache: CacheMode::Default,
            redirect: RedirectMode::Follow,
            referrer: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Create a POST request.
    pub fn post(url: Url, body: impl Into<Bytes>) -> Self {
        Self::new(Method::POST, url).body(body)
    }

    /// Parse `url` and create a GET request.
    pub fn get_str(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set referrer.
    pub fn referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    /// Set credentials mode.
    pub fn credentials(mut self, credentials: CredentialsMode) -> Self {
        self.credentials = credentials;
        self
    }

    /// Whether the URL uses `http` or `https`.
    pub fn is_http(&self) -> bool {
        matches!(self.url.scheme(), "http" | "https")
    }

    /// Host part of the URL, if any.
    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }
}

/// HTTP response as seen by the offline layer.
///
/// A status of `0` is the network-error response: it carries no usable
/// payload and is treated as a failed fetch.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Option<Url>,
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Whether this response was produced from a durable cache.
    pub from_cache: bool,
}

impl Response {
    /// Create a response with a status and body.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            url: None,
            status,
            status_text: default_status_text(status).to_string(),
            headers: HeaderMap::new(),
            body: body.into(),
            from_cache: false,
        }
    }

    /// Create a network error response.
    pub fn network_error() -> Self {
        Self {
            url: None,
            status: 0,
            status_text: String::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            from_cache: false,
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the final URL.
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Network-error responses are falsy: they never satisfy a request.
    pub fn is_network_error(&self) -> bool {
        self.status == 0
    }

    /// Get a header value as a string.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::BodyNotText(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Reason phrase for common status codes.
pub fn default_status_text(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
}

/// The live network, as seen from the offline layer.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Perform the request. `Err` means the network could not be reached or
    /// the transfer failed; HTTP error statuses are `Ok`.
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://example.com").unwrap();
        let request = Request::get(url.clone())
            .header(
                HeaderName::from_static("accept"),
                HeaderValue::from_static("application/json"),
            )
            .referrer("https://example.com/albums");

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert!(request.headers.contains_key("accept"));
        assert_eq!(request.referrer.as_deref(), Some("https://example.com/albums"));
    }

    #[test]
    fn test_request_id_uniqueness() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_credentials_mode_default() {
        assert_eq!(CredentialsMode::default(), CredentialsMode::SameOrigin);
    }

    #[test]
    fn test_modes_use_fetch_spellings() {
        assert_eq!(
            serde_json::to_string(&CredentialsMode::SameOrigin).unwrap(),
            "\"same-origin\""
        );
        assert_eq!(
            serde_json::to_string(&CacheMode::OnlyIfCached).unwrap(),
            "\"only-if-cached\""
        );
        let mode: RedirectMode = serde_json::from_str("\"manual\"").unwrap();
        assert_eq!(mode, RedirectMode::Manual);
    }

    #[test]
    fn test_is_http() {
        assert!(Request::get_str("https://example.com/a").unwrap().is_http());
        assert!(!Request::get_str("chrome-extension://abc/x.js").unwrap().is_http());
    }

    #[test]
    fn test_network_error_is_falsy() {
        let response = Response::network_error();
        assert!(response.is_network_error());
        assert!(!response.ok());
        assert!(!Response::new(404, "").is_network_error());
    }

    #[test]
    fn test_response_text_and_status_text() {
        let response = Response::new(200, "hello");
        assert_eq!(response.status_text, "OK");
        assert_eq!(response.text().unwrap(), "hello");

        let binary = Response::new(200, vec![0xff, 0xfe]);
        assert!(matches!(binary.text(), Err(NetError::BodyNotText(_))));
    }
}
