//! Request/response serialization for the replay queue.
//!
//! A [`SerializedRequest`] is plain data: its canonical JSON text is the
//! replay-queue key, so two requests that serialize identically share one
//! entry.

use std::collections::BTreeMap;
use std::str::FromStr;

use albumkit_net::{
    default_status_text, CacheMode, CredentialsMode, RedirectMode, Request, Response,
};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

// ==================== Errors ====================

/// Codec errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Body is not text: {0}")]
    BodyNotText(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    #[error("JSON error: {0}")]
    Json(String),
}

// ==================== Serialized Forms ====================

/// A request as plain data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedRequest {
    pub method: String,
    pub url: String,
    /// Header names are lowercase; repeated headers are joined with `, `.
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub credentials: CredentialsMode,
    pub cache: CacheMode,
    pub redirect: RedirectMode,
    pub referrer: Option<String>,
}

impl SerializedRequest {
    /// The replay-queue key: this request's canonical JSON text.
    pub fn canonical_key(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|e| CodecError::Json(e.to_string()))
    }
}

/// A response as plain data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedResponse {
    pub headers: BTreeMap<String, String>,
    pub status: u16,
    pub status_text: String,
    pub body: String,
}

// ==================== Mutation Marker ====================

/// Body convention flagging a mutation that must not be persisted.
///
/// A request is marked when its body is a JSON object whose `field` holds
/// one of `values` (compared case-insensitively).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationMarker {
    pub field: String,
    pub values: Vec<String>,
}

impl Default for MutationMarker {
    fn default() -> Self {
        Self {
            field: "_method".to_string(),
            values: vec!["PUT".to_string()],
        }
    }
}

impl MutationMarker {
    /// Whether `body` carries the marker.
    pub fn is_marked(&self, body: &str) -> bool {
        let Ok(JsonValue::Object(fields)) = serde_json::from_str::<JsonValue>(body) else {
            return false;
        };
        match fields.get(&self.field) {
            Some(JsonValue::String(value)) => {
                self.values.iter().any(|v| v.eq_ignore_ascii_case(value))
            }
            _ => false,
        }
    }
}

// ==================== Codec ====================

/// Converts between live requests/responses and their plain-data forms.
#[derive(Debug, Clone, Default)]
pub struct RequestCodec {
    marker: MutationMarker,
}

impl RequestCodec {
    pub fn new(marker: MutationMarker) -> Self {
        Self { marker }
    }

    pub fn marker(&self) -> &MutationMarker {
        &self.marker
    }

    /// Serialize a request for the replay queue.
    ///
    /// Returns `Ok(None)` for requests carrying the mutation marker and
    /// `Err` when the body cannot be represented as text. Either way the
    /// request proceeds network-only.
    pub fn serialize_request(
        &self,
        request: &Request,
    ) -> Result<Option<SerializedRequest>, CodecError> {
        let body = match &request.body {
            Some(bytes) => Some(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| CodecError::BodyNotText(e.to_string()))?,
            ),
            None => None,
        };

        if body.as_deref().is_some_and(|b| self.marker.is_marked(b)) {
            debug!(url = %request.url, field = %self.marker.field, "Marked mutation, not persisted");
            return Ok(None);
        }

        Ok(Some(SerializedRequest {
            method: request.method.as_str().to_string(),
            url: request.url.to_string(),
            headers: flatten_headers(&request.headers),
            body,
            credentials: request.credentials,
            cache: request.cache,
            redirect: request.redirect,
            referrer: request.referrer.clone(),
        }))
    }

    /// Rebuild a live request, used when replaying.
    pub fn deserialize_request(&self, data: &SerializedRequest) -> Result<Request, CodecError> {
        let url = Url::parse(&data.url).map_err(|e| CodecError::InvalidUrl(e.to_string()))?;
        let method = Method::from_str(&data.method)
            .map_err(|_| CodecError::InvalidMethod(data.method.clone()))?;

        let mut request = Request::new(method, url);
        request.headers = expand_headers(&data.headers);
        request.body = data.body.clone().map(Bytes::from);
        request.credentials = data.credentials;
        request.cache = data.cache;
        request.redirect = data.redirect;
        request.referrer = data.referrer.clone();
        Ok(request)
    }

    /// Serialize a response. Non-text bodies are decoded lossily.
    pub fn serialize_response(&self, response: &Response) -> SerializedResponse {
        SerializedResponse {
            headers: flatten_headers(&response.headers),
            status: response.status,
            status_text: response.status_text.clone(),
            body: String::from_utf8_lossy(&response.body).into_owned(),
        }
    }

    /// Rebuild a response from its stored form.
    pub fn deserialize_response(&self, data: &SerializedResponse) -> Response {
        let mut response = Response::new(data.status, data.body.clone());
        response.headers = expand_headers(&data.headers);
        response.status_text = if data.status_text.is_empty() {
            default_status_text(data.status).to_string()
        } else {
            data.status_text.clone()
        };
        response
    }
}

// ==================== Helpers ====================

fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut flat: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        flat.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    flat
}

fn expand_headers(flat: &BTreeMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in flat {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(header = %name, "Dropping unrepresentable header"),
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(path: &str) -> Url {
        Url::parse("https://api.example/")
            .unwrap()
            .join(path)
            .unwrap()
    }

    fn json_post(path: &str, body: &str) -> Request {
        Request::post(api(path), body.to_string()).header(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        )
    }

    #[test]
    fn test_serialize_request_carries_metadata() {
        let request = json_post("classes/Album", r#"{"title":"Trip"}"#)
            .referrer("https://albums.example/albums/1")
            .credentials(CredentialsMode::Include);

        let codec = RequestCodec::default();
        let data = codec.serialize_request(&request).unwrap().unwrap();

        assert_eq!(data.method, "POST");
        assert_eq!(data.url, "https://api.example/classes/Album");
        assert_eq!(data.headers["content-type"], "application/json");
        assert_eq!(data.body.as_deref(), Some(r#"{"title":"Trip"}"#));
        assert_eq!(data.credentials, CredentialsMode::Include);
        assert_eq!(data.referrer.as_deref(), Some("https://albums.example/albums/1"));
    }

    #[test]
    fn test_marker_suppresses_persistence() {
        let codec = RequestCodec::default();

        let marked = json_post("classes/Album/1", r#"{"_method":"put","title":"x"}"#);
        assert!(codec.serialize_request(&marked).unwrap().is_none());

        let other_verb = json_post("classes/Album/1", r#"{"_method":"DELETE"}"#);
        assert!(codec.serialize_request(&other_verb).unwrap().is_some());

        let not_json = json_post("classes/Album/1", "_method=PUT");
        assert!(codec.serialize_request(&not_json).unwrap().is_some());
    }

    #[test]
    fn test_custom_marker() {
        let codec = RequestCodec::new(MutationMarker {
            field: "op".to_string(),
            values: vec!["replace".to_string(), "patch".to_string()],
        });
        assert!(codec.marker().is_marked(r#"{"op":"PATCH"}"#));
        assert!(!codec.marker().is_marked(r#"{"_method":"PUT"}"#));
    }

    #[test]
    fn test_binary_body_is_rejected() {
        let request = Request::post(api("files/photo.jpg"), vec![0xff, 0xd8, 0xff, 0xe0]);
        let err = RequestCodec::default().serialize_request(&request).unwrap_err();
        assert!(matches!(err, CodecError::BodyNotText(_)));
    }

    #[test]
    fn test_canonical_key_is_stable() {
        let codec = RequestCodec::default();
        let a = json_post("classes/Album", r#"{"title":"Trip"}"#)
            .header(
                HeaderName::from_static("x-parse-application-id"),
                HeaderValue::from_static("app"),
            );
        let b = a.clone();

        let ka = codec.serialize_request(&a).unwrap().unwrap().canonical_key().unwrap();
        let kb = codec.serialize_request(&b).unwrap().unwrap().canonical_key().unwrap();
        assert_eq!(ka, kb);

        let c = json_post("classes/Album", r#"{"title":"Other"}"#);
        let kc = codec.serialize_request(&c).unwrap().unwrap().canonical_key().unwrap();
        assert_ne!(ka, kc);
    }

    #[test]
    fn test_request_rebuilds_for_replay() {
        let codec = RequestCodec::default();
        let original = json_post("classes/Photo", r#"{"album":"1"}"#);
        let data = codec.serialize_request(&original).unwrap().unwrap();

        let rebuilt = codec.deserialize_request(&data).unwrap();
        assert_eq!(rebuilt.method, Method::POST);
        assert_eq!(rebuilt.url, original.url);
        assert_eq!(rebuilt.body, original.body);
        assert_eq!(
            rebuilt.headers.get(http::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_response_serialization_is_lossy_for_binary() {
        let codec = RequestCodec::default();
        let response = Response::new(201, vec![b'o', b'k', 0xff]).header(
            HeaderName::from_static("x-request-id"),
            HeaderValue::from_static("42"),
        );

        let data = codec.serialize_response(&response);
        assert_eq!(data.status, 201);
        assert_eq!(data.status_text, "Created");
        assert!(data.body.starts_with("ok"));

        let back = codec.deserialize_response(&data);
        assert_eq!(back.status, 201);
        assert_eq!(back.header_str("x-request-id"), Some("42"));
    }

    #[test]
    fn test_repeated_headers_are_joined() {
        let mut headers = HeaderMap::new();
        headers.append("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("application/json"));
        let flat = flatten_headers(&headers);
        assert_eq!(flat["accept"], "text/html, application/json");
    }
}
