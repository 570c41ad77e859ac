//! reqwest-backed [`NetworkClient`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, trace};

use crate::{CredentialsMode, NetError, NetworkClient, RedirectMode, Request, Response};

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// User agent string.
    pub user_agent: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects when following.
    pub max_redirects: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("AlbumKit/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// Network client for real HTTP(S) traffic.
///
/// Holds two underlying clients so that per-request redirect modes can be
/// honoured: one follows redirects, the other hands them back.
pub struct HttpClient {
    follow: Client,
    manual: Client,
    config: ClientConfig,
}

impl HttpClient {
    /// Create a new client.
    pub fn new(config: ClientConfig) -> Result<Self, NetError> {
        let follow = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        let manual = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpClient initialized");

        Ok(Self {
            follow,
            manual,
            config,
        })
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

#[async_trait]
impl NetworkClient for HttpClient {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let client = match request.redirect {
            RedirectMode::Follow => &self.follow,
            RedirectMode::Error | RedirectMode::Manual => &self.manual,
        };

        let mut req_builder = client.request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            // Credentials are carried as headers from the page.
            if request.credentials == CredentialsMode::Omit
                && (name == http::header::COOKIE || name == http::header::AUTHORIZATION)
            {
                continue;
            }
            req_builder = req_builder.header(name, value);
        }

        if let Some(ref referrer) = request.referrer {
            req_builder = req_builder.header(http::header::REFERER, referrer.as_str());
        }

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(self.config.default_timeout)
            } else if e.is_connect() {
                NetError::Unreachable(e.to_string())
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status();
        if request.redirect == RedirectMode::Error && status.is_redirection() {
            return Err(NetError::RedirectRefused(request.url.to_string()));
        }

        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            url: Some(url),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body,
            from_cache: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert!(config.user_agent.starts_with("AlbumKit/"));
        assert_eq!(config.max_redirects, 10);
    }

    #[tokio::test]
    async fn test_get_returns_body_and_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/version.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"version":"7"}"#))
            .mount(&server)
            .await;

        let client = HttpClient::new(ClientConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/version.json", server.uri())).unwrap();
        let response = client.fetch(&Request::get(url)).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.text().unwrap(), r#"{"version":"7"}"#);
        assert!(!response.from_cache);
    }

    #[tokio::test]
    async fn test_post_sends_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/classes/Album"))
            .and(body_string(r#"{"title":"Trip"}"#))
            .respond_with(ResponseTemplate::new(201).set_body_string(r#"{"objectId":"a1"}"#))
            .mount(&server)
            .await;

        let client = HttpClient::new(ClientConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/classes/Album", server.uri())).unwrap();
        let response = client
            .fetch(&Request::post(url, r#"{"title":"Trip"}"#))
            .await
            .unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(response.status_text, "Created");
    }

    #[tokio::test]
    async fn test_omit_credentials_strips_cookie() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/private"))
            .and(header("cookie", "session=abc"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/private"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = HttpClient::new(ClientConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/private", server.uri())).unwrap();
        let request = Request::get(url)
            .header(
                http::header::COOKIE,
                http::HeaderValue::from_static("session=abc"),
            )
            .credentials(CredentialsMode::Omit);

        let response = client.fetch(&request).await.unwrap();
        assert_eq!(response.status, 401);
    }

    #[tokio::test]
    async fn test_redirect_error_mode_refuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/new"))
            .mount(&server)
            .await;

        let client = HttpClient::new(ClientConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/old", server.uri())).unwrap();
        let mut request = Request::get(url);
        request.redirect = RedirectMode::Error;

        let result = client.fetch(&request).await;
        assert!(matches!(result, Err(NetError::RedirectRefused(_))));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_an_error() {
        let client = HttpClient::new(ClientConfig {
            default_timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap();
        // Port 9 (discard) on localhost is closed in test environments.
        let url = Url::parse("http://127.0.0.1:9/").unwrap();
        assert!(client.fetch(&Request::get(url)).await.is_err());
    }
}
