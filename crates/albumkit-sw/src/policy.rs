//! Fetch interception.
//!
//! Each intercepted request is classified once by [`dispatch`] and then
//! handled by exactly one strategy.

use std::sync::Arc;

use albumkit_net::{NetworkClient, Request, Response};
use http::Method;
use tracing::{debug, info, warn};

use crate::cache::{RequestKey, VersionedCacheStore};
use crate::codec::{RequestCodec, SerializedRequest, SerializedResponse};
use crate::config::WorkerConfig;
use crate::context::WorkerContext;
use crate::replay::ReplayQueue;
use crate::FetchError;

// ==================== Dispatch ====================

/// How a request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Not intercepted; the platform performs the fetch.
    Passthrough,
    /// Serve from cache, fetch and cache on miss.
    CacheFirst,
    /// Fetch, fall back to cache (and optionally the app shell) on failure.
    NetworkFirst { shell_fallback: bool },
    /// Fetch; on failure queue the mutation and answer from the queue.
    ReplayAware,
}

/// Classify a request by method, host and client-route membership.
///
/// The app-shell fallback only applies to same-origin routes under the
/// worker scope; a route-shaped path on another host is an ordinary fetch.
pub fn dispatch(request: &Request, config: &WorkerConfig) -> Strategy {
    if !request.is_http() {
        return Strategy::Passthrough;
    }
    let host = request.host().unwrap_or_default();
    if config.is_probe_host(host) {
        return Strategy::Passthrough;
    }
    if request.method != Method::GET {
        return Strategy::ReplayAware;
    }
    if config.is_media_host(host) {
        return Strategy::CacheFirst;
    }
    Strategy::NetworkFirst {
        shell_fallback: config.is_client_route(&request.url),
    }
}

/// Result of handling an intercepted request.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Let the platform fetch it.
    Passthrough,
    /// Answer with this response.
    Respond(Response),
}

impl FetchOutcome {
    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchOutcome::Respond(response) => Some(response),
            FetchOutcome::Passthrough => None,
        }
    }
}

// ==================== Fetch Policy ====================

/// Applies the caching and replay strategies.
#[derive(Clone)]
pub struct FetchPolicy {
    cache: VersionedCacheStore,
    replay: ReplayQueue,
    codec: RequestCodec,
    network: Arc<dyn NetworkClient>,
    context: Arc<WorkerContext>,
    config: Arc<WorkerConfig>,
}

impl FetchPolicy {
    pub fn new(
        cache: VersionedCacheStore,
        replay: ReplayQueue,
        network: Arc<dyn NetworkClient>,
        context: Arc<WorkerContext>,
        config: Arc<WorkerConfig>,
    ) -> Self {
        Self {
            cache,
            replay,
            codec: RequestCodec::new(config.mutation_marker.clone()),
            network,
            context,
            config,
        }
    }

    /// Handle one intercepted request.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchOutcome, FetchError> {
        let strategy = dispatch(&request, &self.config);
        debug!(method = %request.method, url = %request.url, ?strategy, "Intercepted fetch");

        let response = match strategy {
            Strategy::Passthrough => return Ok(FetchOutcome::Passthrough),
            Strategy::CacheFirst => self.cache_first(&request).await?,
            Strategy::NetworkFirst { shell_fallback } => {
                self.network_first(&request, shell_fallback).await?
            }
            Strategy::ReplayAware => self.replay_aware(&request).await?,
        };
        Ok(FetchOutcome::Respond(response))
    }

    async fn cache_first(&self, request: &Request) -> Result<Response, FetchError> {
        let key = RequestKey::for_request(request);
        if let Some(hit) = self.lookup(&key).await {
            debug!(url = %request.url, "Cache hit");
            return Ok(hit);
        }

        match self.network.fetch(request).await {
            Ok(response) if !response.is_network_error() => {
                self.store(&key, &response).await;
                Ok(response)
            }
            Ok(_) => Err(FetchError::unsatisfiable(&request.url, "network error response")),
            Err(e) => Err(FetchError::unsatisfiable(&request.url, e.to_string())),
        }
    }

    async fn network_first(
        &self,
        request: &Request,
        shell_fallback: bool,
    ) -> Result<Response, FetchError> {
        let key = RequestKey::for_request(request);
        let reason = match self.network.fetch(request).await {
            Ok(response) if !response.is_network_error() => {
                self.store(&key, &response).await;
                return Ok(response);
            }
            Ok(_) => "network error response".to_string(),
            Err(e) => e.to_string(),
        };
        debug!(url = %request.url, reason = %reason, "Network failed, trying cache");

        if let Some(hit) = self.lookup(&key).await {
            return Ok(hit);
        }

        if shell_fallback {
            if let Some(shell) = self.app_shell().await {
                debug!(url = %request.url, "Serving application shell");
                return Ok(shell);
            }
        }

        Err(FetchError::unsatisfiable(&request.url, reason))
    }

    async fn replay_aware(&self, request: &Request) -> Result<Response, FetchError> {
        let serialized = match self.codec.serialize_request(request) {
            Ok(serialized) => serialized,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Mutation cannot be persisted, network only");
                None
            }
        };

        let reason = match self.network.fetch(request).await {
            Ok(response) if !response.is_network_error() => {
                if let Some(serialized) = &serialized {
                    let stored = self.codec.serialize_response(&response);
                    if let Err(e) = self.replay.complete(serialized, stored).await {
                        warn!(url = %request.url, error = %e, "Failed to record delivered mutation");
                    }
                }
                return Ok(response);
            }
            Ok(_) => "network error response".to_string(),
            Err(e) => e.to_string(),
        };

        let Some(serialized) = serialized else {
            return Err(FetchError::unsatisfiable(&request.url, reason));
        };
        self.queue_mutation(request, &serialized).await
    }

    /// Read any earlier answer for this mutation, then queue it.
    async fn queue_mutation(
        &self,
        request: &Request,
        serialized: &SerializedRequest,
    ) -> Result<Response, FetchError> {
        let previous = match self.replay.lookup(serialized).await {
            Ok(entry) => entry.and_then(|e| e.response),
            Err(e) => {
                warn!(url = %request.url, error = %e, "Replay queue read failed");
                None
            }
        };

        let key = match self.replay.enqueue(serialized).await {
            Ok(key) => key,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Replay queue write failed");
                return match previous {
                    Some(previous) => Ok(self.from_queue(&previous)),
                    None => Err(FetchError::unsatisfiable(&request.url, e.to_string())),
                };
            }
        };

        match previous {
            Some(previous) => {
                info!(url = %request.url, "Answering queued mutation with earlier response");
                Ok(self.from_queue(&previous))
            }
            None => Err(FetchError::MutationQueued {
                url: request.url.to_string(),
                key,
            }),
        }
    }

    fn from_queue(&self, stored: &SerializedResponse) -> Response {
        let mut response = self.codec.deserialize_response(stored);
        response.from_cache = true;
        response
    }

    /// Look up in the current generation. Store failures count as misses.
    async fn lookup(&self, key: &RequestKey) -> Option<Response> {
        let generation = self.context.generation()?;
        match self.cache.match_request(&generation, key).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed");
                None
            }
        }
    }

    /// Write to the current generation when caching is on. Never fails the
    /// response.
    async fn store(&self, key: &RequestKey, response: &Response) {
        if !self.context.use_cache() || !response.ok() {
            return;
        }
        let Some(generation) = self.context.generation() else {
            return;
        };
        if let Err(e) = self.cache.handle(&generation).put(key, response).await {
            warn!(key = %key, generation = %generation, error = %e, "Cache write failed");
        }
    }

    async fn app_shell(&self) -> Option<Response> {
        let url = match self.config.resolve(&self.config.app_shell_path) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "Invalid app shell path");
                return None;
            }
        };
        self.lookup(&RequestKey::get(&url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use albumkit_net::RouteTable;
    use url::Url;

    fn config() -> WorkerConfig {
        WorkerConfig {
            media_hosts: vec!["media.example".to_string()],
            probe_hosts: vec!["probe.example".to_string()],
            client_routes: RouteTable::parse(["/albums/:id", "/login"]).unwrap(),
            ..WorkerConfig::for_scope("https://albums.example/").unwrap()
        }
    }

    fn request(method: Method, s: &str) -> Request {
        Request::new(method, Url::parse(s).unwrap())
    }

    #[test]
    fn test_dispatch_table() {
        let config = config();

        assert_eq!(
            dispatch(&request(Method::GET, "https://probe.example/ping"), &config),
            Strategy::Passthrough
        );
        assert_eq!(
            dispatch(&request(Method::POST, "https://probe.example/ping"), &config),
            Strategy::Passthrough
        );
        assert_eq!(
            dispatch(&request(Method::GET, "chrome-extension://abc/x.js"), &config),
            Strategy::Passthrough
        );
        assert_eq!(
            dispatch(&request(Method::GET, "https://media.example/p/1.jpg"), &config),
            Strategy::CacheFirst
        );
        assert_eq!(
            dispatch(&request(Method::POST, "https://api.example/classes/Album"), &config),
            Strategy::ReplayAware
        );
        assert_eq!(
            dispatch(&request(Method::DELETE, "https://media.example/p/1.jpg"), &config),
            Strategy::ReplayAware
        );
        assert_eq!(
            dispatch(&request(Method::GET, "https://albums.example/albums/42"), &config),
            Strategy::NetworkFirst {
                shell_fallback: true
            }
        );
        assert_eq!(
            dispatch(&request(Method::GET, "https://api.example/classes/Album"), &config),
            Strategy::NetworkFirst {
                shell_fallback: false
            }
        );
        assert_eq!(
            dispatch(&request(Method::GET, "https://api.example/login"), &config),
            Strategy::NetworkFirst {
                shell_fallback: false
            }
        );
        assert_eq!(
            dispatch(&request(Method::GET, "http://albums.example/login"), &config),
            Strategy::NetworkFirst {
                shell_fallback: false
            }
        );
    }

    #[test]
    fn test_dispatch_is_deterministic() {
        let config = config();
        let target = request(Method::GET, "https://albums.example/albums/7?tab=photos");
        let first = dispatch(&target, &config);
        for _ in 0..10 {
            assert_eq!(dispatch(&target, &config), first);
        }
    }
}
