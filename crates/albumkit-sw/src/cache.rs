//! Versioned response caches.
//!
//! Each application version owns one cache generation. Lookups are scoped to
//! a single generation so responses from one build are never mixed with
//! another's.

use std::sync::Arc;

use albumkit_common::now_millis;
use albumkit_net::{Request, Response};
use albumkit_store::{CacheRecord, DurableCache, StoreError};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use tracing::{debug, info, warn};
use url::Url;

use crate::context::CacheGeneration;

// ==================== Request Key ====================

/// Cache key: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self(format!("{} {}", method.as_str(), url))
    }

    pub fn for_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }

    /// Key of a GET for `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ==================== Cache ====================

/// Handle to one cache generation.
#[derive(Clone)]
pub struct Cache {
    generation: CacheGeneration,
    backend: Arc<dyn DurableCache>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("generation", &self.generation)
            .finish()
    }
}

impl Cache {
    pub fn generation(&self) -> &CacheGeneration {
        &self.generation
    }

    /// Store a response. The last write for a key wins.
    pub async fn put(&self, key: &RequestKey, response: &Response) -> Result<(), StoreError> {
        let record = record_from_response(key, response);
        self.backend
            .put(self.generation.name(), key.as_str(), record)
            .await?;
        debug!(generation = %self.generation, key = %key, "Cached response");
        Ok(())
    }

    /// Store several responses atomically.
    pub async fn put_all(&self, entries: &[(RequestKey, Response)]) -> Result<(), StoreError> {
        let records = entries
            .iter()
            .map(|(key, response)| (key.as_str().to_string(), record_from_response(key, response)))
            .collect();
        self.backend.put_all(self.generation.name(), records).await?;
        debug!(generation = %self.generation, count = entries.len(), "Cached responses");
        Ok(())
    }

    /// Look up a response in this generation only.
    pub async fn match_request(&self, key: &RequestKey) -> Result<Option<Response>, StoreError> {
        let record = self
            .backend
            .get(self.generation.name(), key.as_str())
            .await?;
        Ok(record.map(|r| response_from_record(&r)))
    }

    pub async fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.backend.keys(self.generation.name()).await
    }

    pub async fn delete(&self, key: &RequestKey) -> Result<bool, StoreError> {
        self.backend.delete(self.generation.name(), key.as_str()).await
    }
}

// ==================== Versioned Cache Store ====================

/// All cache generations of one origin.
#[derive(Clone)]
pub struct VersionedCacheStore {
    backend: Arc<dyn DurableCache>,
}

impl VersionedCacheStore {
    pub fn new(backend: Arc<dyn DurableCache>) -> Self {
        Self { backend }
    }

    /// Open a generation, creating it if absent.
    pub async fn open(&self, generation: &CacheGeneration) -> Result<Cache, StoreError> {
        self.backend.open(generation.name()).await?;
        Ok(self.handle(generation))
    }

    /// Handle to a generation without creating it. Reads on a missing
    /// generation behave as misses.
    pub fn handle(&self, generation: &CacheGeneration) -> Cache {
        Cache {
            generation: generation.clone(),
            backend: Arc::clone(&self.backend),
        }
    }

    /// Look up a response in one generation.
    pub async fn match_request(
        &self,
        generation: &CacheGeneration,
        key: &RequestKey,
    ) -> Result<Option<Response>, StoreError> {
        self.handle(generation).match_request(key).await
    }

    /// Names of all existing generations.
    pub async fn generations(&self) -> Result<Vec<String>, StoreError> {
        let mut names = self.backend.cache_names().await?;
        names.sort();
        Ok(names)
    }

    /// Delete a generation and everything in it.
    pub async fn delete_generation(&self, name: &str) -> Result<bool, StoreError> {
        let existed = self.backend.delete_cache(name).await?;
        if existed {
            info!(generation = %name, "Deleted cache generation");
        }
        Ok(existed)
    }

    /// Delete every generation except `keep`. Returns the deleted names.
    pub async fn retain_only(&self, keep: &CacheGeneration) -> Result<Vec<String>, StoreError> {
        let mut deleted = Vec::new();
        for name in self.generations().await? {
            if name != keep.name() && self.delete_generation(&name).await? {
                deleted.push(name);
            }
        }
        Ok(deleted)
    }
}

// ==================== Conversions ====================

fn record_from_response(key: &RequestKey, response: &Response) -> CacheRecord {
    let (method, url) = key
        .as_str()
        .split_once(' ')
        .unwrap_or(("GET", key.as_str()));
    CacheRecord {
        url: url.to_string(),
        method: method.to_string(),
        status: response.status,
        status_text: response.status_text.clone(),
        headers: response
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect(),
        body: response.body.to_vec(),
        cached_at: now_millis(),
    }
}

fn response_from_record(record: &CacheRecord) -> Response {
    let mut headers = HeaderMap::new();
    for (name, value) in &record.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(header = %name, url = %record.url, "Skipping cached header"),
        }
    }

    let mut response = Response::new(record.status, record.body.clone());
    response.status_text = record.status_text.clone();
    response.headers = headers;
    response.url = Url::parse(&record.url).ok();
    response.from_cache = true;
    response
}
