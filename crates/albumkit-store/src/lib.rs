//! # AlbumKit Store
//!
//! Durable storage capabilities for the AlbumKit offline layer.
//!
//! ## Features
//!
//! - **DurableCache**: named caches of request-key → response records,
//!   the backing for cache generations
//! - **DurableKeyValueStore**: named object stores of JSON records with an
//!   atomic read-modify-write, the backing for the replay queue
//! - **Backends**: in-memory (tests, ephemeral hosts) and SQLite (durable,
//!   shared across processes through SQLite transactions)
//!
//! ## Architecture
//!
//! ```text
//! DurableCache
//!     └── cache name (one per generation)
//!             └── request key → CacheRecord
//!
//! DurableKeyValueStore
//!     └── store name
//!             └── key → serde_json::Value
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryCacheStorage, MemoryKeyValueStore};
pub use sqlite::SqliteStore;

// ==================== Errors ====================

/// Storage errors.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the failure came from running out of storage.
    pub fn is_quota(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::DataError(e.to_string())
    }
}

// ==================== Records ====================

/// A cached response, opaque to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response status text.
    pub status_text: String,

    /// Response headers, in wire order.
    pub headers: Vec<(String, String)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheRecord {
    /// Approximate storage footprint in bytes.
    pub fn size(&self) -> usize {
        self.url.len()
            + self.method.len()
            + self.status_text.len()
            + self
                .headers
                .iter()
                .map(|(n, v)| n.len() + v.len())
                .sum::<usize>()
            + self.body.len()
    }
}

/// A stored key/value record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub value: JsonValue,
}

/// Read-modify-write step for [`DurableKeyValueStore::update`].
///
/// Receives the current value (if any); returning `None` deletes the record.
pub type UpdateFn = Box<dyn FnOnce(Option<JsonValue>) -> Option<JsonValue> + Send>;

// ==================== Capabilities ====================

/// Named caches of request-keyed responses.
///
/// Reads against a cache that does not exist behave as reads against an
/// empty cache; writes require the cache to have been opened.
#[async_trait]
pub trait DurableCache: Send + Sync {
    /// Create the named cache if absent. Idempotent.
    async fn open(&self, cache_name: &str) -> Result<(), StoreError>;

    /// Whether the named cache exists.
    async fn has(&self, cache_name: &str) -> Result<bool, StoreError>;

    /// Names of all existing caches.
    async fn cache_names(&self) -> Result<Vec<String>, StoreError>;

    /// Remove a cache and all its entries. Returns whether it existed.
    async fn delete_cache(&self, cache_name: &str) -> Result<bool, StoreError>;

    /// Store a record, replacing any existing one under the same key.
    async fn put(&self, cache_name: &str, key: &str, record: CacheRecord)
        -> Result<(), StoreError>;

    /// Store several records in one transaction: all or none are written.
    async fn put_all(
        &self,
        cache_name: &str,
        records: Vec<(String, CacheRecord)>,
    ) -> Result<(), StoreError>;

    /// Look up a record.
    async fn get(&self, cache_name: &str, key: &str) -> Result<Option<CacheRecord>, StoreError>;

    /// All keys in the cache.
    async fn keys(&self, cache_name: &str) -> Result<Vec<String>, StoreError>;

    /// Remove a single record. Returns whether it existed.
    async fn delete(&self, cache_name: &str, key: &str) -> Result<bool, StoreError>;
}

/// Named object stores of JSON records.
///
/// Stores are created on first write.
#[async_trait]
pub trait DurableKeyValueStore: Send + Sync {
    /// Get a record's value.
    async fn get(&self, store: &str, key: &str) -> Result<Option<JsonValue>, StoreError>;

    /// Put a record (overwrites if exists).
    async fn put(&self, store: &str, key: &str, value: JsonValue) -> Result<(), StoreError>;

    /// Delete a record. Returns whether it existed.
    async fn delete(&self, store: &str, key: &str) -> Result<bool, StoreError>;

    /// All keys, sorted.
    async fn keys(&self, store: &str) -> Result<Vec<String>, StoreError>;

    /// All records, sorted by key.
    async fn get_all(&self, store: &str) -> Result<Vec<Record>, StoreError>;

    /// Atomically read, transform and write one record.
    ///
    /// Returns the value left in the store.
    async fn update(
        &self,
        store: &str,
        key: &str,
        f: UpdateFn,
    ) -> Result<Option<JsonValue>, StoreError>;

    /// Count records.
    async fn count(&self, store: &str) -> Result<usize, StoreError> {
        Ok(self.keys(store).await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_size_counts_body_and_headers() {
        let record = CacheRecord {
            url: "https://a/b".to_string(),
            method: "GET".to_string(),
            status: 200,
            status_text: "OK".to_string(),
            headers: vec![("a".to_string(), "bc".to_string())],
            body: vec![0; 10],
            cached_at: 0,
        };
        assert_eq!(record.size(), 11 + 3 + 2 + 3 + 10);
    }

    #[test]
    fn test_quota_classification() {
        assert!(StoreError::QuotaExceeded("x".into()).is_quota());
        assert!(!StoreError::Backend("x".into()).is_quota());
    }
}
