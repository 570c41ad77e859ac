//! In-memory backends.
//!
//! Both backends share state through `Arc`, so clones observe the same data
//! the way two workers on one origin observe one durable store.

use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::{CacheRecord, DurableCache, DurableKeyValueStore, Record, StoreError, UpdateFn};

// ==================== Cache Storage ====================

/// A single named cache.
#[derive(Debug, Default)]
struct Cache {
    entries: HashMap<String, CacheRecord>,
}

impl Cache {
    fn bytes(&self) -> usize {
        self.entries.values().map(CacheRecord::size).sum()
    }
}

#[derive(Debug, Default)]
struct CacheStorageInner {
    caches: HashMap<String, Cache>,
}

impl CacheStorageInner {
    fn used_bytes(&self) -> usize {
        self.caches.values().map(Cache::bytes).sum()
    }
}

/// In-memory [`DurableCache`] with an optional byte quota.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStorage {
    inner: Arc<RwLock<CacheStorageInner>>,
    quota: Option<usize>,
}

impl MemoryCacheStorage {
    /// Create new cache storage without a quota.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create cache storage that rejects writes beyond `quota` bytes.
    pub fn with_quota(quota: usize) -> Self {
        Self {
            inner: Arc::default(),
            quota: Some(quota),
        }
    }

    /// Bytes currently used across all caches.
    pub async fn used_bytes(&self) -> usize {
        self.inner.read().await.used_bytes()
    }

    fn check_quota(
        &self,
        inner: &CacheStorageInner,
        cache_name: &str,
        incoming: &[(String, CacheRecord)],
    ) -> Result<(), StoreError> {
        let Some(quota) = self.quota else {
            return Ok(());
        };

        let replaced: usize = inner
            .caches
            .get(cache_name)
            .map(|cache| {
                incoming
                    .iter()
                    .filter_map(|(key, _)| cache.entries.get(key))
                    .map(CacheRecord::size)
                    .sum()
            })
            .unwrap_or(0);
        let added: usize = incoming.iter().map(|(_, r)| r.size()).sum();
        let projected = inner.used_bytes() - replaced + added;

        if projected > quota {
            return Err(StoreError::QuotaExceeded(format!(
                "{} bytes requested, quota is {}",
                projected, quota
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableCache for MemoryCacheStorage {
    async fn open(&self, cache_name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.caches.entry(cache_name.to_string()).or_default();
        Ok(())
    }

    async fn has(&self, cache_name: &str) -> Result<bool, StoreError> {
        Ok(self.inner.read().await.caches.contains_key(cache_name))
    }

    async fn cache_names(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self.inner.read().await.caches.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete_cache(&self, cache_name: &str) -> Result<bool, StoreError> {
        let removed = self.inner.write().await.caches.remove(cache_name).is_some();
        debug!(cache = cache_name, removed, "Deleted cache");
        Ok(removed)
    }

    async fn put(
        &self,
        cache_name: &str,
        key: &str,
        record: CacheRecord,
    ) -> Result<(), StoreError> {
        self.put_all(cache_name, vec![(key.to_string(), record)]).await
    }

    async fn put_all(
        &self,
        cache_name: &str,
        records: Vec<(String, CacheRecord)>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.caches.contains_key(cache_name) {
            return Err(StoreError::NotFound(format!("cache {}", cache_name)));
        }
        self.check_quota(&inner, cache_name, &records)?;

        let cache = inner
            .caches
            .get_mut(cache_name)
            .ok_or_else(|| StoreError::NotFound(format!("cache {}", cache_name)))?;
        for (key, record) in records {
            trace!(cache = cache_name, key = %key, "Cache put");
            cache.entries.insert(key, record);
        }
        Ok(())
    }

    async fn get(&self, cache_name: &str, key: &str) -> Result<Option<CacheRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .caches
            .get(cache_name)
            .and_then(|cache| cache.entries.get(key))
            .cloned())
    }

    async fn keys(&self, cache_name: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        let mut keys: Vec<String> = inner
            .caches
            .get(cache_name)
            .map(|cache| cache.entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, cache_name: &str, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .caches
            .get_mut(cache_name)
            .map(|cache| cache.entries.remove(key).is_some())
            .unwrap_or(false))
    }
}

// ==================== Key/Value ====================

/// An object store.
#[derive(Debug, Default)]
struct ObjectStore {
    records: HashMap<String, Record>,
}

/// In-memory [`DurableKeyValueStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyValueStore {
    stores: Arc<RwLock<HashMap<String, ObjectStore>>>,
}

impl MemoryKeyValueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableKeyValueStore for MemoryKeyValueStore {
    async fn get(&self, store: &str, key: &str) -> Result<Option<JsonValue>, StoreError> {
        let stores = self.stores.read().await;
        Ok(stores
            .get(store)
            .and_then(|s| s.records.get(key))
            .map(|r| r.value.clone()))
    }

    async fn put(&self, store: &str, key: &str, value: JsonValue) -> Result<(), StoreError> {
        let mut stores = self.stores.write().await;
        stores.entry(store.to_string()).or_default().records.insert(
            key.to_string(),
            Record {
                key: key.to_string(),
                value,
            },
        );
        Ok(())
    }

    async fn delete(&self, store: &str, key: &str) -> Result<bool, StoreError> {
        let mut stores = self.stores.write().await;
        Ok(stores
            .get_mut(store)
            .map(|s| s.records.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn keys(&self, store: &str) -> Result<Vec<String>, StoreError> {
        let stores = self.stores.read().await;
        let mut keys: Vec<String> = stores
            .get(store)
            .map(|s| s.records.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    async fn get_all(&self, store: &str) -> Result<Vec<Record>, StoreError> {
        let stores = self.stores.read().await;
        let mut records: Vec<Record> = stores
            .get(store)
            .map(|s| s.records.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    async fn update(
        &self,
        store: &str,
        key: &str,
        f: UpdateFn,
    ) -> Result<Option<JsonValue>, StoreError> {
        // The write lock spans the whole read-modify-write.
        let mut stores = self.stores.write().await;
        let object_store = stores.entry(store.to_string()).or_default();
        let current = object_store.records.get(key).map(|r| r.value.clone());

        match f(current) {
            Some(value) => {
                object_store.records.insert(
                    key.to_string(),
                    Record {
                        key: key.to_string(),
                        value: value.clone(),
                    },
                );
                Ok(Some(value))
            }
            None => {
                object_store.records.remove(key);
                Ok(None)
            }
        }
    }
}
