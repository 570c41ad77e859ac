//! Durable queue of mutations awaiting delivery.
//!
//! Entries are keyed by the canonical JSON of their [`SerializedRequest`].
//! The queue only records and answers; replay is triggered by the host
//! through [`ReplayQueue::drain`].

use std::sync::Arc;

use albumkit_common::now_millis;
use albumkit_net::NetworkClient;
use albumkit_store::{DurableKeyValueStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::codec::{RequestCodec, SerializedRequest, SerializedResponse};
use crate::ServiceWorkerError;

/// One queued mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayQueueEntry {
    pub request: SerializedRequest,
    /// Last response seen for this request, if any.
    pub response: Option<SerializedResponse>,
    /// Still waiting for the network to confirm delivery.
    pub pending: bool,
    /// When the request was (last) queued, ms since epoch.
    pub queued_at: u64,
}

/// Outcome of a host-triggered replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub replayed: usize,
    pub failed: usize,
    /// Entries that could not be rebuilt into requests.
    pub skipped: usize,
}

/// Replay queue over a durable key/value store.
#[derive(Clone)]
pub struct ReplayQueue {
    store: Arc<dyn DurableKeyValueStore>,
    store_name: String,
    persist_responses: bool,
}

impl ReplayQueue {
    pub fn new(
        store: Arc<dyn DurableKeyValueStore>,
        store_name: impl Into<String>,
        persist_responses: bool,
    ) -> Self {
        Self {
            store,
            store_name: store_name.into(),
            persist_responses,
        }
    }

    /// Queue a request. Re-queuing the same request keeps its last response.
    ///
    /// Returns the entry key.
    pub async fn enqueue(&self, request: &SerializedRequest) -> Result<String, ServiceWorkerError> {
        let key = request.canonical_key()?;
        let request = request.clone();
        let queued_at = now_millis();

        self.store
            .update(
                &self.store_name,
                &key,
                Box::new(move |current| {
                    let response = current
                        .and_then(|v| serde_json::from_value::<ReplayQueueEntry>(v).ok())
                        .and_then(|entry| entry.response);
                    let entry = ReplayQueueEntry {
                        request,
                        response,
                        pending: true,
                        queued_at,
                    };
                    serde_json::to_value(entry).ok()
                }),
            )
            .await?;

        info!(key_len = key.len(), "Queued mutation for replay");
        Ok(key)
    }

    /// Look up an entry by key.
    pub async fn get(&self, key: &str) -> Result<Option<ReplayQueueEntry>, ServiceWorkerError> {
        match self.store.get(&self.store_name, key).await? {
            Some(value) => Ok(Some(decode(value)?)),
            None => Ok(None),
        }
    }

    /// Look up the entry for a request.
    pub async fn lookup(
        &self,
        request: &SerializedRequest,
    ) -> Result<Option<ReplayQueueEntry>, ServiceWorkerError> {
        self.get(&request.canonical_key()?).await
    }

    /// Entries still waiting for delivery, ordered by key.
    pub async fn peek(&self) -> Result<Vec<(String, ReplayQueueEntry)>, ServiceWorkerError> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|(_, entry)| entry.pending)
            .collect())
    }

    /// Every entry, pending or resolved, ordered by key.
    pub async fn entries(&self) -> Result<Vec<(String, ReplayQueueEntry)>, ServiceWorkerError> {
        let records = self.store.get_all(&self.store_name).await?;
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            match decode(record.value) {
                Ok(entry) => entries.push((record.key, entry)),
                Err(e) => warn!(error = %e, "Skipping unreadable replay entry"),
            }
        }
        Ok(entries)
    }

    /// Number of pending entries.
    pub async fn pending_count(&self) -> Result<usize, ServiceWorkerError> {
        Ok(self.peek().await?.len())
    }

    /// Attach a response to an existing entry. Returns whether the entry
    /// existed.
    pub async fn resolve(
        &self,
        key: &str,
        response: SerializedResponse,
    ) -> Result<bool, ServiceWorkerError> {
        let updated = self
            .store
            .update(
                &self.store_name,
                key,
                Box::new(move |current| {
                    let mut entry = serde_json::from_value::<ReplayQueueEntry>(current?).ok()?;
                    entry.response = Some(response);
                    serde_json::to_value(entry).ok()
                }),
            )
            .await?;
        Ok(updated.is_some())
    }

    /// Record that the network confirmed a request.
    ///
    /// With response persistence on, the entry is kept (no longer pending)
    /// together with `response` for later read-back; otherwise it is removed.
    pub async fn complete(
        &self,
        request: &SerializedRequest,
        response: SerializedResponse,
    ) -> Result<(), ServiceWorkerError> {
        let key = request.canonical_key()?;

        if !self.persist_responses {
            if self.store.delete(&self.store_name, &key).await? {
                debug!("Removed delivered mutation");
            }
            return Ok(());
        }

        let entry = ReplayQueueEntry {
            request: request.clone(),
            response: Some(response),
            pending: false,
            queued_at: now_millis(),
        };
        self.store
            .put(&self.store_name, &key, serde_json::to_value(entry).map_err(StoreError::from)?)
            .await?;
        Ok(())
    }

    /// Replay every pending entry once against `network`.
    ///
    /// This is an explicit opt-in for the host. The fetch path never calls
    /// it; there a queued entry is only retried when the same or an
    /// equivalent request is made again. Entries whose replay fails stay
    /// pending.
    pub async fn drain(
        &self,
        network: &dyn NetworkClient,
        codec: &RequestCodec,
    ) -> Result<DrainReport, ServiceWorkerError> {
        let mut report = DrainReport::default();

        for (key, entry) in self.peek().await? {
            let request = match codec.deserialize_request(&entry.request) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, url = %entry.request.url, "Cannot rebuild queued request");
                    report.skipped += 1;
                    continue;
                }
            };

            match network.fetch(&request).await {
                Ok(response) if !response.is_network_error() => {
                    self.complete(&entry.request, codec.serialize_response(&response))
                        .await?;
                    report.replayed += 1;
                }
                Ok(_) => {
                    debug!(key_len = key.len(), "Replay got network error response");
                    report.failed += 1;
                }
                Err(e) => {
                    debug!(error = %e, url = %entry.request.url, "Replay failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            replayed = report.replayed,
            failed = report.failed,
            skipped = report.skipped,
            "Replay pass finished"
        );
        Ok(report)
    }
}

fn decode(value: JsonValue) -> Result<ReplayQueueEntry, StoreError> {
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use albumkit_net::Request;
    use albumkit_store::MemoryKeyValueStore;
    use std::collections::BTreeMap;
    use url::Url;

    fn queue(persist: bool) -> ReplayQueue {
        ReplayQueue::new(Arc::new(MemoryKeyValueStore::new()), "replay-queue", persist)
    }

    fn mutation(body: &str) -> SerializedRequest {
        let request = Request::post(
            Url::parse("https://api.example/classes/Album").unwrap(),
            body.to_string(),
        );
        RequestCodec::default()
            .serialize_request(&request)
            .unwrap()
            .unwrap()
    }

    fn created(body: &str) -> SerializedResponse {
        SerializedResponse {
            headers: BTreeMap::new(),
            status: 201,
            status_text: "Created".to_string(),
            body: body.to_string(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_dedupes_identical_requests() {
        let queue = queue(true);
        let request = mutation(r#"{"title":"Trip"}"#);

        let k1 = queue.enqueue(&request).await.unwrap();
        let k2 = queue.enqueue(&request).await.unwrap();
        assert_eq!(k1, k2);
        assert_eq!(queue.pending_count().await.unwrap(), 1);

        queue.enqueue(&mutation(r#"{"title":"Other"}"#)).await.unwrap();
        assert_eq!(queue.pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_requeue_keeps_previous_response() {
        let queue = queue(true);
        let request = mutation(r#"{"title":"Trip"}"#);

        queue.complete(&request, created(r#"{"objectId":"a1"}"#)).await.unwrap();
        let entry = queue.lookup(&request).await.unwrap().unwrap();
        assert!(!entry.pending);

        queue.enqueue(&request).await.unwrap();
        let entry = queue.lookup(&request).await.unwrap().unwrap();
        assert!(entry.pending);
        assert_eq!(entry.response.unwrap().body, r#"{"objectId":"a1"}"#);
    }

    #[tokio::test]
    async fn test_complete_without_persistence_deletes() {
        let queue = queue(false);
        let request = mutation(r#"{"title":"Trip"}"#);

        queue.enqueue(&request).await.unwrap();
        queue.complete(&request, created("{}")).await.unwrap();
        assert!(queue.lookup(&request).await.unwrap().is_none());
        assert!(queue.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_only_touches_existing_entries() {
        let queue = queue(true);
        let request = mutation(r#"{"title":"Trip"}"#);
        let key = request.canonical_key().unwrap();

        assert!(!queue.resolve(&key, created("{}")).await.unwrap());
        assert!(queue.get(&key).await.unwrap().is_none());

        queue.enqueue(&request).await.unwrap();
        assert!(queue.resolve(&key, created("{}")).await.unwrap());
        let entry = queue.get(&key).await.unwrap().unwrap();
        assert!(entry.pending);
        assert_eq!(entry.response.unwrap().status, 201);
    }

    #[tokio::test]
    async fn test_peek_excludes_delivered() {
        let queue = queue(true);
        let delivered = mutation(r#"{"n":1}"#);
        let waiting = mutation(r#"{"n":2}"#);

        queue.complete(&delivered, created("{}")).await.unwrap();
        queue.enqueue(&waiting).await.unwrap();

        let pending = queue.peek().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1.request, waiting);
        assert_eq!(queue.entries().await.unwrap().len(), 2);
    }
}
