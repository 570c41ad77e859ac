//! Install, activate and control-channel handling.

use std::sync::Arc;

use albumkit_net::{CacheMode, NetworkClient, Request, Response};
use albumkit_store::DurableKeyValueStore;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{RequestKey, VersionedCacheStore};
use crate::clients::Clients;
use crate::config::WorkerConfig;
use crate::context::{CacheGeneration, WorkerContext};
use crate::ServiceWorkerError;

const CURRENT_GENERATION_KEY: &str = "current-generation";

// ==================== Wire Types ====================

/// `version.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDescriptor {
    pub version: String,
}

/// One entry of the build asset manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestAsset {
    pub path: String,
}

/// Control-channel message. Any other shape is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlMessage {
    #[serde(rename = "useCache", default, skip_serializing_if = "Option::is_none")]
    pub use_cache: Option<bool>,
}

impl ControlMessage {
    /// Parse a raw message; `None` for anything that is not this shape.
    pub fn parse(value: &JsonValue) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

/// Storage usage reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEstimate {
    pub usage: u64,
    pub quota: u64,
}

impl StorageEstimate {
    pub fn ratio(&self) -> f64 {
        if self.quota == 0 {
            return 1.0;
        }
        self.usage as f64 / self.quota as f64
    }

    /// The control message a page sends for this estimate.
    pub fn control_message(&self, threshold: f64) -> ControlMessage {
        ControlMessage {
            use_cache: Some(self.ratio() < threshold),
        }
    }
}

// ==================== Reports ====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub generation: CacheGeneration,
    /// Number of manifest assets cached; zero without a manifest.
    pub precached: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateReport {
    pub generation: CacheGeneration,
    /// Generations deleted during activation.
    pub evicted: Vec<String>,
    /// Clients newly controlled.
    pub claimed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCheck {
    pub current: Option<CacheGeneration>,
    pub available: CacheGeneration,
}

impl UpdateCheck {
    pub fn update_found(&self) -> bool {
        self.current.as_ref() != Some(&self.available)
    }
}

// ==================== Lifecycle Controller ====================

/// Drives install and activate against the durable stores.
#[derive(Clone)]
pub struct LifecycleController {
    cache: VersionedCacheStore,
    meta: Arc<dyn DurableKeyValueStore>,
    network: Arc<dyn NetworkClient>,
    context: Arc<WorkerContext>,
    config: Arc<WorkerConfig>,
    clients: Arc<RwLock<Clients>>,
}

impl LifecycleController {
    pub fn new(
        cache: VersionedCacheStore,
        meta: Arc<dyn DurableKeyValueStore>,
        network: Arc<dyn NetworkClient>,
        context: Arc<WorkerContext>,
        config: Arc<WorkerConfig>,
        clients: Arc<RwLock<Clients>>,
    ) -> Self {
        Self {
            cache,
            meta,
            network,
            context,
            config,
            clients,
        }
    }

    /// Resolve the generation, open it and precache the manifest.
    ///
    /// Precaching is all-or-nothing: one failing asset fails the install and
    /// nothing is written.
    pub async fn on_install(&self) -> Result<InstallReport, ServiceWorkerError> {
        let generation = self.fetch_generation().await?;
        info!(generation = %generation, "Installing");

        let cache = self.cache.open(&generation).await?;

        let assets = match self.fetch_manifest().await? {
            Some(assets) => assets,
            None => {
                self.context.set_generation(generation.clone());
                return Ok(InstallReport {
                    generation,
                    precached: 0,
                });
            }
        };

        let urls = assets
            .iter()
            .map(|asset| self.config.resolve(&asset.path))
            .collect::<Result<Vec<Url>, _>>()?;
        let entries = try_join_all(urls.into_iter().map(|url| self.fetch_asset(url))).await?;

        cache.put_all(&entries).await?;
        self.context.set_generation(generation.clone());

        info!(generation = %generation, assets = entries.len(), "Precache complete");
        Ok(InstallReport {
            generation,
            precached: entries.len(),
        })
    }

    /// Delete every other generation, record the current one and claim
    /// clients.
    pub async fn on_activate(&self) -> Result<ActivateReport, ServiceWorkerError> {
        let generation = match self.context.generation() {
            Some(generation) => generation,
            None => self.resume().await?.ok_or_else(|| {
                ServiceWorkerError::StateError("no installed generation to activate".to_string())
            })?,
        };

        let evicted = self.cache.retain_only(&generation).await?;
        self.meta
            .put(
                &self.config.meta_store,
                CURRENT_GENERATION_KEY,
                serde_json::to_value(&generation).map_err(albumkit_store::StoreError::from)?,
            )
            .await?;

        let claimed = self.clients.write().await.claim(&self.config.scope);
        info!(
            generation = %generation,
            evicted = evicted.len(),
            claimed = claimed.len(),
            "Activated"
        );

        Ok(ActivateReport {
            generation,
            evicted,
            claimed,
        })
    }

    /// Apply a control-channel message. Returns the new `useCache` value if
    /// the message changed anything.
    pub fn on_control_message(&self, message: &JsonValue) -> Option<bool> {
        let Some(ControlMessage {
            use_cache: Some(use_cache),
        }) = ControlMessage::parse(message)
        else {
            debug!("Ignoring control message");
            return None;
        };
        let previous = self.context.set_use_cache(use_cache);
        if previous != use_cache {
            info!(use_cache, "Cache writes toggled");
        }
        Some(use_cache)
    }

    /// Fetch the version descriptor and compare it with the current
    /// generation.
    pub async fn check_for_update(&self) -> Result<UpdateCheck, ServiceWorkerError> {
        let available = self.fetch_generation().await?;
        let current = match self.context.generation() {
            Some(generation) => Some(generation),
            None => self.resume().await?,
        };
        Ok(UpdateCheck { current, available })
    }

    /// Restore the generation recorded by the last activation.
    pub async fn resume(&self) -> Result<Option<CacheGeneration>, ServiceWorkerError> {
        let Some(value) = self
            .meta
            .get(&self.config.meta_store, CURRENT_GENERATION_KEY)
            .await?
        else {
            return Ok(None);
        };
        let generation: CacheGeneration =
            serde_json::from_value(value).map_err(albumkit_store::StoreError::from)?;
        debug!(generation = %generation, "Restored generation");
        self.context.set_generation(generation.clone());
        Ok(Some(generation))
    }

    async fn fetch_generation(&self) -> Result<CacheGeneration, ServiceWorkerError> {
        let url = self.config.resolve(&self.config.version_path)?;
        let response = self.fetch_fresh(url.clone()).await?;
        if !response.ok() {
            return Err(ServiceWorkerError::InstallFailed(format!(
                "{} returned {}",
                url, response.status
            )));
        }
        let descriptor: VersionDescriptor = response
            .json()
            .map_err(|e| ServiceWorkerError::InstallFailed(format!("version {}: {}", url, e)))?;
        if descriptor.version.trim().is_empty() {
            return Err(ServiceWorkerError::InstallFailed(format!(
                "{} has an empty version",
                url
            )));
        }
        Ok(CacheGeneration::from_version(
            &self.config.cache_prefix,
            descriptor.version.trim(),
        ))
    }

    /// `None` when no manifest is published.
    async fn fetch_manifest(&self) -> Result<Option<Vec<ManifestAsset>>, ServiceWorkerError> {
        let url = self.config.resolve(&self.config.manifest_path)?;
        let response = match self.fetch_fresh(url.clone()).await {
            Ok(response) if response.ok() => response,
            Ok(response) => {
                info!(url = %url, status = response.status, "No asset manifest, skipping precache");
                return Ok(None);
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Asset manifest unavailable, skipping precache");
                return Ok(None);
            }
        };
        let assets: Vec<ManifestAsset> = response
            .json()
            .map_err(|e| ServiceWorkerError::InstallFailed(format!("manifest {}: {}", url, e)))?;
        Ok(Some(assets))
    }

    async fn fetch_asset(&self, url: Url) -> Result<(RequestKey, Response), ServiceWorkerError> {
        let response = self.fetch_fresh(url.clone()).await?;
        if !response.ok() {
            return Err(ServiceWorkerError::InstallFailed(format!(
                "asset {} returned {}",
                url, response.status
            )));
        }
        Ok((RequestKey::get(&url), response))
    }

    async fn fetch_fresh(&self, url: Url) -> Result<Response, ServiceWorkerError> {
        let mut request = Request::get(url);
        request.cache = CacheMode::NoStore;
        Ok(self.network.fetch(&request).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_control_message_shapes() {
        assert_eq!(
            ControlMessage::parse(&json!({"useCache": false})),
            Some(ControlMessage {
                use_cache: Some(false)
            })
        );
        assert_eq!(ControlMessage::parse(&json!({})), Some(ControlMessage::default()));
        assert_eq!(ControlMessage::parse(&json!({"useCache": "no"})), None);
        assert_eq!(ControlMessage::parse(&json!({"useCache": true, "x": 1})), None);
        assert_eq!(ControlMessage::parse(&json!([{"useCache": true}])), None);
        assert_eq!(ControlMessage::parse(&json!("useCache")), None);
    }

    #[test]
    fn test_storage_estimate_threshold() {
        let estimate = StorageEstimate {
            usage: 95,
            quota: 100,
        };
        assert_eq!(estimate.control_message(0.9).use_cache, Some(false));
        assert_eq!(estimate.control_message(0.99).use_cache, Some(true));

        let unknown = StorageEstimate { usage: 0, quota: 0 };
        assert_eq!(unknown.control_message(0.9).use_cache, Some(false));
    }

    #[test]
    fn test_control_message_serializes_camel_case() {
        let message = StorageEstimate {
            usage: 1,
            quota: 10,
        }
        .control_message(0.9);
        assert_eq!(serde_json::to_value(&message).unwrap(), json!({"useCache": true}));
    }

    #[test]
    fn test_update_found() {
        let check = UpdateCheck {
            current: Some(CacheGeneration::named("album-cache-v6")),
            available: CacheGeneration::named("album-cache-v7"),
        };
        assert!(check.update_found());
        let same = UpdateCheck {
            current: Some(CacheGeneration::named("album-cache-v7")),
            available: CacheGeneration::named("album-cache-v7"),
        };
        assert!(!same.update_found());
    }
}
