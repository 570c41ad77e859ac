//! Worker configuration

use std::path::{Path, PathBuf};

use albumkit_net::RouteTable;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::codec::MutationMarker;
use crate::ServiceWorkerError;

/// Offline worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Origin and path the worker controls; relative paths resolve against it
    pub scope: Url,

    /// Prefix of every cache generation name
    pub cache_prefix: String,

    /// Version descriptor, relative to scope
    pub version_path: String,

    /// Build asset manifest, relative to scope
    pub manifest_path: String,

    /// Application shell document served for client-side routes
    pub app_shell_path: String,

    /// Hosts of the media-storage authority (cache-first)
    pub media_hosts: Vec<String>,

    /// Connectivity-probe hosts that are never intercepted
    pub probe_hosts: Vec<String>,

    /// Client-side routes answered by the application shell when offline
    pub client_routes: RouteTable,

    /// Body convention that suppresses persistence for replay
    pub mutation_marker: MutationMarker,

    /// Keep (request, response) pairs of successful mutations for read-back
    pub persist_mutation_responses: bool,

    /// Key/value store holding the replay queue
    pub replay_store: String,

    /// Key/value store holding worker metadata
    pub meta_store: String,

    /// Storage usage ratio above which caching is switched off
    pub storage_pressure_threshold: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scope: default_scope(),
            cache_prefix: "album-cache".to_string(),
            version_path: "version.json".to_string(),
            manifest_path: "asset-manifest.json".to_string(),
            app_shell_path: "index.html".to_string(),
            media_hosts: Vec::new(),
            probe_hosts: Vec::new(),
            client_routes: RouteTable::new(),
            mutation_marker: MutationMarker::default(),
            persist_mutation_responses: true,
            replay_store: "replay-queue".to_string(),
            meta_store: "worker-meta".to_string(),
            storage_pressure_threshold: 0.9,
        }
    }
}

fn default_scope() -> Url {
    // Parsing a constant; cannot fail.
    Url::parse("http://localhost/").unwrap_or_else(|_| unreachable!())
}

impl WorkerConfig {
    /// Create a configuration for the given scope.
    pub fn for_scope(scope: &str) -> Result<Self, ServiceWorkerError> {
        let scope = Url::parse(scope)
            .map_err(|e| ServiceWorkerError::ConfigError(format!("scope {}: {}", scope, e)))?;
        let config = Self {
            scope,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ServiceWorkerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ServiceWorkerError::ConfigError(format!("read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            ServiceWorkerError::ConfigError(format!("parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ServiceWorkerError> {
        if !matches!(self.scope.scheme(), "http" | "https") {
            return Err(ServiceWorkerError::ConfigError(format!(
                "scope must be http(s): {}",
                self.scope
            )));
        }
        if self.cache_prefix.is_empty() {
            return Err(ServiceWorkerError::ConfigError(
                "cache prefix must not be empty".to_string(),
            ));
        }
        if !(self.storage_pressure_threshold > 0.0 && self.storage_pressure_threshold <= 1.0) {
            return Err(ServiceWorkerError::ConfigError(format!(
                "storage pressure threshold must be in (0, 1]: {}",
                self.storage_pressure_threshold
            )));
        }
        if self.replay_store == self.meta_store {
            return Err(ServiceWorkerError::ConfigError(
                "replay and meta stores must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve a path against the scope.
    pub fn resolve(&self, path: &str) -> Result<Url, ServiceWorkerError> {
        self.scope
            .join(path.trim_start_matches('/'))
            .map_err(|e| ServiceWorkerError::ConfigError(format!("path {}: {}", path, e)))
    }

    /// Whether `host` is a media-storage host.
    pub fn is_media_host(&self, host: &str) -> bool {
        host_listed(&self.media_hosts, host)
    }

    /// Whether `host` is a connectivity-probe host.
    pub fn is_probe_host(&self, host: &str) -> bool {
        host_listed(&self.probe_hosts, host)
    }

    /// Whether `url` is same-origin with the scope and under its path.
    pub fn in_scope(&self, url: &Url) -> bool {
        url.origin() == self.scope.origin() && url.path().starts_with(self.scope.path())
    }

    /// Whether `url` is a client-side route of this app.
    pub fn is_client_route(&self, url: &Url) -> bool {
        self.in_scope(url) && self.client_routes.contains(url)
    }
}

/// `*.example.com` matches subdomains; anything else must match exactly.
fn host_listed(hosts: &[String], host: &str) -> bool {
    hosts.iter().any(|pattern| match pattern.strip_prefix("*.") {
        Some(domain) => host
            .strip_suffix(domain)
            .is_some_and(|rest| rest.ends_with('.')),
        None => pattern.eq_ignore_ascii_case(host),
    })
}

/// Default location of the durable store.
pub fn default_store_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("albumkit")
        .join("offline.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.persist_mutation_responses);
        assert_eq!(config.replay_store, "replay-queue");
    }

    #[test]
    fn test_resolve_against_scope() {
        let config = WorkerConfig::for_scope("https://albums.example/app/").unwrap();
        assert_eq!(
            config.resolve("/version.json").unwrap().as_str(),
            "https://albums.example/app/version.json"
        );
        assert_eq!(
            config.resolve("static/app.js").unwrap().as_str(),
            "https://albums.example/app/static/app.js"
        );
    }

    #[test]
    fn test_host_lists() {
        let config = WorkerConfig {
            media_hosts: vec!["*.media.example".to_string()],
            probe_hosts: vec!["probe.example".to_string()],
            ..Default::default()
        };
        assert!(config.is_media_host("cdn.media.example"));
        assert!(!config.is_media_host("media.example"));
        assert!(!config.is_media_host("evilmedia.example"));
        assert!(config.is_probe_host("PROBE.example"));
        assert!(!config.is_probe_host("api.example"));
    }

    #[test]
    fn test_client_routes_are_scope_bound() {
        let config = WorkerConfig {
            client_routes: RouteTable::parse(["/login", "/app/albums/:id"]).unwrap(),
            ..WorkerConfig::for_scope("https://albums.example/app/").unwrap()
        };
        let url = |s: &str| Url::parse(s).unwrap();

        assert!(config.in_scope(&url("https://albums.example/app/albums/1")));
        assert!(!config.in_scope(&url("https://albums.example/login")));
        assert!(!config.in_scope(&url("http://albums.example/app/albums/1")));

        assert!(config.is_client_route(&url("https://albums.example/app/albums/1")));
        assert!(!config.is_client_route(&url("https://albums.example/login")));
        assert!(!config.is_client_route(&url("https://api.example/app/albums/1")));
    }

    #[test]
    fn test_rejects_bad_threshold_and_scope() {
        let config = WorkerConfig {
            storage_pressure_threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(WorkerConfig::for_scope("file:///tmp/").is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(
            &path,
            r#"{
                "scope": "https://albums.example/",
                "mediaHosts": ["cdn.media.example"],
                "clientRoutes": ["/albums/:id", "/settings/*"],
                "mutationMarker": {"field": "_method", "values": ["PUT"]},
                "persistMutationResponses": false
            }"#,
        )
        .unwrap();

        let config = WorkerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.scope.as_str(), "https://albums.example/");
        assert_eq!(config.client_routes.len(), 2);
        assert!(!config.persist_mutation_responses);
        assert_eq!(config.cache_prefix, "album-cache");
    }
}
