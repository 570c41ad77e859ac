//! Worker-scoped state shared by the lifecycle controller and fetch policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// A named, versioned cache. Exactly one generation is current.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheGeneration(String);

impl CacheGeneration {
    /// Generation name for an application version.
    pub fn from_version(prefix: &str, version: &str) -> Self {
        Self(format!("{}-v{}", prefix, version))
    }

    /// Wrap an existing cache name.
    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-instance worker state.
///
/// `use_cache` is not persisted: every new instance starts with caching on.
#[derive(Debug)]
pub struct WorkerContext {
    use_cache: AtomicBool,
    generation: RwLock<Option<CacheGeneration>>,
}

impl Default for WorkerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerContext {
    pub fn new() -> Self {
        Self {
            use_cache: AtomicBool::new(true),
            generation: RwLock::new(None),
        }
    }

    /// Whether policies may write to the cache.
    pub fn use_cache(&self) -> bool {
        self.use_cache.load(Ordering::SeqCst)
    }

    /// Set the cache-write flag, returning the previous value.
    pub fn set_use_cache(&self, enabled: bool) -> bool {
        self.use_cache.swap(enabled, Ordering::SeqCst)
    }

    /// The current generation, once install has resolved one.
    pub fn generation(&self) -> Option<CacheGeneration> {
        match self.generation.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_generation(&self, generation: CacheGeneration) {
        let mut guard = match self.generation.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_name() {
        let generation = CacheGeneration::from_version("album-cache", "1.4.2");
        assert_eq!(generation.name(), "album-cache-v1.4.2");
        assert_eq!(generation.to_string(), "album-cache-v1.4.2");
    }

    #[test]
    fn test_use_cache_starts_on() {
        let context = WorkerContext::new();
        assert!(context.use_cache());
        assert!(context.set_use_cache(false));
        assert!(!context.use_cache());
        assert!(context.generation().is_none());
    }
}
