//! Compute-on-demand fallback tier.
//!
//! Not real storage: every read resolves a registered loader by key prefix and
//! pays its cost. Writes, deletes and clears are no-ops.

use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use stratum_core::{CacheEntry, CacheStats, DataType, LoaderError, TierError, TierResult, TIER_COMPUTE};

use super::{CacheTier, TierCounters};
use crate::loader::Loader;

/// Loaders keyed by key prefix. The longest matching prefix wins.
#[derive(Default)]
pub struct LoaderRegistry {
    loaders: RwLock<Vec<(String, Arc<dyn Loader>)>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `loader` for keys starting with `prefix`. An empty prefix
    /// matches every key. Re-registering a prefix replaces its loader.
    pub fn register(&self, prefix: impl Into<String>, loader: Arc<dyn Loader>) {
        let prefix = prefix.into();
        if let Ok(mut loaders) = self.loaders.write() {
            loaders.retain(|(p, _)| *p != prefix);
            loaders.push((prefix, loader));
            loaders.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        }
    }

    pub fn resolve(&self, key: &str) -> Option<Arc<dyn Loader>> {
        let loaders = self.loaders.read().ok()?;
        loaders
            .iter()
            .find(|(prefix, _)| key.starts_with(prefix.as_str()))
            .map(|(_, loader)| Arc::clone(loader))
    }

    pub fn len(&self) -> usize {
        self.loaders.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ComputeFallbackTier {
    name: String,
    registry: Arc<LoaderRegistry>,
    default_ttl: Duration,
    counters: TierCounters,
}

impl ComputeFallbackTier {
    pub fn new(registry: Arc<LoaderRegistry>, default_ttl: Duration, stats_window: Duration) -> Self {
        Self {
            name: TIER_COMPUTE.to_string(),
            registry,
            default_ttl,
            counters: TierCounters::new(stats_window),
        }
    }

    pub fn registry(&self) -> &Arc<LoaderRegistry> {
        &self.registry
    }
}

#[async_trait]
impl Loader for ComputeFallbackTier {
    async fn load(&self, key: &str) -> Result<Vec<u8>, LoaderError> {
        let Some(loader) = self.registry.resolve(key) else {
            self.counters.miss();
            return Err(LoaderError::NoLoader {
                key: key.to_string(),
            });
        };
        match loader.load(key).await {
            Ok(value) => {
                self.counters.hit();
                Ok(value)
            }
            Err(e) => {
                self.counters.error();
                Err(e)
            }
        }
    }
}

#[async_trait]
impl CacheTier for ComputeFallbackTier {
    fn name(&self) -> &str {
        &self.name
    }

    fn fallback(&self) -> Option<&dyn Loader> {
        Some(self)
    }

    async fn get(&self, key: &str) -> TierResult<Option<CacheEntry>> {
        match self.load(key).await {
            Ok(value) => Ok(Some(
                CacheEntry::new(key, value, DataType::default(), self.default_ttl, crate::now())
                    .with_origin(self.name.clone()),
            )),
            Err(LoaderError::NoLoader { .. }) => Ok(None),
            Err(e) => Err(TierError::Unavailable {
                tier: self.name.clone(),
                reason: e.to_string(),
            }),
        }
    }

    async fn set(&self, _entry: CacheEntry) -> TierResult<()> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> TierResult<bool> {
        Ok(false)
    }

    async fn clear(&self, _tags: &[String]) -> TierResult<u64> {
        Ok(0)
    }

    async fn stats(&self) -> CacheStats {
        self.counters.snapshot(0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::loader_fn;

    fn registry() -> Arc<LoaderRegistry> {
        let registry = Arc::new(LoaderRegistry::new());
        registry.register("", loader_fn(|_| async { Ok::<_, LoaderError>(b"generic".to_vec()) }));
        registry.register("user:", loader_fn(|key| async move { Ok::<_, LoaderError>(key.into_bytes()) }));
        registry.register(
            "broken:",
            loader_fn(|key| async move { Err::<Vec<u8>, _>(LoaderError::failed(key, "upstream 500")) }),
        );
        registry
    }

    #[test]
    fn test_longest_prefix_wins() {
        let registry = registry();
        assert_eq!(registry.len(), 3);
        assert!(registry.resolve("user:1").is_some());
        let empty = LoaderRegistry::new();
        assert!(empty.resolve("user:1").is_none());
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_compute_tier_loads_through_registry() {
        let tier = ComputeFallbackTier::new(registry(), Duration::from_secs(60), Duration::from_secs(3600));
        assert!(!tier.is_storage());

        let entry = tier.get("user:7").await.unwrap().unwrap();
        assert_eq!(entry.value, b"user:7");
        assert_eq!(entry.origin_tier, "compute");

        assert_eq!(tier.load("other").await.unwrap(), b"generic");
        assert!(tier.get("broken:1").await.is_err());

        let stats = tier.stats().await;
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.errors, 1);
    }

    #[tokio::test]
    async fn test_no_loader_is_miss() {
        let tier = ComputeFallbackTier::new(
            Arc::new(LoaderRegistry::new()),
            Duration::from_secs(60),
            Duration::from_secs(3600),
        );
        assert!(tier.get("user:1").await.unwrap().is_none());
        assert!(matches!(
            tier.load("user:1").await,
            Err(LoaderError::NoLoader { .. })
        ));
        // writes are accepted and ignored
        tier.set(CacheEntry::new("k", vec![], DataType::default(), Duration::from_secs(1), crate::now()))
            .await
            .unwrap();
        assert_eq!(tier.stats().await.entry_count, 0);
    }
}
