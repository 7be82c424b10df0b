//! STRATUM Test Utilities
//!
//! Shared test infrastructure for the STRATUM workspace:
//! - Mock loaders and remote stores with failure injection
//! - Proptest generators for keys, tags, TTLs and strategies
//! - Fixtures for fully wired cache systems
//! - Assertions for cache reads and errors

pub use stratum_cache::{
    CacheRead, CacheSystem, GetOptions, Loader, MultiLevelCacheCoordinator, ReadSource,
    SetOptions,
};
pub use stratum_core::{
    DataType, LoaderError, StratumConfig, StratumError, StratumResult, Strategy,
};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stratum_cache::{InMemoryRemoteStore, RemoteStore, RemoteValue, StoreError, StoreUsage};

// ============================================================================
// MOCK LOADERS
// ============================================================================

/// Loader that returns `"{prefix}{key}"` and counts calls per key.
#[derive(Debug, Default)]
pub struct CountingLoader {
    prefix: String,
    delay: Option<Duration>,
    calls: AtomicUsize,
    per_key: Mutex<HashMap<String, usize>>,
}

impl CountingLoader {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// Sleep this long (on Tokio's clock) before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.per_key
            .lock()
            .map(|m| m.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Value this loader produces for `key`.
    pub fn value_for(&self, key: &str) -> Vec<u8> {
        format!("{}{}", self.prefix, key).into_bytes()
    }
}

#[async_trait]
impl Loader for CountingLoader {
    async fn load(&self, key: &str) -> Result<Vec<u8>, LoaderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut m) = self.per_key.lock() {
            *m.entry(key.to_string()).or_default() += 1;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.value_for(key))
    }
}

/// Loader that always fails.
#[derive(Debug, Default)]
pub struct FailingLoader {
    calls: AtomicUsize,
}

impl FailingLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Loader for FailingLoader {
    async fn load(&self, key: &str) -> Result<Vec<u8>, LoaderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(LoaderError::failed(key, "source of truth unavailable"))
    }
}

/// Loader whose answers can be changed between calls, e.g. to model the
/// source of truth being updated.
#[derive(Debug, Default)]
pub struct MutableLoader {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MutableLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        if let Ok(mut m) = self.values.lock() {
            m.insert(key.into(), value.into());
        }
    }
}

#[async_trait]
impl Loader for MutableLoader {
    async fn load(&self, key: &str) -> Result<Vec<u8>, LoaderError> {
        self.values
            .lock()
            .ok()
            .and_then(|m| m.get(key).cloned())
            .ok_or_else(|| LoaderError::failed(key, "no such record"))
    }
}

// ============================================================================
// MOCK STORES
// ============================================================================

/// In-process remote store that can be switched off to simulate an outage.
#[derive(Debug, Default)]
pub struct FlakyRemoteStore {
    inner: InMemoryRemoteStore,
    down: AtomicBool,
    failures: AtomicUsize,
}

impl FlakyRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Calls refused while down.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains(key)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Connection("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FlakyRemoteStore {
    async fn get(&self, key: &str) -> Result<Option<RemoteValue>, StoreError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: RemoteValue) -> Result<(), StoreError> {
        self.check()?;
        self.inner.put(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.remove(key).await
    }

    async fn scan(&self) -> Result<Vec<(String, RemoteValue)>, StoreError> {
        self.check()?;
        self.inner.scan().await
    }

    async fn clear(&self) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.clear().await
    }

    async fn usage(&self) -> Result<StoreUsage, StoreError> {
        self.inner.usage().await
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.purge_expired().await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for cache inputs.

    use proptest::prelude::*;
    use std::time::Duration;
    use stratum_core::{DataType, Strategy as CacheStrategy};

    /// Valid cache key.
    pub fn arb_key() -> impl Strategy<Value = String> {
        "[a-z]{1,8}:[a-z0-9]{1,16}"
    }

    pub fn arb_tag() -> impl Strategy<Value = String> {
        "(user|org|doc):[0-9]{1,3}"
    }

    pub fn arb_tags() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec(arb_tag(), 0..4)
    }

    pub fn arb_value() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..256)
    }

    /// Positive TTL.
    pub fn arb_ttl() -> impl Strategy<Value = Duration> {
        (1u64..86_400).prop_map(Duration::from_secs)
    }

    pub fn arb_data_type() -> impl Strategy<Value = DataType> {
        prop_oneof![
            Just(DataType::default()),
            Just(DataType::new("user_profile")),
            Just(DataType::new("session")),
            "[a-z_]{1,12}".prop_map(DataType::new),
        ]
    }

    /// Caching strategy with bounds the config validator accepts.
    pub fn arb_strategy() -> impl Strategy<Value = CacheStrategy> {
        (1u64..86_400, 0.05f64..0.95, any::<bool>()).prop_map(|(ttl, threshold, compress)| {
            CacheStrategy {
                base_ttl_secs: ttl,
                prefetch_threshold: threshold,
                compress,
                ..CacheStrategy::default()
            }
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built configurations and systems.

    use super::*;

    /// Default configuration with short background intervals.
    pub fn fast_config() -> StratumConfig {
        let mut config = StratumConfig::default();
        config.strategy.analysis_interval_secs = 1;
        config.strategy.tuning_interval_secs = 1;
        config.strategy.tuning_min_samples = 5;
        config.monitor.check_interval_secs = 1;
        config.monitor.bucket_secs = 1;
        config.monitor.retained_buckets = 120;
        config.monitor.thresholds.min_requests = 5;
        config
    }

    /// Memory and distributed tiers only.
    pub fn two_tier_config() -> StratumConfig {
        let mut config = fast_config();
        config.tiers.order = vec!["memory".to_string(), "distributed".to_string()];
        config
    }

    /// Memory and distributed tiers over a store the test controls.
    pub fn two_tier_system(store: Arc<FlakyRemoteStore>) -> CacheSystem {
        CacheSystem::builder(two_tier_config())
            .distributed_store(store)
            .build()
            .expect("two-tier config is valid")
    }

    /// Every tier, with `loader` registered for keys starting with `prefix`.
    pub fn full_system(prefix: &str, loader: Arc<dyn Loader>) -> CacheSystem {
        CacheSystem::builder(fast_config())
            .loader(prefix, loader)
            .build()
            .expect("default config is valid")
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for cache reads.

    use super::*;

    /// Assert a fresh hit served by `tier`.
    #[track_caller]
    pub fn assert_hit(read: &CacheRead, tier: &str) {
        assert!(read.is_hit(), "expected a hit, got {:?}", read);
        assert_eq!(read.served_by(), Some(tier), "served by the wrong tier");
    }

    /// Assert the value came from the loader.
    #[track_caller]
    pub fn assert_loaded(read: &CacheRead) {
        assert_eq!(read.source(), &ReadSource::Loader, "expected a loaded value, got {:?}", read);
    }

    #[track_caller]
    pub fn assert_loader_failure<T: std::fmt::Debug>(result: &StratumResult<T>) {
        match result {
            Err(StratumError::Loader(_)) => {}
            other => panic!("Expected loader error, got: {:?}", other),
        }
    }
}
