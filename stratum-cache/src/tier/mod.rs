//! Cache tier contract and the built-in tier variants.
//!
//! Every tier implements [`CacheTier`]. The coordinator holds an ordered list
//! of `Arc<dyn CacheTier>` and never branches on a concrete tier type; new
//! tiers are added by implementing the trait.

mod compute;
mod memory;
mod remote;

pub use compute::{ComputeFallbackTier, LoaderRegistry};
pub use memory::MemoryTier;
pub use remote::{InMemoryRemoteStore, RemoteStore, RemoteTier, RemoteValue, StoreError, StoreUsage};

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use stratum_core::{CacheEntry, CacheStats, CircuitState, DataType, TierResult};

use crate::loader::Loader;

/// Uniform storage contract implemented by every tier variant.
///
/// # Errors
///
/// Tier errors are absorbed by the coordinator and treated as a miss for
/// that tier only; they never reach a caller directly.
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Stable tier name, used in stats, alerts and the export format.
    fn name(&self) -> &str;

    /// Factor applied to the strategy TTL when this tier is populated.
    fn ttl_scale(&self) -> f64 {
        1.0
    }

    /// Circuit state for network tiers. Local tiers are always closed.
    fn circuit_state(&self) -> CircuitState {
        CircuitState::Closed
    }

    /// Source-of-truth fallback. Only compute tiers provide one.
    fn fallback(&self) -> Option<&dyn Loader> {
        None
    }

    /// Whether this tier actually stores entries.
    fn is_storage(&self) -> bool {
        self.fallback().is_none()
    }

    /// Fresh entry for `key`, or `None` on miss or expiry.
    async fn get(&self, key: &str) -> TierResult<Option<CacheEntry>>;

    /// Expired entry still inside the tier's stale grace period.
    async fn get_stale(&self, _key: &str) -> TierResult<Option<CacheEntry>> {
        Ok(None)
    }

    /// Insert or replace an entry. Lifetime comes from `entry.expires_at`.
    async fn set(&self, entry: CacheEntry) -> TierResult<()>;

    /// Remove `key`. Returns whether it was present.
    async fn delete(&self, key: &str) -> TierResult<bool>;

    /// Remove entries whose tags intersect `tags`; everything when empty.
    async fn clear(&self, tags: &[String]) -> TierResult<u64>;

    async fn stats(&self) -> CacheStats;

    /// Live (unexpired) entries, for backup and migration.
    async fn export(&self) -> TierResult<Vec<CacheEntry>> {
        Ok(Vec::new())
    }

    /// Drop every expired entry. Returns the number removed.
    async fn purge_expired(&self) -> TierResult<u64> {
        Ok(0)
    }

    /// Evictions per data type since the last call.
    fn take_evictions(&self) -> Vec<(DataType, u64)> {
        Vec::new()
    }
}

/// Hit/miss/eviction/error counters that reset when the collection window rolls over.
#[derive(Debug)]
pub struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    errors: AtomicU64,
    window: Duration,
    window_start: Mutex<std::time::Instant>,
}

impl TierCounters {
    pub fn new(window: Duration) -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            window,
            window_start: Mutex::new(crate::now()),
        }
    }

    fn roll(&self) {
        let now = crate::now();
        if let Ok(mut start) = self.window_start.lock() {
            if now.saturating_duration_since(*start) >= self.window {
                *start = now;
                self.hits.store(0, Ordering::Relaxed);
                self.misses.store(0, Ordering::Relaxed);
                self.evictions.store(0, Ordering::Relaxed);
                self.errors.store(0, Ordering::Relaxed);
            }
        }
    }

    pub fn hit(&self) {
        self.roll();
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn miss(&self) {
        self.roll();
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn evicted(&self, count: u64) {
        self.roll();
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.roll();
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Counters for the current window plus the given gauges.
    pub fn snapshot(&self, entry_count: u64, total_size_bytes: u64) -> CacheStats {
        self.roll();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            entry_count,
            total_size_bytes,
        }
    }
}
