//! Network tiers (distributed and edge) over a pluggable byte store.
//!
//! A [`RemoteTier`] wraps any [`RemoteStore`] with the entry codec, a per-call
//! timeout and a circuit breaker. The distributed and edge tiers differ only
//! in name, TTL scale and breaker/timeout settings.

use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use stratum_core::{
    CacheEntry, CacheStats, CircuitState, RemoteTierConfig, TierError, TierResult,
    TIER_DISTRIBUTED, TIER_EDGE,
};

use super::{CacheTier, TierCounters};
use crate::circuit::CircuitBreaker;
use crate::codec::EntryCodec;

/// Errors reported by a backing store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Stored bytes with the lifetime they have left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteValue {
    pub bytes: Vec<u8>,
    pub ttl: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreUsage {
    pub entries: u64,
    pub bytes: u64,
}

/// Byte store behind a network tier. Real clients (Redis, a CDN KV, ...)
/// implement this; [`InMemoryRemoteStore`] is the in-process implementation.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<RemoteValue>, StoreError>;

    async fn put(&self, key: &str, value: RemoteValue) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// All live keys and values.
    async fn scan(&self) -> Result<Vec<(String, RemoteValue)>, StoreError>;

    async fn clear(&self) -> Result<u64, StoreError>;

    async fn usage(&self) -> Result<StoreUsage, StoreError>;

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        Ok(0)
    }
}

/// Process-local store with TTL expiry and optional simulated latency.
#[derive(Debug, Default)]
pub struct InMemoryRemoteStore {
    entries: DashMap<String, (Vec<u8>, Instant)>,
    latency: Option<Duration>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long on every call, to model network round trips.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = crate::now();
        self.entries
            .get(key)
            .is_some_and(|e| e.value().1 > now)
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn get(&self, key: &str) -> Result<Option<RemoteValue>, StoreError> {
        self.delay().await;
        let now = crate::now();
        let live = self.entries.get(key).and_then(|e| {
            let (bytes, expires_at) = e.value();
            (*expires_at > now).then(|| RemoteValue {
                bytes: bytes.clone(),
                ttl: expires_at.saturating_duration_since(now),
            })
        });
        if live.is_none() {
            self.entries.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        }
        Ok(live)
    }

    async fn put(&self, key: &str, value: RemoteValue) -> Result<(), StoreError> {
        self.delay().await;
        let expires_at = crate::now() + value.ttl;
        self.entries.insert(key.to_string(), (value.bytes, expires_at));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        self.delay().await;
        Ok(self.entries.remove(key).is_some())
    }

    async fn scan(&self) -> Result<Vec<(String, RemoteValue)>, StoreError> {
        self.delay().await;
        let now = crate::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.value().1 > now)
            .map(|e| {
                let (bytes, expires_at) = e.value();
                (
                    e.key().clone(),
                    RemoteValue {
                        bytes: bytes.clone(),
                        ttl: expires_at.saturating_duration_since(now),
                    },
                )
            })
            .collect())
    }

    async fn clear(&self) -> Result<u64, StoreError> {
        self.delay().await;
        let removed = self.entries.len() as u64;
        self.entries.clear();
        Ok(removed)
    }

    async fn usage(&self) -> Result<StoreUsage, StoreError> {
        let mut usage = StoreUsage::default();
        for e in self.entries.iter() {
            usage.entries += 1;
            usage.bytes += e.value().0.len() as u64;
        }
        Ok(usage)
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = crate::now();
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
        Ok((before - self.entries.len()) as u64)
    }
}

/// Distributed or edge tier.
pub struct RemoteTier {
    name: String,
    store: Arc<dyn RemoteStore>,
    codec: Arc<EntryCodec>,
    breaker: CircuitBreaker,
    call_timeout: Duration,
    ttl_scale: f64,
    counters: TierCounters,
}

impl RemoteTier {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn RemoteStore>,
        codec: Arc<EntryCodec>,
        config: &RemoteTierConfig,
        stats_window: Duration,
    ) -> Self {
        let name = name.into();
        Self {
            breaker: CircuitBreaker::new(name.clone(), &config.breaker),
            name,
            store,
            codec,
            call_timeout: config.call_timeout(),
            ttl_scale: config.ttl_scale,
            counters: TierCounters::new(stats_window),
        }
    }

    /// Shared tier that absorbs most misses.
    pub fn distributed(
        store: Arc<dyn RemoteStore>,
        codec: Arc<EntryCodec>,
        config: &RemoteTierConfig,
        stats_window: Duration,
    ) -> Self {
        Self::new(TIER_DISTRIBUTED, store, codec, config, stats_window)
    }

    /// Long-TTL, read-optimized tier for broadly shared data.
    pub fn edge(
        store: Arc<dyn RemoteStore>,
        codec: Arc<EntryCodec>,
        config: &RemoteTierConfig,
        stats_window: Duration,
    ) -> Self {
        Self::new(TIER_EDGE, store, codec, config, stats_window)
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run one store call behind the breaker and the per-call timeout.
    async fn call<T, F>(&self, op: &'static str, fut: F) -> TierResult<T>
    where
        F: Future<Output = Result<T, StoreError>> + Send,
    {
        if !self.breaker.is_allowed() {
            self.counters.error();
            return Err(TierError::CircuitOpen {
                tier: self.name.clone(),
            });
        }

        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(value)) => {
                self.breaker.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.breaker.record_failure();
                self.counters.error();
                tracing::debug!(tier = %self.name, op, error = %e, "Store call failed");
                Err(TierError::Unavailable {
                    tier: self.name.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                self.breaker.record_failure();
                self.counters.error();
                tracing::debug!(tier = %self.name, op, timeout_ms = self.call_timeout.as_millis() as u64, "Store call timed out");
                Err(TierError::Timeout {
                    tier: self.name.clone(),
                    timeout: self.call_timeout,
                })
            }
        }
    }

    fn decode(&self, key: &str, value: &RemoteValue) -> Option<CacheEntry> {
        match self.codec.decode(key, &value.bytes, value.ttl, crate::now()) {
            Ok(entry) => Some(entry.with_origin(self.name.clone())),
            Err(e) => {
                tracing::warn!(tier = %self.name, key, error = %e, "Undecodable entry evicted");
                None
            }
        }
    }
}

#[async_trait]
impl CacheTier for RemoteTier {
    fn name(&self) -> &str {
        &self.name
    }

    fn ttl_scale(&self) -> f64 {
        self.ttl_scale
    }

    fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    async fn get(&self, key: &str) -> TierResult<Option<CacheEntry>> {
        let Some(value) = self.call("get", self.store.get(key)).await? else {
            self.counters.miss();
            return Ok(None);
        };

        match self.decode(key, &value) {
            Some(entry) => {
                self.counters.hit();
                Ok(Some(entry))
            }
            None => {
                if let Err(e) = self.call("remove", self.store.remove(key)).await {
                    tracing::debug!(tier = %self.name, key, error = %e, "Failed to evict corrupt entry");
                }
                self.counters.miss();
                Ok(None)
            }
        }
    }

    async fn set(&self, entry: CacheEntry) -> TierResult<()> {
        let now = crate::now();
        let ttl = entry.remaining_ttl(now);
        if ttl.is_zero() {
            return Ok(());
        }
        let bytes = self.codec.encode(&entry, now).map_err(|e| {
            tracing::warn!(tier = %self.name, key = %entry.key, error = %e, "Failed to encode entry");
            TierError::Unavailable {
                tier: self.name.clone(),
                reason: e.to_string(),
            }
        })?;
        self.call("put", self.store.put(&entry.key, RemoteValue { bytes, ttl }))
            .await
    }

    async fn delete(&self, key: &str) -> TierResult<bool> {
        self.call("remove", self.store.remove(key)).await
    }

    async fn clear(&self, tags: &[String]) -> TierResult<u64> {
        if tags.is_empty() {
            return self.call("clear", self.store.clear()).await;
        }

        let entries = self.call("scan", self.store.scan()).await?;
        let mut removed = 0u64;
        for (key, value) in entries {
            let matches = match self.codec.tags_of(&key, &value.bytes) {
                Ok(entry_tags) => tags.iter().any(|t| entry_tags.contains(t)),
                // unreadable entries cannot be served anyway
                Err(_) => true,
            };
            if matches && self.call("remove", self.store.remove(&key)).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn stats(&self) -> CacheStats {
        let usage = match tokio::time::timeout(self.call_timeout, self.store.usage()).await {
            Ok(Ok(usage)) => usage,
            _ => StoreUsage::default(),
        };
        self.counters.snapshot(usage.entries, usage.bytes)
    }

    async fn export(&self) -> TierResult<Vec<CacheEntry>> {
        let entries = self.call("scan", self.store.scan()).await?;
        Ok(entries
            .iter()
            .filter_map(|(key, value)| self.decode(key, value))
            .collect())
    }

    async fn purge_expired(&self) -> TierResult<u64> {
        self.call("purge", self.store.purge_expired()).await
    }
}
