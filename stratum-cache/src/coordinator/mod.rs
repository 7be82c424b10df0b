//! Multi-level cache coordinator
//!
//! Reads probe the storage tiers in configured order. A hit at a slower tier
//! queues a backfill of the faster ones; a miss everywhere runs the loader
//! once per key (single-flight) and writes the result through every tier
//! before any waiter sees it. Writes land synchronously in the fastest tier
//! and propagate to the others through the bounded worker pool.

mod health;
mod manage;

pub use health::TierHealthTracker;
pub use manage::{ExportRecord, ImportFailure, ImportReport, TierFilter};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use futures_util::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use stratum_core::{
    validate_key, validate_ttl, CacheEntry, CacheStats, ConfigError, CoordinatorConfig, DataType,
    HealthStatus, LoaderError, SerializationError, StratumError, StratumResult, TierError,
    TierSnapshot, WorkerConfig,
};

use crate::loader::Loader;
use crate::monitor::{MetricEvent, PerformanceMonitor, TierOutcome};
use crate::read::CacheRead;
use crate::strategy::{StrategyManager, WarmupTarget};
use crate::tier::CacheTier;
use crate::worker::{PoolSnapshot, SubmitError, WorkerPool};

/// Concurrent loads issued by one warmup call.
const WARMUP_CONCURRENCY: usize = 16;

type SharedLoad = Shared<BoxFuture<'static, StratumResult<CacheRead>>>;

/// Per-call options for [`MultiLevelCacheCoordinator::get`].
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Data type used to pick the strategy when the value has to be loaded.
    pub data_type: DataType,
    /// Tags attached to a loaded value.
    pub tags: Vec<String>,
    /// Explicit TTL for a loaded value, used verbatim for every tier.
    pub ttl: Option<Duration>,
    /// Overrides `serve_stale_on_error` for this call.
    pub serve_stale: Option<bool>,
}

impl GetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_type(mut self, data_type: impl Into<DataType>) -> Self {
        self.data_type = data_type.into();
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn serve_stale(mut self, serve_stale: bool) -> Self {
        self.serve_stale = Some(serve_stale);
        self
    }
}

/// Per-call options for [`MultiLevelCacheCoordinator::set`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub data_type: DataType,
    pub tags: Vec<String>,
    /// Explicit TTL, used verbatim for every tier. Adaptive when `None`.
    pub ttl: Option<Duration>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_type(mut self, data_type: impl Into<DataType>) -> Self {
        self.data_type = data_type.into();
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Per-tier stats plus the combined view over storage tiers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorStats {
    pub per_tier: Vec<TierSnapshot>,
    pub combined: CacheStats,
    pub queue_depth: usize,
    pub background_completed: u64,
    pub background_rejected: u64,
    pub dropped_backfills: u64,
    pub in_flight_loads: usize,
}

/// Outcome of a warmup call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WarmupReport {
    pub requested: usize,
    pub warmed: usize,
    pub failed: Vec<(String, StratumError)>,
}

/// Which tiers a load writes through to.
#[derive(Debug, Clone, Default)]
struct Fill {
    filter: TierFilter,
    skip_degraded: bool,
    /// Probe the tiers again after winning the flight slot.
    recheck: bool,
}

#[derive(Debug)]
struct PendingWrite {
    version: u64,
    tags: BTreeSet<String>,
}

struct Inner {
    tiers: Vec<Arc<dyn CacheTier>>,
    health: Vec<TierHealthTracker>,
    config: CoordinatorConfig,
    strategy: Arc<StrategyManager>,
    monitor: Arc<PerformanceMonitor>,
    pool: WorkerPool,
    in_flight: DashMap<String, SharedLoad>,
    pending: DashMap<String, PendingWrite>,
    backfills: DashMap<String, PendingWrite>,
    versions: AtomicU64,
    dropped_backfills: AtomicU64,
    shut_down: AtomicBool,
}

/// Orchestrates reads and writes across an ordered list of tiers.
///
/// Cheap to clone; clones share the same tiers and bookkeeping.
#[derive(Clone)]
pub struct MultiLevelCacheCoordinator {
    inner: Arc<Inner>,
}

impl MultiLevelCacheCoordinator {
    /// Build a coordinator over `tiers`, fastest first.
    ///
    /// Must be called inside a Tokio runtime: the worker pool is spawned here.
    pub fn new(
        tiers: Vec<Arc<dyn CacheTier>>,
        config: CoordinatorConfig,
        workers: &WorkerConfig,
        strategy: Arc<StrategyManager>,
        monitor: Arc<PerformanceMonitor>,
    ) -> StratumResult<Self> {
        if !tiers.iter().any(|t| t.is_storage()) {
            return Err(ConfigError::MissingRequired {
                field: "tiers.order (at least one storage tier)".to_string(),
            }
            .into());
        }
        let health = tiers
            .iter()
            .map(|t| {
                monitor.register_tier(t.name());
                TierHealthTracker::new(config.tier_error_window, config.tier_degraded_error_rate)
            })
            .collect();

        tracing::info!(
            tiers = ?tiers.iter().map(|t| t.name()).collect::<Vec<_>>(),
            workers = workers.workers,
            queue_capacity = workers.queue_capacity,
            "Cache coordinator initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                tiers,
                health,
                pool: WorkerPool::new(workers.workers, workers.queue_capacity),
                config,
                strategy,
                monitor,
                in_flight: DashMap::new(),
                pending: DashMap::new(),
                backfills: DashMap::new(),
                versions: AtomicU64::new(0),
                dropped_backfills: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn tier_names(&self) -> Vec<String> {
        self.inner.tiers.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn strategy(&self) -> &Arc<StrategyManager> {
        &self.inner.strategy
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.inner.monitor
    }

    fn ensure_running(&self) -> StratumResult<()> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(StratumError::ShutDown);
        }
        Ok(())
    }

    // ========================================================================
    // Core API
    // ========================================================================

    /// Read `key`, loading it on a total miss.
    ///
    /// `loader` takes precedence over loaders registered on a compute tier.
    ///
    /// # Errors
    ///
    /// Invalid keys or TTLs, and loader failures when no stale copy could be
    /// served. Tier failures are absorbed.
    pub async fn get(
        &self,
        key: &str,
        loader: Option<Arc<dyn Loader>>,
        opts: &GetOptions,
    ) -> StratumResult<CacheRead> {
        self.ensure_running()?;
        validate_key(key)?;
        if let Some(ttl) = opts.ttl {
            validate_ttl(ttl)?;
        }

        let inner = &self.inner;
        let started = crate::now();
        let result = match inner.probe(key).await {
            Some((idx, entry)) => {
                inner.schedule_backfill(idx, &entry);
                Ok(CacheRead::hit(entry, inner.tiers[idx].name()))
            }
            None => {
                let fill = Fill {
                    recheck: true,
                    ..Fill::default()
                };
                inner.load_shared(key, loader, opts, fill).await
            }
        };

        let (hit, stale) = match &result {
            Ok(read) => (read.is_hit(), read.is_stale()),
            Err(_) => (false, false),
        };
        let data_type = match &result {
            Ok(read) => read.data_type().clone(),
            Err(_) => opts.data_type.clone(),
        };
        inner.strategy.record_access(key, &data_type, hit, started);
        inner.monitor.record(MetricEvent::Request {
            hit,
            stale,
            failed: result.is_err(),
            latency: crate::now().saturating_duration_since(started),
        });
        result
    }

    /// Write `value` to the fastest tier now and to the others in the background.
    pub async fn set(&self, key: &str, value: Vec<u8>, opts: &SetOptions) -> StratumResult<()> {
        self.ensure_running()?;
        validate_key(key)?;
        if let Some(ttl) = opts.ttl {
            validate_ttl(ttl)?;
        }

        let inner = &self.inner;
        let now = crate::now();
        let version = inner.next_version();
        let entry = inner.build_entry(key, value, &opts.data_type, &opts.tags, opts.ttl, version, now);

        inner.backfills.remove(key);
        inner.pending.insert(
            key.to_string(),
            PendingWrite {
                version,
                tags: entry.tags.clone(),
            },
        );

        let mut writes = inner.plan_writes(&entry, opts.ttl.is_some(), &Fill::default()).into_iter();
        if let Some(first) = writes.next() {
            inner.write_entries(vec![first]).await;
        }

        let rest: Vec<(usize, CacheEntry)> = writes.collect();
        if rest.is_empty() {
            inner.finish_pending(key, version);
        } else {
            let task = Arc::clone(inner)
                .write_back(key.to_string(), version, rest)
                .boxed();
            match inner.pool.try_submit(task) {
                Ok(()) => inner
                    .monitor
                    .record(MetricEvent::QueueDepth(inner.pool.queue_depth())),
                Err(SubmitError::Full(task)) => {
                    tracing::debug!(key, "Worker queue full, propagating write synchronously");
                    task.await;
                }
                Err(SubmitError::Closed(task)) => task.await,
            }
        }

        inner.strategy.record_update(&opts.data_type, now);
        inner.strategy.record_fill(key, &opts.data_type, now);
        Ok(())
    }

    /// Remove `key` from every tier. Returns whether any tier held it.
    pub async fn delete(&self, key: &str) -> StratumResult<bool> {
        self.ensure_running()?;
        validate_key(key)?;

        let inner = &self.inner;
        inner.pending.remove(key);
        inner.backfills.remove(key);

        let calls = inner.storage().map(|(idx, tier)| async move {
            let started = crate::now();
            (idx, started, tier.delete(key).await)
        });
        let mut removed = false;
        for (idx, started, result) in join_all(calls).await {
            match result {
                Ok(found) => {
                    removed |= found;
                    inner.observe(idx, TierOutcome::Write, started);
                }
                Err(e) => {
                    inner.absorb(idx, key, "delete", &e);
                    inner.observe(idx, TierOutcome::Error, started);
                }
            }
        }

        inner.strategy.record_delete(key, crate::now());
        Ok(removed)
    }

    /// Remove entries whose tags intersect `tags` from every tier.
    /// Empty `tags` clears everything. Returns the number of entries removed.
    pub async fn clear(&self, tags: &[String]) -> StratumResult<u64> {
        self.ensure_running()?;
        self.inner.clear_tiers(&TierFilter::All, tags).await
    }

    /// Load `keys` ahead of demand, skipping degraded tiers.
    pub async fn warmup(&self, keys: &[String]) -> StratumResult<WarmupReport> {
        self.warmup_tiers(keys, &TierFilter::All).await
    }

    /// Warm `keys` into the tiers selected by `filter`, skipping degraded tiers.
    pub async fn warmup_tiers(&self, keys: &[String], filter: &TierFilter) -> StratumResult<WarmupReport> {
        self.ensure_running()?;
        for key in keys {
            validate_key(key)?;
        }
        self.inner.validate_filter(filter)?;

        let inner = &self.inner;
        let fill = Fill {
            filter: filter.clone(),
            skip_degraded: true,
            recheck: false,
        };
        let results: Vec<(String, StratumResult<CacheRead>)> = stream::iter(keys.iter().cloned())
            .map(|key| {
                let fill = fill.clone();
                async move {
                    let opts = GetOptions {
                        data_type: inner.strategy.data_type_of(&key).unwrap_or_default(),
                        ..GetOptions::default()
                    };
                    let result = inner.load_shared(&key, None, &opts, fill).await;
                    (key, result)
                }
            })
            .buffer_unordered(WARMUP_CONCURRENCY)
            .collect()
            .await;

        let mut report = WarmupReport {
            requested: keys.len(),
            ..WarmupReport::default()
        };
        for (key, result) in results {
            match result {
                Ok(read) if !read.is_stale() => report.warmed += 1,
                Ok(_) => report.failed.push((
                    key,
                    LoaderError::failed("warmup", "only a stale copy was available").into(),
                )),
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "Warmup failed");
                    report.failed.push((key, e));
                }
            }
        }
        Ok(report)
    }

    /// Per-tier stats and the combined view over storage tiers.
    pub async fn stats(&self) -> CoordinatorStats {
        let inner = &self.inner;
        let mut per_tier = Vec::with_capacity(inner.tiers.len());
        let mut combined = CacheStats::default();
        for (idx, tier) in inner.tiers.iter().enumerate() {
            let stats = tier.stats().await;
            if tier.is_storage() {
                combined.merge(&stats);
            }
            per_tier.push(TierSnapshot {
                tier: tier.name().to_string(),
                stats,
                degraded: inner.tier_status(idx).is_degraded(),
            });
        }
        let pool: PoolSnapshot = inner.pool.snapshot();
        CoordinatorStats {
            per_tier,
            combined,
            queue_depth: pool.queue_depth,
            background_completed: pool.completed,
            background_rejected: pool.rejected,
            dropped_backfills: inner.dropped_backfills.load(Ordering::Relaxed),
            in_flight_loads: inner.in_flight.len(),
        }
    }

    /// Current health of every tier, in tier order.
    pub fn tier_health(&self) -> Vec<(String, HealthStatus)> {
        self.inner
            .tiers
            .iter()
            .enumerate()
            .map(|(idx, t)| (t.name().to_string(), self.inner.tier_status(idx)))
            .collect()
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.pool.queue_depth()
    }

    /// Drain per-tier eviction counts into the strategy manager and monitor.
    pub fn collect_evictions(&self) -> u64 {
        let inner = &self.inner;
        let mut total = 0;
        for tier in &inner.tiers {
            let mut tier_total = 0;
            for (data_type, count) in tier.take_evictions() {
                inner.strategy.record_evictions(&data_type, count);
                tier_total += count;
            }
            if tier_total > 0 {
                tracing::debug!(tier = tier.name(), evictions = tier_total, "Evictions collected");
                inner.monitor.record(MetricEvent::Eviction {
                    tier: tier.name().to_string(),
                    count: tier_total,
                });
                total += tier_total;
            }
        }
        inner
            .monitor
            .record(MetricEvent::QueueDepth(inner.pool.queue_depth()));
        total
    }

    /// Capture a performance snapshot with current per-tier stats.
    pub async fn capture_snapshot(&self) -> stratum_core::PerformanceSnapshot {
        let stats = self.stats().await;
        self.inner.monitor.capture_snapshot(stats.per_tier)
    }

    // ========================================================================
    // Typed helpers
    // ========================================================================

    /// `get` and decode the value as JSON.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        key: &str,
        loader: Option<Arc<dyn Loader>>,
        opts: &GetOptions,
    ) -> StratumResult<T> {
        let read = self.get(key, loader, opts).await?;
        serde_json::from_slice(read.value()).map_err(|e| {
            SerializationError::Decode {
                key: key.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Encode `value` as JSON and `set` it.
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        opts: &SetOptions,
    ) -> StratumResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| SerializationError::Encode {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.set(key, bytes, opts).await
    }

    /// Stop accepting calls and wait for every queued backfill and write-back.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(queued = self.inner.pool.queue_depth(), "Draining cache background tasks");
        self.inner.pool.shutdown().await;
        tracing::info!("Cache coordinator shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }
}

#[async_trait]
impl WarmupTarget for MultiLevelCacheCoordinator {
    async fn warmup_keys(&self, keys: Vec<String>) -> usize {
        match self.warmup(&keys).await {
            Ok(report) => report.warmed,
            Err(e) => {
                tracing::debug!(error = %e, "Scheduled warmup skipped");
                0
            }
        }
    }
}

impl std::fmt::Debug for MultiLevelCacheCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiLevelCacheCoordinator")
            .field("tiers", &self.tier_names())
            .field("in_flight", &self.inner.in_flight.len())
            .field("queue_depth", &self.inner.pool.queue_depth())
            .finish()
    }
}

impl Inner {
    fn storage(&self) -> impl Iterator<Item = (usize, &Arc<dyn CacheTier>)> {
        self.tiers.iter().enumerate().filter(|(_, t)| t.is_storage())
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn tier_status(&self, idx: usize) -> HealthStatus {
        self.health[idx].status(self.tiers[idx].circuit_state())
    }

    fn validate_filter(&self, filter: &TierFilter) -> StratumResult<()> {
        if let TierFilter::Only(names) = filter {
            for name in names {
                if !self.tiers.iter().any(|t| t.name() == name) {
                    return Err(stratum_core::ValidationError::UnknownTier { tier: name.clone() }.into());
                }
            }
        }
        Ok(())
    }

    /// Record one tier call with the monitor and the tier's health tracker.
    fn observe(&self, idx: usize, outcome: TierOutcome, started: Instant) {
        let tier = &self.tiers[idx];
        self.monitor.record(MetricEvent::TierCall {
            tier: tier.name().to_string(),
            outcome,
            latency: crate::now().saturating_duration_since(started),
        });
        let ok = outcome != TierOutcome::Error;
        if let Some(status) = self.health[idx].observe(ok, tier.circuit_state()) {
            if status.is_degraded() {
                tracing::warn!(tier = tier.name(), status = %status, "Tier health changed");
            } else {
                tracing::info!(tier = tier.name(), status = %status, "Tier health changed");
            }
            self.monitor.record(MetricEvent::TierHealth {
                tier: tier.name().to_string(),
                status,
            });
        }
    }

    fn absorb(&self, idx: usize, key: &str, op: &'static str, error: &TierError) {
        let tier = self.tiers[idx].name();
        match error {
            TierError::CircuitOpen { .. } => {
                tracing::debug!(tier, key, op, "Tier short-circuited, skipping")
            }
            _ => tracing::warn!(tier, key, op, error = %error, "Tier call failed, treating as miss"),
        }
    }

    /// First fresh copy in tier order.
    async fn probe(&self, key: &str) -> Option<(usize, CacheEntry)> {
        for (idx, tier) in self.storage() {
            let started = crate::now();
            match tier.get(key).await {
                Ok(Some(entry)) => {
                    self.observe(idx, TierOutcome::Hit, started);
                    return Some((idx, entry));
                }
                Ok(None) => self.observe(idx, TierOutcome::Miss, started),
                Err(e) => {
                    self.absorb(idx, key, "get", &e);
                    self.observe(idx, TierOutcome::Error, started);
                }
            }
        }
        None
    }

    /// First expired-but-servable copy in tier order.
    async fn probe_stale(&self, key: &str) -> Option<(usize, CacheEntry)> {
        for (idx, tier) in self.storage() {
            match tier.get_stale(key).await {
                Ok(Some(entry)) => return Some((idx, entry)),
                Ok(None) => {}
                Err(e) => self.absorb(idx, key, "get_stale", &e),
            }
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn build_entry(
        &self,
        key: &str,
        value: Vec<u8>,
        data_type: &DataType,
        tags: &[String],
        ttl: Option<Duration>,
        version: u64,
        now: Instant,
    ) -> CacheEntry {
        let strategy = self.strategy.strategy_for(data_type);
        let ttl = ttl.unwrap_or_else(|| self.strategy.ttl_for(key, data_type));
        CacheEntry::new(key, value, data_type.clone(), ttl, now)
            .with_tags(tags.iter().cloned())
            .with_version(version)
            .with_transforms(strategy.compress, strategy.encrypt)
    }

    /// Per-tier copies of `entry` for every storage tier selected by `fill`.
    fn plan_writes(&self, entry: &CacheEntry, verbatim: bool, fill: &Fill) -> Vec<(usize, CacheEntry)> {
        let now = crate::now();
        let ttl = entry.ttl();
        self.storage()
            .filter(|(idx, tier)| {
                fill.filter.matches(tier.name())
                    && !(fill.skip_degraded && self.tier_status(*idx).is_degraded())
            })
            .map(|(idx, tier)| {
                let tier_ttl = if verbatim {
                    ttl
                } else {
                    self.strategy.tier_ttl(ttl, tier.ttl_scale())
                };
                (idx, entry.retimed(tier_ttl, now))
            })
            .collect()
    }

    /// Write entries concurrently, absorbing tier failures.
    async fn write_entries(&self, writes: Vec<(usize, CacheEntry)>) {
        let calls = writes.into_iter().map(|(idx, entry)| async move {
            let key = entry.key.clone();
            let started = crate::now();
            (idx, key, started, self.tiers[idx].set(entry).await)
        });
        for (idx, key, started, result) in join_all(calls).await {
            match result {
                Ok(()) => self.observe(idx, TierOutcome::Write, started),
                Err(e) => {
                    self.absorb(idx, &key, "set", &e);
                    self.observe(idx, TierOutcome::Error, started);
                }
            }
        }
    }

    fn is_current(&self, key: &str, version: u64) -> bool {
        holds(&self.pending, key, version)
    }

    fn finish_pending(&self, key: &str, version: u64) {
        self.pending.remove_if(key, |_, p| p.version == version);
    }

    /// Propagate a write to slower tiers unless a later write, delete or
    /// clear superseded it.
    async fn write_back(self: Arc<Self>, key: String, version: u64, writes: Vec<(usize, CacheEntry)>) {
        for write in writes {
            if !self.is_current(&key, version) {
                tracing::debug!(key = %key, version, "Superseded write-back skipped");
                return;
            }
            self.write_entries(vec![write]).await;
        }
        self.finish_pending(&key, version);
    }

    /// Backfill tiers faster than `hit_idx` through the worker pool. The copy
    /// never outlives the entry it was read from.
    fn schedule_backfill(self: &Arc<Self>, hit_idx: usize, entry: &CacheEntry) {
        let now = crate::now();
        let remaining = entry.remaining_ttl(now);
        if remaining.is_zero() {
            return;
        }
        let base = self.strategy.ttl_for(&entry.key, &entry.data_type);
        let writes: Vec<(usize, CacheEntry)> = self
            .storage()
            .filter(|(idx, _)| *idx < hit_idx)
            .map(|(idx, tier)| {
                let ttl = self.strategy.tier_ttl(base, tier.ttl_scale()).min(remaining);
                (idx, entry.retimed(ttl, now))
            })
            .collect();
        if writes.is_empty() {
            return;
        }

        let stamp = self.next_version();
        self.backfills.insert(
            entry.key.clone(),
            PendingWrite {
                version: stamp,
                tags: entry.tags.clone(),
            },
        );
        let task = Arc::clone(self)
            .backfill(entry.key.clone(), stamp, writes)
            .boxed();
        match self.pool.try_submit(task) {
            Ok(()) => self
                .monitor
                .record(MetricEvent::QueueDepth(self.pool.queue_depth())),
            Err(SubmitError::Full(_)) => {
                self.backfills.remove_if(&entry.key, |_, p| p.version == stamp);
                self.dropped_backfills.fetch_add(1, Ordering::Relaxed);
                self.monitor.record(MetricEvent::BackgroundDropped);
                tracing::debug!(key = %entry.key, "Worker queue full, backfill dropped");
            }
            Err(SubmitError::Closed(_)) => {
                self.backfills.remove_if(&entry.key, |_, p| p.version == stamp);
            }
        }
    }

    /// Copy a hit into faster tiers unless a write, delete or clear of the
    /// key happened after the hit.
    async fn backfill(self: Arc<Self>, key: String, stamp: u64, writes: Vec<(usize, CacheEntry)>) {
        if holds(&self.backfills, &key, stamp) {
            self.write_entries(writes).await;
        } else {
            tracing::debug!(key = %key, "Superseded backfill skipped");
        }
        self.backfills.remove_if(&key, |_, p| p.version == stamp);
    }

    /// Serve a copy written since this caller's first probe.
    async fn recheck(self: &Arc<Self>, key: &str) -> Option<CacheRead> {
        let (idx, entry) = self.probe(key).await?;
        self.schedule_backfill(idx, &entry);
        Some(CacheRead::hit(entry, self.tiers[idx].name()))
    }

    /// Join the in-flight load for `key`, or start one.
    async fn load_shared(
        self: &Arc<Self>,
        key: &str,
        loader: Option<Arc<dyn Loader>>,
        opts: &GetOptions,
        fill: Fill,
    ) -> StratumResult<CacheRead> {
        let shared = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(flight) => flight.get().clone(),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                let cancelled = key.to_string();
                let shared = async move {
                    rx.await.unwrap_or_else(|_| {
                        Err(LoaderError::Cancelled { key: cancelled }.into())
                    })
                }
                .boxed()
                .shared();
                slot.insert(shared.clone());

                // the load runs detached so a cancelled caller cannot strand the waiters
                let inner = Arc::clone(self);
                let key = key.to_string();
                let opts = opts.clone();
                tokio::spawn(async move {
                    let flight = FlightGuard {
                        inner: Arc::clone(&inner),
                        key: key.clone(),
                    };
                    let rechecked = if fill.recheck {
                        inner.recheck(&key).await
                    } else {
                        None
                    };
                    let result = match rechecked {
                        Some(read) => Ok(read),
                        None => inner.load_and_fill(&key, loader, &opts, &fill).await,
                    };
                    // later callers start a fresh load; current waiters still get this result
                    drop(flight);
                    let _ = tx.send(result);
                });
                shared
            }
        };
        shared.await
    }

    async fn load_and_fill(
        &self,
        key: &str,
        loader: Option<Arc<dyn Loader>>,
        opts: &GetOptions,
        fill: &Fill,
    ) -> StratumResult<CacheRead> {
        match self.invoke_loader(key, loader).await {
            Ok(value) => {
                let now = crate::now();
                let version = self.next_version();
                let entry = self.build_entry(key, value, &opts.data_type, &opts.tags, opts.ttl, version, now);
                let writes = self.plan_writes(&entry, opts.ttl.is_some(), fill);
                self.write_entries(writes).await;
                self.strategy.record_fill(key, &opts.data_type, now);
                tracing::debug!(key, version, "Loaded and written through");
                Ok(CacheRead::loaded(entry))
            }
            Err(e) => {
                if opts.serve_stale.unwrap_or(self.config.serve_stale_on_error) {
                    if let Some((idx, entry)) = self.probe_stale(key).await {
                        let tier = self.tiers[idx].name();
                        tracing::warn!(key, tier, error = %e, "Loader failed, serving stale copy");
                        return Ok(CacheRead::stale(entry, tier));
                    }
                }
                tracing::warn!(key, error = %e, "Loader failed");
                Err(e.into())
            }
        }
    }

    /// Call the per-call loader, else the first compute tier with a loader for `key`.
    async fn invoke_loader(&self, key: &str, loader: Option<Arc<dyn Loader>>) -> Result<Vec<u8>, LoaderError> {
        let timeout = self.config.loader_timeout();
        if let Some(loader) = loader {
            return with_timeout(key, timeout, loader.load(key)).await;
        }
        for tier in &self.tiers {
            let Some(fallback) = tier.fallback() else {
                continue;
            };
            match with_timeout(key, timeout, fallback.load(key)).await {
                Err(LoaderError::NoLoader { .. }) => continue,
                other => return other,
            }
        }
        Err(LoaderError::NoLoader {
            key: key.to_string(),
        })
    }

    async fn clear_tiers(&self, filter: &TierFilter, tags: &[String]) -> StratumResult<u64> {
        self.validate_filter(filter)?;
        let survives = |p: &PendingWrite| !tags.is_empty() && !tags.iter().any(|t| p.tags.contains(t));
        self.pending.retain(|_, p| survives(p));
        self.backfills.retain(|_, p| survives(p));

        let calls = self
            .storage()
            .filter(|(_, tier)| filter.matches(tier.name()))
            .map(|(idx, tier)| async move {
                let started = crate::now();
                (idx, started, tier.clear(tags).await)
            });
        let mut removed = 0;
        for (idx, started, result) in join_all(calls).await {
            match result {
                Ok(n) => {
                    removed += n;
                    self.observe(idx, TierOutcome::Write, started);
                }
                Err(e) => {
                    self.absorb(idx, "*", "clear", &e);
                    self.observe(idx, TierOutcome::Error, started);
                }
            }
        }
        tracing::info!(tags = ?tags, removed, "Cache cleared");
        Ok(removed)
    }
}

fn holds(map: &DashMap<String, PendingWrite>, key: &str, version: u64) -> bool {
    map.get(key).is_some_and(|p| p.version == version)
}

/// Removes the in-flight slot when the load finishes or its task unwinds.
struct FlightGuard {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.remove(&self.key);
    }
}

async fn with_timeout<F>(key: &str, timeout: Duration, fut: F) -> Result<Vec<u8>, LoaderError>
where
    F: Future<Output = Result<Vec<u8>, LoaderError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or_else(|_| {
            Err(LoaderError::Timeout {
                key: key.to_string(),
                timeout,
            })
        })
}
