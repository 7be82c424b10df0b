//! STRATUM Cache - Multi-Tier Cache Engine
//!
//! Coordinates an ordered set of cache tiers (in-process LRU, distributed,
//! edge, compute fallback) behind a single read/write API, with an adaptive
//! strategy manager that tunes TTLs and prefetching from observed access
//! patterns and a performance monitor that aggregates metrics and raises
//! alerts.
//!
//! Start with [`CacheSystem::builder`] for the fully wired system, or build a
//! [`MultiLevelCacheCoordinator`] by hand from individual tiers.

pub mod circuit;
pub mod codec;
pub mod coordinator;
pub mod loader;
pub mod monitor;
pub mod read;
pub mod strategy;
pub mod system;
pub mod telemetry;
pub mod tier;
pub mod worker;

pub use circuit::CircuitBreaker;
pub use codec::EntryCodec;
pub use coordinator::{
    CoordinatorStats, ExportRecord, GetOptions, ImportFailure, ImportReport,
    MultiLevelCacheCoordinator, SetOptions, TierFilter, WarmupReport,
};
pub use loader::{loader_fn, Loader};
pub use monitor::{
    AlertCheck, MetricEvent, PerformanceMonitor, PerformanceReport, TierOutcome, Trend,
    WindowMetrics,
};
pub use read::{CacheRead, ReadSource};
pub use strategy::{AnalysisOutcome, StrategyManager, TuningChange, WarmupTarget};
pub use system::{CacheSystem, CacheSystemBuilder};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
pub use tier::{
    CacheTier, ComputeFallbackTier, InMemoryRemoteStore, LoaderRegistry, MemoryTier, RemoteStore,
    RemoteTier, RemoteValue, StoreError, StoreUsage,
};
pub use worker::{PoolSnapshot, WorkerPool};

pub use stratum_core::*;

/// Monotonic clock shared by every component. Follows Tokio's clock so
/// paused-time tests drive expiry and analysis deterministically.
pub(crate) fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}
