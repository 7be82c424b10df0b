//! STRATUM Core - Cache Data Model
//!
//! Plain data types shared by every stratum crate: entries, statistics,
//! access patterns, alerts, configuration and the error taxonomy.
//! No async runtime and no cache behavior lives here.

pub mod alert;
pub mod config;
pub mod constants;
pub mod entry;
pub mod error;
pub mod health;
pub mod pattern;
pub mod stats;

pub use alert::{Alert, AlertLevel, AlertMetric, AlertState};
pub use config::{
    AlertThresholds, BreakerConfig, CoordinatorConfig, MemoryTierConfig, MonitorConfig,
    RemoteTierConfig, StrategyManagerConfig, StratumConfig, Strategy, TiersConfig,
    WarmupSchedule, WorkerConfig, TIER_COMPUTE, TIER_DISTRIBUTED, TIER_EDGE, TIER_MEMORY,
};
pub use entry::{validate_key, validate_ttl, CacheEntry, DataType};
pub use error::{
    ConfigError, LoaderError, SerializationError, StratumError, StratumResult, TierError,
    TierResult, ValidationError,
};
pub use health::{CircuitState, HealthStatus};
pub use pattern::{AccessClass, AccessPattern};
pub use stats::{CacheStats, LatencyPercentiles, PerformanceSnapshot, TierSnapshot};
