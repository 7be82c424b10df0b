//! Configuration types
//!
//! Loaded once at process start: built-in defaults, then an optional TOML
//! document, then `STRATUM_*` environment overrides. [`StratumConfig::validate`]
//! rejects bad definitions before any cache component is constructed.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::constants::*;
use crate::entry::DataType;
use crate::error::ConfigError;

/// Well-known tier names used in `tiers.order`.
pub const TIER_MEMORY: &str = "memory";
pub const TIER_DISTRIBUTED: &str = "distributed";
pub const TIER_EDGE: &str = "edge";
pub const TIER_COMPUTE: &str = "compute";

const KNOWN_TIERS: [&str; 4] = [TIER_MEMORY, TIER_DISTRIBUTED, TIER_EDGE, TIER_COMPUTE];

/// Periodic warmup of a fixed key set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupSchedule {
    pub interval_secs: u64,
    pub keys: Vec<String>,
}

/// Caching policy for one data type.
///
/// Created at configuration load and afterwards mutated only by the
/// strategy manager's tuning loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Strategy {
    pub base_ttl_secs: u64,
    /// Minimum access score (0.0 - 1.0) required to prefetch a key.
    pub prefetch_threshold: f64,
    pub compress: bool,
    pub encrypt: bool,
    pub warmup: Option<WarmupSchedule>,
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            base_ttl_secs: DEFAULT_BASE_TTL_SECS,
            prefetch_threshold: DEFAULT_PREFETCH_THRESHOLD,
            compress: false,
            encrypt: false,
            warmup: None,
        }
    }
}

impl Strategy {
    pub fn base_ttl(&self) -> Duration {
        Duration::from_secs(self.base_ttl_secs)
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.base_ttl_secs == 0 {
            return Err(ConfigError::invalid(
                format!("strategies.{name}.base_ttl_secs"),
                self.base_ttl_secs,
                "base_ttl_secs must be greater than 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.prefetch_threshold) {
            return Err(ConfigError::invalid(
                format!("strategies.{name}.prefetch_threshold"),
                self.prefetch_threshold,
                "prefetch_threshold must be between 0.0 and 1.0",
            ));
        }
        if let Some(schedule) = &self.warmup {
            if schedule.interval_secs == 0 {
                return Err(ConfigError::invalid(
                    format!("strategies.{name}.warmup.interval_secs"),
                    schedule.interval_secs,
                    "warmup interval must be greater than 0",
                ));
            }
        }
        Ok(())
    }
}

/// Coordinator behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub serve_stale_on_error: bool,
    pub loader_timeout_ms: u64,
    pub stale_grace_secs: u64,
    /// Number of recent calls used to compute a tier's error rate.
    pub tier_error_window: usize,
    pub tier_degraded_error_rate: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            serve_stale_on_error: true,
            loader_timeout_ms: DEFAULT_LOADER_TIMEOUT_MS,
            stale_grace_secs: DEFAULT_STALE_GRACE_SECS,
            tier_error_window: DEFAULT_TIER_ERROR_WINDOW,
            tier_degraded_error_rate: DEFAULT_TIER_DEGRADED_ERROR_RATE,
        }
    }
}

impl CoordinatorConfig {
    pub fn loader_timeout(&self) -> Duration {
        Duration::from_millis(self.loader_timeout_ms)
    }

    pub fn stale_grace(&self) -> Duration {
        Duration::from_secs(self.stale_grace_secs)
    }
}

/// Bounded worker pool for backfill and write-back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKER_COUNT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Circuit breaker thresholds for a network tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_CIRCUIT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_CIRCUIT_SUCCESS_THRESHOLD,
            cooldown_secs: DEFAULT_CIRCUIT_COOLDOWN_SECS,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Local memory tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryTierConfig {
    pub capacity: usize,
    pub ttl_scale: f64,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_MEMORY_CAPACITY,
            ttl_scale: DEFAULT_MEMORY_TTL_SCALE,
        }
    }
}

/// Distributed or edge tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteTierConfig {
    pub call_timeout_ms: u64,
    pub ttl_scale: f64,
    pub breaker: BreakerConfig,
}

impl RemoteTierConfig {
    fn with_scale(ttl_scale: f64) -> Self {
        Self {
            call_timeout_ms: DEFAULT_TIER_CALL_TIMEOUT_MS,
            ttl_scale,
            breaker: BreakerConfig::default(),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for RemoteTierConfig {
    fn default() -> Self {
        Self::with_scale(DEFAULT_DISTRIBUTED_TTL_SCALE)
    }
}

/// All tiers, plus the probe order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TiersConfig {
    pub order: Vec<String>,
    pub memory: MemoryTierConfig,
    pub distributed: RemoteTierConfig,
    pub edge: RemoteTierConfig,
    pub stats_window_secs: u64,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            order: KNOWN_TIERS.iter().map(|t| t.to_string()).collect(),
            memory: MemoryTierConfig::default(),
            distributed: RemoteTierConfig::with_scale(DEFAULT_DISTRIBUTED_TTL_SCALE),
            edge: RemoteTierConfig::with_scale(DEFAULT_EDGE_TTL_SCALE),
            stats_window_secs: DEFAULT_STATS_WINDOW_SECS,
        }
    }
}

impl TiersConfig {
    pub fn stats_window(&self) -> Duration {
        Duration::from_secs(self.stats_window_secs)
    }
}

/// Strategy manager loop and heuristic parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyManagerConfig {
    pub analysis_interval_secs: u64,
    pub tuning_interval_secs: u64,
    pub history_capacity: usize,
    pub ema_alpha: f64,
    pub analysis_window_secs: u64,
    pub cold_after_secs: u64,
    pub hot_interval_secs: u64,
    pub warm_interval_secs: u64,
    pub bursty_cv: f64,
    pub lookahead_secs: u64,
    pub stale_probability_threshold: f64,
    pub min_ttl_secs: u64,
    pub max_ttl_multiplier: f64,
    pub target_hit_rate: f64,
    pub high_eviction_pressure: f64,
    pub tuning_step: f64,
    pub tuning_min_samples: u64,
    pub min_base_ttl_secs: u64,
    pub max_base_ttl_secs: u64,
    pub max_tracked_keys: usize,
}

impl Default for StrategyManagerConfig {
    fn default() -> Self {
        Self {
            analysis_interval_secs: DEFAULT_ANALYSIS_INTERVAL_SECS,
            tuning_interval_secs: DEFAULT_TUNING_INTERVAL_SECS,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            ema_alpha: DEFAULT_EMA_ALPHA,
            analysis_window_secs: DEFAULT_ANALYSIS_WINDOW_SECS,
            cold_after_secs: DEFAULT_COLD_AFTER_SECS,
            hot_interval_secs: DEFAULT_HOT_INTERVAL_SECS,
            warm_interval_secs: DEFAULT_WARM_INTERVAL_SECS,
            bursty_cv: DEFAULT_BURSTY_CV,
            lookahead_secs: DEFAULT_LOOKAHEAD_SECS,
            stale_probability_threshold: DEFAULT_STALE_PROBABILITY_THRESHOLD,
            min_ttl_secs: DEFAULT_MIN_TTL_SECS,
            max_ttl_multiplier: DEFAULT_MAX_TTL_MULTIPLIER,
            target_hit_rate: DEFAULT_TARGET_HIT_RATE,
            high_eviction_pressure: DEFAULT_HIGH_EVICTION_PRESSURE,
            tuning_step: DEFAULT_TUNING_STEP,
            tuning_min_samples: DEFAULT_TUNING_MIN_SAMPLES,
            min_base_ttl_secs: DEFAULT_MIN_BASE_TTL_SECS,
            max_base_ttl_secs: DEFAULT_MAX_BASE_TTL_SECS,
            max_tracked_keys: DEFAULT_MAX_TRACKED_KEYS,
        }
    }
}

impl StrategyManagerConfig {
    pub fn analysis_interval(&self) -> Duration {
        Duration::from_secs(self.analysis_interval_secs)
    }

    pub fn tuning_interval(&self) -> Duration {
        Duration::from_secs(self.tuning_interval_secs)
    }

    pub fn analysis_window(&self) -> Duration {
        Duration::from_secs(self.analysis_window_secs)
    }

    pub fn cold_after(&self) -> Duration {
        Duration::from_secs(self.cold_after_secs)
    }

    pub fn hot_interval(&self) -> Duration {
        Duration::from_secs(self.hot_interval_secs)
    }

    pub fn warm_interval(&self) -> Duration {
        Duration::from_secs(self.warm_interval_secs)
    }

    pub fn lookahead(&self) -> Duration {
        Duration::from_secs(self.lookahead_secs)
    }

    pub fn min_ttl(&self) -> Duration {
        Duration::from_secs(self.min_ttl_secs)
    }
}

/// Thresholds evaluated by the performance monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub hit_rate_floor: f64,
    pub latency_ceiling_ms: f64,
    pub error_rate_ceiling: f64,
    /// Lookups required in the window before rate-based alerts fire.
    pub min_requests: u64,
    pub alert_on_degraded: bool,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            hit_rate_floor: DEFAULT_HIT_RATE_FLOOR,
            latency_ceiling_ms: DEFAULT_LATENCY_CEILING_MS,
            error_rate_ceiling: DEFAULT_ERROR_RATE_CEILING,
            min_requests: DEFAULT_ALERT_MIN_REQUESTS,
            alert_on_degraded: true,
        }
    }
}

/// Performance monitor windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub bucket_secs: u64,
    pub retained_buckets: usize,
    pub realtime_window_secs: u64,
    pub check_interval_secs: u64,
    pub latency_samples_per_bucket: usize,
    pub snapshot_history: usize,
    pub thresholds: AlertThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            bucket_secs: DEFAULT_BUCKET_SECS,
            retained_buckets: DEFAULT_RETAINED_BUCKETS,
            realtime_window_secs: DEFAULT_REALTIME_WINDOW_SECS,
            check_interval_secs: DEFAULT_ALERT_CHECK_INTERVAL_SECS,
            latency_samples_per_bucket: DEFAULT_LATENCY_SAMPLES_PER_BUCKET,
            snapshot_history: DEFAULT_SNAPSHOT_HISTORY,
            thresholds: AlertThresholds::default(),
        }
    }
}

impl MonitorConfig {
    pub fn bucket_width(&self) -> Duration {
        Duration::from_secs(self.bucket_secs)
    }

    pub fn realtime_window(&self) -> Duration {
        Duration::from_secs(self.realtime_window_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Master configuration struct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StratumConfig {
    pub coordinator: CoordinatorConfig,
    pub workers: WorkerConfig,
    pub tiers: TiersConfig,
    pub strategy: StrategyManagerConfig,
    /// Per data type strategy table.
    pub strategies: BTreeMap<String, Strategy>,
    pub monitor: MonitorConfig,
    /// Hex-encoded 32-byte AES-256 key for encrypted strategies.
    pub encryption_key: Option<String>,
}

impl StratumConfig {
    /// Parse a TOML document on top of the defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    /// Read and parse a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&source)
    }

    /// Load from an optional file, apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `STRATUM_*` environment variable overrides.
    ///
    /// # Environment Variables
    /// - `STRATUM_SERVE_STALE_ON_ERROR`: serve stale values on loader failure (true/false)
    /// - `STRATUM_LOADER_TIMEOUT_MS`: loader timeout in milliseconds
    /// - `STRATUM_MEMORY_CAPACITY`: memory tier capacity in entries
    /// - `STRATUM_WORKER_COUNT`: background worker count
    /// - `STRATUM_QUEUE_CAPACITY`: background task queue capacity
    /// - `STRATUM_HIT_RATE_FLOOR`: hit rate alert floor
    /// - `STRATUM_LATENCY_CEILING_MS`: p95 latency alert ceiling
    /// - `STRATUM_ERROR_RATE_CEILING`: tier error rate alert ceiling
    /// - `STRATUM_ENCRYPTION_KEY`: hex encoded AES-256 key
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary lookup, used by tests.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            name: &str,
        ) -> Option<T> {
            lookup(name).and_then(|s| s.trim().parse().ok())
        }
        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;

        if let Some(v) = parsed(lookup, "STRATUM_SERVE_STALE_ON_ERROR") {
            self.coordinator.serve_stale_on_error = v;
        }
        if let Some(v) = parsed(lookup, "STRATUM_LOADER_TIMEOUT_MS") {
            self.coordinator.loader_timeout_ms = v;
        }
        if let Some(v) = parsed(lookup, "STRATUM_MEMORY_CAPACITY") {
            self.tiers.memory.capacity = v;
        }
        if let Some(v) = parsed(lookup, "STRATUM_WORKER_COUNT") {
            self.workers.workers = v;
        }
        if let Some(v) = parsed(lookup, "STRATUM_QUEUE_CAPACITY") {
            self.workers.queue_capacity = v;
        }
        if let Some(v) = parsed(lookup, "STRATUM_HIT_RATE_FLOOR") {
            self.monitor.thresholds.hit_rate_floor = v;
        }
        if let Some(v) = parsed(lookup, "STRATUM_LATENCY_CEILING_MS") {
            self.monitor.thresholds.latency_ceiling_ms = v;
        }
        if let Some(v) = parsed(lookup, "STRATUM_ERROR_RATE_CEILING") {
            self.monitor.thresholds.error_rate_ceiling = v;
        }
        if let Some(v) = lookup("STRATUM_ENCRYPTION_KEY") {
            self.encryption_key = Some(v.trim().to_string());
        }
    }

    /// Strategy for a data type, falling back to the default strategy.
    pub fn strategy_for(&self, data_type: &DataType) -> Strategy {
        self.strategies
            .get(data_type.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// Decode the configured encryption key.
    pub fn encryption_key_bytes(&self) -> Result<Option<[u8; ENCRYPTION_KEY_SIZE]>, ConfigError> {
        let Some(hex_key) = &self.encryption_key else {
            return Ok(None);
        };
        let bytes = hex::decode(hex_key).map_err(|e| {
            ConfigError::invalid("encryption_key", "<redacted>", format!("invalid hex: {e}"))
        })?;
        if bytes.len() != ENCRYPTION_KEY_SIZE {
            return Err(ConfigError::invalid(
                "encryption_key",
                "<redacted>",
                format!("key must be {} bytes, got {}", ENCRYPTION_KEY_SIZE, bytes.len()),
            ));
        }
        let mut key = [0u8; ENCRYPTION_KEY_SIZE];
        key.copy_from_slice(&bytes);
        Ok(Some(key))
    }

    /// Validate the configuration.
    /// Returns Ok(()) if valid, Err(ConfigError) describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_tiers()?;

        if self.workers.workers == 0 {
            return Err(ConfigError::invalid(
                "workers.workers",
                self.workers.workers,
                "at least one worker is required",
            ));
        }
        if self.workers.queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "workers.queue_capacity",
                self.workers.queue_capacity,
                "queue_capacity must be greater than 0",
            ));
        }

        if self.coordinator.loader_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "coordinator.loader_timeout_ms",
                self.coordinator.loader_timeout_ms,
                "loader_timeout_ms must be greater than 0",
            ));
        }
        if self.coordinator.tier_error_window == 0 {
            return Err(ConfigError::invalid(
                "coordinator.tier_error_window",
                self.coordinator.tier_error_window,
                "tier_error_window must be greater than 0",
            ));
        }
        check_unit_interval(
            "coordinator.tier_degraded_error_rate",
            self.coordinator.tier_degraded_error_rate,
        )?;

        self.validate_strategy_manager()?;
        self.validate_monitor()?;

        let key = self.encryption_key_bytes()?;
        for (name, strategy) in &self.strategies {
            strategy.validate(name)?;
            if strategy.encrypt && key.is_none() {
                return Err(ConfigError::IncompatibleOptions {
                    option_a: format!("strategies.{name}.encrypt"),
                    option_b: "missing encryption_key".to_string(),
                });
            }
        }

        Ok(())
    }

    fn validate_tiers(&self) -> Result<(), ConfigError> {
        let tiers = &self.tiers;
        if tiers.order.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "tiers.order".to_string(),
            });
        }
        let mut seen = HashSet::new();
        for name in &tiers.order {
            if !KNOWN_TIERS.contains(&name.as_str()) {
                return Err(ConfigError::invalid(
                    "tiers.order",
                    name,
                    "unknown tier name",
                ));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::invalid(
                    "tiers.order",
                    name,
                    "tier listed more than once",
                ));
            }
        }
        if tiers.memory.capacity == 0 {
            return Err(ConfigError::invalid(
                "tiers.memory.capacity",
                tiers.memory.capacity,
                "capacity must be greater than 0",
            ));
        }
        for (field, scale) in [
            ("tiers.memory.ttl_scale", tiers.memory.ttl_scale),
            ("tiers.distributed.ttl_scale", tiers.distributed.ttl_scale),
            ("tiers.edge.ttl_scale", tiers.edge.ttl_scale),
        ] {
            if !(scale > 0.0 && scale.is_finite()) {
                return Err(ConfigError::invalid(field, scale, "ttl_scale must be positive"));
            }
        }
        for (field, remote) in [
            ("tiers.distributed", &tiers.distributed),
            ("tiers.edge", &tiers.edge),
        ] {
            if remote.call_timeout_ms == 0 {
                return Err(ConfigError::invalid(
                    format!("{field}.call_timeout_ms"),
                    remote.call_timeout_ms,
                    "call_timeout_ms must be greater than 0",
                ));
            }
            if remote.breaker.failure_threshold == 0 || remote.breaker.success_threshold == 0 {
                return Err(ConfigError::invalid(
                    format!("{field}.breaker"),
                    format!(
                        "{}/{}",
                        remote.breaker.failure_threshold, remote.breaker.success_threshold
                    ),
                    "breaker thresholds must be greater than 0",
                ));
            }
        }
        if tiers.stats_window_secs == 0 {
            return Err(ConfigError::invalid(
                "tiers.stats_window_secs",
                tiers.stats_window_secs,
                "stats_window_secs must be greater than 0",
            ));
        }
        Ok(())
    }

    fn validate_strategy_manager(&self) -> Result<(), ConfigError> {
        let s = &self.strategy;
        for (field, value) in [
            ("strategy.analysis_interval_secs", s.analysis_interval_secs),
            ("strategy.tuning_interval_secs", s.tuning_interval_secs),
            ("strategy.analysis_window_secs", s.analysis_window_secs),
            ("strategy.min_ttl_secs", s.min_ttl_secs),
            ("strategy.min_base_ttl_secs", s.min_base_ttl_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, value, "must be greater than 0"));
            }
        }
        if s.history_capacity < 2 {
            return Err(ConfigError::invalid(
                "strategy.history_capacity",
                s.history_capacity,
                "history_capacity must be at least 2",
            ));
        }
        if !(s.ema_alpha > 0.0 && s.ema_alpha <= 1.0) {
            return Err(ConfigError::invalid(
                "strategy.ema_alpha",
                s.ema_alpha,
                "ema_alpha must be in (0.0, 1.0]",
            ));
        }
        if s.hot_interval_secs > s.warm_interval_secs {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "strategy.hot_interval_secs".to_string(),
                option_b: "strategy.warm_interval_secs".to_string(),
            });
        }
        if s.max_ttl_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "strategy.max_ttl_multiplier",
                s.max_ttl_multiplier,
                "max_ttl_multiplier must be at least 1.0",
            ));
        }
        if s.min_base_ttl_secs > s.max_base_ttl_secs {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "strategy.min_base_ttl_secs".to_string(),
                option_b: "strategy.max_base_ttl_secs".to_string(),
            });
        }
        check_unit_interval(
            "strategy.stale_probability_threshold",
            s.stale_probability_threshold,
        )?;
        check_unit_interval("strategy.target_hit_rate", s.target_hit_rate)?;
        check_unit_interval("strategy.high_eviction_pressure", s.high_eviction_pressure)?;
        if !(s.tuning_step > 0.0 && s.tuning_step < 1.0) {
            return Err(ConfigError::invalid(
                "strategy.tuning_step",
                s.tuning_step,
                "tuning_step must be in (0.0, 1.0)",
            ));
        }
        Ok(())
    }

    fn validate_monitor(&self) -> Result<(), ConfigError> {
        let m = &self.monitor;
        if m.bucket_secs == 0 || m.check_interval_secs == 0 || m.realtime_window_secs == 0 {
            return Err(ConfigError::invalid(
                "monitor",
                format!(
                    "bucket={} check={} realtime={}",
                    m.bucket_secs, m.check_interval_secs, m.realtime_window_secs
                ),
                "monitor intervals must be greater than 0",
            ));
        }
        if m.retained_buckets == 0 || m.snapshot_history == 0 || m.latency_samples_per_bucket == 0 {
            return Err(ConfigError::invalid(
                "monitor",
                format!(
                    "buckets={} snapshots={} samples={}",
                    m.retained_buckets, m.snapshot_history, m.latency_samples_per_bucket
                ),
                "monitor capacities must be greater than 0",
            ));
        }
        let t = &m.thresholds;
        check_unit_interval("monitor.thresholds.hit_rate_floor", t.hit_rate_floor)?;
        check_unit_interval("monitor.thresholds.error_rate_ceiling", t.error_rate_ceiling)?;
        if !(t.latency_ceiling_ms > 0.0) {
            return Err(ConfigError::invalid(
                "monitor.thresholds.latency_ceiling_ms",
                t.latency_ceiling_ms,
                "latency_ceiling_ms must be positive",
            ));
        }
        Ok(())
    }
}

fn check_unit_interval(field: &str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::invalid(
            field,
            value,
            "must be between 0.0 and 1.0",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const TEST_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_default_config_is_valid() {
        let config = StratumConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tiers.order, vec!["memory", "distributed", "edge", "compute"]);
    }

    #[test]
    fn test_toml_parsing_merges_with_defaults() {
        let config = StratumConfig::from_toml_str(
            r#"
            [tiers]
            order = ["memory", "distributed", "compute"]

            [tiers.memory]
            capacity = 500

            [strategies.note]
            base_ttl_secs = 600
            prefetch_threshold = 0.4
            compress = true

            [strategies.note.warmup]
            interval_secs = 30
            keys = ["note:pinned"]
            "#,
        )
        .unwrap();

        assert_eq!(config.tiers.memory.capacity, 500);
        assert_eq!(config.tiers.memory.ttl_scale, DEFAULT_MEMORY_TTL_SCALE);
        let note = config.strategy_for(&DataType::from("note"));
        assert_eq!(note.base_ttl(), Duration::from_secs(600));
        assert!(note.compress);
        assert_eq!(note.warmup.unwrap().keys, vec!["note:pinned"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_data_type_falls_back_to_default() {
        let config = StratumConfig::default();
        let strategy = config.strategy_for(&DataType::from("unknown"));
        assert_eq!(strategy, Strategy::default());
    }

    #[test]
    fn test_parse_error_is_config_error() {
        let err = StratumConfig::from_toml_str("tiers = 5").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[workers]\nworkers = 2\nqueue_capacity = 8").unwrap();
        let config = StratumConfig::from_file(file.path()).unwrap();
        assert_eq!(config.workers.workers, 2);
        assert_eq!(config.workers.queue_capacity, 8);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = StratumConfig::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("STRATUM_MEMORY_CAPACITY", "42"),
            ("STRATUM_SERVE_STALE_ON_ERROR", "false"),
            ("STRATUM_HIT_RATE_FLOOR", "0.9"),
            ("STRATUM_WORKER_COUNT", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = StratumConfig::default();
        config.apply_overrides_from(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.tiers.memory.capacity, 42);
        assert!(!config.coordinator.serve_stale_on_error);
        assert_eq!(config.monitor.thresholds.hit_rate_floor, 0.9);
        assert_eq!(config.workers.workers, DEFAULT_WORKER_COUNT);
    }

    #[test]
    fn test_rejects_zero_ttl_strategy() {
        let mut config = StratumConfig::default();
        config.strategies.insert(
            "note".to_string(),
            Strategy {
                base_ttl_secs: 0,
                ..Default::default()
            },
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("strategies.note.base_ttl_secs"));
    }

    #[test]
    fn test_rejects_prefetch_threshold_out_of_range() {
        let mut config = StratumConfig::default();
        config.strategies.insert(
            "note".to_string(),
            Strategy {
                prefetch_threshold: 1.5,
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_and_duplicate_tiers() {
        let mut config = StratumConfig::default();
        config.tiers.order = vec!["memory".to_string(), "disk".to_string()];
        assert!(config.validate().is_err());

        config.tiers.order = vec!["memory".to_string(), "memory".to_string()];
        assert!(config.validate().is_err());

        config.tiers.order.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_capacity_and_workers() {
        let mut config = StratumConfig::default();
        config.tiers.memory.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = StratumConfig::default();
        config.workers.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_thresholds() {
        let mut config = StratumConfig::default();
        config.monitor.thresholds.hit_rate_floor = 1.2;
        assert!(config.validate().is_err());

        let mut config = StratumConfig::default();
        config.monitor.thresholds.latency_ceiling_ms = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_encrypt_requires_key() {
        let mut config = StratumConfig::default();
        config.strategies.insert(
            "secret".to_string(),
            Strategy {
                encrypt: true,
                ..Default::default()
            },
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IncompatibleOptions { .. })
        ));

        config.encryption_key = Some(TEST_KEY.to_string());
        assert!(config.validate().is_ok());
        assert_eq!(config.encryption_key_bytes().unwrap().unwrap()[31], 0x1f);
    }

    #[test]
    fn test_short_encryption_key_rejected() {
        let config = StratumConfig {
            encryption_key: Some("abcd".to_string()),
            ..Default::default()
        };
        assert!(config.encryption_key_bytes().is_err());
        assert!(config.validate().is_err());
    }
}
