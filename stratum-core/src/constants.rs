//! Constants for the stratum cache
//!
//! All default values used by configuration live here so they are easy to
//! find, tune, and test.

// ============================================================================
// KEYS AND TTL
// ============================================================================

/// Maximum accepted cache key length in bytes
pub const MAX_KEY_LENGTH: usize = 1024;

/// Default base TTL for data types without an explicit strategy (5 minutes)
pub const DEFAULT_BASE_TTL_SECS: u64 = 300;

/// Floor applied to every computed TTL
pub const DEFAULT_MIN_TTL_SECS: u64 = 1;

/// Adaptive TTL never exceeds base TTL times this factor
pub const DEFAULT_MAX_TTL_MULTIPLIER: f64 = 4.0;

/// Default prefetch threshold (fraction of the access history filled recently)
pub const DEFAULT_PREFETCH_THRESHOLD: f64 = 0.25;

/// Data type tag applied when the caller does not provide one
pub const DEFAULT_DATA_TYPE: &str = "default";

// ============================================================================
// COORDINATOR
// ============================================================================

/// Default loader timeout in milliseconds
pub const DEFAULT_LOADER_TIMEOUT_MS: u64 = 5_000;

/// How long expired entries remain available for stale serving (5 minutes)
pub const DEFAULT_STALE_GRACE_SECS: u64 = 300;

/// Rolling window used to judge a tier's error rate
pub const DEFAULT_TIER_ERROR_WINDOW: usize = 50;

/// Error rate over the rolling window that marks a tier degraded
pub const DEFAULT_TIER_DEGRADED_ERROR_RATE: f64 = 0.5;

// ============================================================================
// WORKER POOL
// ============================================================================

/// Default number of background propagation workers
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default bounded task queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_024;

// ============================================================================
// TIERS
// ============================================================================

/// Default memory tier capacity (entries)
pub const DEFAULT_MEMORY_CAPACITY: usize = 10_000;

/// Default per-call timeout for network tiers in milliseconds
pub const DEFAULT_TIER_CALL_TIMEOUT_MS: u64 = 250;

/// TTL scale applied to the memory tier
pub const DEFAULT_MEMORY_TTL_SCALE: f64 = 0.5;

/// TTL scale applied to the distributed tier
pub const DEFAULT_DISTRIBUTED_TTL_SCALE: f64 = 1.0;

/// TTL scale applied to the edge tier
pub const DEFAULT_EDGE_TTL_SCALE: f64 = 2.0;

/// Default window after which tier stats counters roll over (1 hour)
pub const DEFAULT_STATS_WINDOW_SECS: u64 = 3_600;

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

/// Consecutive failures before the breaker opens
pub const DEFAULT_CIRCUIT_FAILURE_THRESHOLD: u32 = 5;

/// Successes in half-open state needed to close the breaker
pub const DEFAULT_CIRCUIT_SUCCESS_THRESHOLD: u32 = 2;

/// How long the breaker stays open before probing again
pub const DEFAULT_CIRCUIT_COOLDOWN_SECS: u64 = 30;

// ============================================================================
// STRATEGY MANAGER
// ============================================================================

/// Number of access timestamps retained per key
pub const DEFAULT_HISTORY_CAPACITY: usize = 32;

/// EMA smoothing factor for inter-access intervals
pub const DEFAULT_EMA_ALPHA: f64 = 0.3;

/// Interval between access pattern analysis passes
pub const DEFAULT_ANALYSIS_INTERVAL_SECS: u64 = 10;

/// Interval between self-tuning passes
pub const DEFAULT_TUNING_INTERVAL_SECS: u64 = 60;

/// Window used to count "recent" accesses
pub const DEFAULT_ANALYSIS_WINDOW_SECS: u64 = 300;

/// Keys idle for longer than this are classified cold
pub const DEFAULT_COLD_AFTER_SECS: u64 = 900;

/// Mean interval at or below which a key is hot
pub const DEFAULT_HOT_INTERVAL_SECS: u64 = 10;

/// Mean interval at or below which a key is warm
pub const DEFAULT_WARM_INTERVAL_SECS: u64 = 120;

/// Coefficient of variation at or above which a key is bursty
pub const DEFAULT_BURSTY_CV: f64 = 1.0;

/// Prefetch lookahead window
pub const DEFAULT_LOOKAHEAD_SECS: u64 = 5;

/// Probability above which an entry is refreshed early
pub const DEFAULT_STALE_PROBABILITY_THRESHOLD: f64 = 0.5;

/// Realized hit rate the tuner aims for
pub const DEFAULT_TARGET_HIT_RATE: f64 = 0.8;

/// Evictions per insert above which the tuner shortens TTLs
pub const DEFAULT_HIGH_EVICTION_PRESSURE: f64 = 0.1;

/// Relative TTL step per tuning round
pub const DEFAULT_TUNING_STEP: f64 = 0.1;

/// Lookups required before a data type is tuned
pub const DEFAULT_TUNING_MIN_SAMPLES: u64 = 20;

/// Lower bound for tuned base TTL
pub const DEFAULT_MIN_BASE_TTL_SECS: u64 = 5;

/// Upper bound for tuned base TTL (1 day)
pub const DEFAULT_MAX_BASE_TTL_SECS: u64 = 86_400;

/// Prefetch threshold adjustment per tuning round
pub const PREFETCH_THRESHOLD_STEP: f64 = 0.05;

/// Bounds for tuned prefetch threshold
pub const MIN_PREFETCH_THRESHOLD: f64 = 0.05;
pub const MAX_PREFETCH_THRESHOLD: f64 = 0.95;

/// Maximum number of tracked keys before the least recent are dropped
pub const DEFAULT_MAX_TRACKED_KEYS: usize = 100_000;

// ============================================================================
// PERFORMANCE MONITOR
// ============================================================================

/// Width of one metrics bucket
pub const DEFAULT_BUCKET_SECS: u64 = 10;

/// Number of buckets retained (1 hour at 10s buckets)
pub const DEFAULT_RETAINED_BUCKETS: usize = 360;

/// Window for real-time metrics
pub const DEFAULT_REALTIME_WINDOW_SECS: u64 = 60;

/// Interval between alert checks
pub const DEFAULT_ALERT_CHECK_INTERVAL_SECS: u64 = 15;

/// Latency samples retained per bucket
pub const DEFAULT_LATENCY_SAMPLES_PER_BUCKET: usize = 2_048;

/// Snapshots retained in the history ring
pub const DEFAULT_SNAPSHOT_HISTORY: usize = 360;

/// Overall hit rate below which an alert is raised
pub const DEFAULT_HIT_RATE_FLOOR: f64 = 0.5;

/// p95 latency above which an alert is raised
pub const DEFAULT_LATENCY_CEILING_MS: f64 = 100.0;

/// Per-tier error rate above which an alert is raised
pub const DEFAULT_ERROR_RATE_CEILING: f64 = 0.05;

/// Lookups required in the window before hit rate alerts are evaluated
pub const DEFAULT_ALERT_MIN_REQUESTS: u64 = 20;

// ============================================================================
// HEALTH SCORE WEIGHTS
// ============================================================================

pub const HEALTH_WEIGHT_HIT_RATE: f64 = 0.40;
pub const HEALTH_WEIGHT_LATENCY: f64 = 0.25;
pub const HEALTH_WEIGHT_ERRORS: f64 = 0.20;
pub const HEALTH_WEIGHT_AVAILABILITY: f64 = 0.15;

// ============================================================================
// ENCRYPTION
// ============================================================================

/// AES-256 key length in bytes
pub const ENCRYPTION_KEY_SIZE: usize = 32;

/// AES-GCM nonce length in bytes
pub const ENCRYPTION_NONCE_SIZE: usize = 12;
