//! Cache statistics and performance snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Statistics about cache usage for one tier or a combined view.
///
/// `hits`, `misses`, `evictions` and `errors` are monotonic within a
/// collection window and reset at rollover. `entry_count` and
/// `total_size_bytes` are gauges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of evictions due to capacity.
    pub evictions: u64,
    /// Number of failed tier calls.
    pub errors: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Approximate payload size in bytes.
    pub total_size_bytes: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Total lookups served by this tier.
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }

    /// Add another tier's counters into this one.
    ///
    /// Because hit rate is derived from the summed counts, the combined
    /// rate is the lookup-weighted mean of the individual rates.
    pub fn merge(&mut self, other: &CacheStats) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.evictions += other.evictions;
        self.errors += other.errors;
        self.entry_count += other.entry_count;
        self.total_size_bytes += other.total_size_bytes;
    }
}

/// Latency percentiles in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub samples: usize,
}

impl LatencyPercentiles {
    /// Nearest-rank percentiles over unsorted samples given in microseconds.
    pub fn from_micros(samples: &mut [u64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_unstable();
        let rank = |p: f64| -> f64 {
            let n = samples.len();
            let idx = ((p * n as f64).ceil() as usize).clamp(1, n) - 1;
            samples[idx] as f64 / 1_000.0
        };
        Self {
            p50_ms: rank(0.50),
            p95_ms: rank(0.95),
            p99_ms: rank(0.99),
            samples: samples.len(),
        }
    }
}

/// Stats for one named tier inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierSnapshot {
    pub tier: String,
    pub stats: CacheStats,
    pub degraded: bool,
}

/// Point-in-time view of cache performance. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub tiers: Vec<TierSnapshot>,
    pub overall_hit_rate: f64,
    pub requests: u64,
    pub latency: LatencyPercentiles,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_merge_weights_hit_rate_by_lookups() {
        let mut combined = CacheStats {
            hits: 9,
            misses: 1,
            ..Default::default()
        };
        combined.merge(&CacheStats {
            hits: 0,
            misses: 90,
            evictions: 3,
            entry_count: 5,
            ..Default::default()
        });
        assert_eq!(combined.lookups(), 100);
        assert!((combined.hit_rate() - 0.09).abs() < 1e-9);
        assert_eq!(combined.evictions, 3);
        assert_eq!(combined.entry_count, 5);
    }

    #[test]
    fn test_percentiles_nearest_rank() {
        let mut samples: Vec<u64> = (1..=100).map(|ms| ms * 1_000).collect();
        let p = LatencyPercentiles::from_micros(&mut samples);
        assert_eq!(p.p50_ms, 50.0);
        assert_eq!(p.p95_ms, 95.0);
        assert_eq!(p.p99_ms, 99.0);
        assert_eq!(p.samples, 100);
    }

    #[test]
    fn test_percentiles_empty() {
        let p = LatencyPercentiles::from_micros(&mut []);
        assert_eq!(p, LatencyPercentiles::default());
    }
}
