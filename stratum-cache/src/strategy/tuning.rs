//! Bounded feedback control of per-type strategies.

use serde::Serialize;

use stratum_core::constants::{MAX_PREFETCH_THRESHOLD, MIN_PREFETCH_THRESHOLD, PREFETCH_THRESHOLD_STEP};
use stratum_core::{DataType, Strategy, StrategyManagerConfig};

/// Outcomes observed for one data type since the last tuning round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TuningInput {
    pub lookups: u64,
    pub hits: u64,
    pub fills: u64,
    pub evictions: u64,
}

impl TuningInput {
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }

    /// Evictions per fill.
    pub fn eviction_pressure(&self) -> f64 {
        self.evictions as f64 / self.fills.max(1) as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TuningReason {
    EvictionPressure,
    LowHitRate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TuningChange {
    pub data_type: DataType,
    pub reason: TuningReason,
    pub old_base_ttl_secs: u64,
    pub new_base_ttl_secs: u64,
    pub old_prefetch_threshold: f64,
    pub new_prefetch_threshold: f64,
}

/// Nudge `strategy` once. Returns `None` when there were too few lookups or
/// the strategy is already inside its target band.
pub fn tune(
    data_type: &DataType,
    strategy: &mut Strategy,
    input: TuningInput,
    config: &StrategyManagerConfig,
) -> Option<TuningChange> {
    if input.lookups < config.tuning_min_samples {
        return None;
    }

    let (reason, ttl_factor, threshold_delta) =
        if input.eviction_pressure() >= config.high_eviction_pressure {
            (TuningReason::EvictionPressure, 1.0 - config.tuning_step, PREFETCH_THRESHOLD_STEP)
        } else if input.hit_rate() < config.target_hit_rate {
            (TuningReason::LowHitRate, 1.0 + config.tuning_step, -PREFETCH_THRESHOLD_STEP)
        } else {
            return None;
        };

    let old_ttl = strategy.base_ttl_secs;
    let old_threshold = strategy.prefetch_threshold;

    let new_ttl = ((old_ttl as f64 * ttl_factor).round() as u64)
        .clamp(config.min_base_ttl_secs, config.max_base_ttl_secs);
    let new_threshold =
        (old_threshold + threshold_delta).clamp(MIN_PREFETCH_THRESHOLD, MAX_PREFETCH_THRESHOLD);

    if new_ttl == old_ttl && (new_threshold - old_threshold).abs() < f64::EPSILON {
        return None;
    }

    strategy.base_ttl_secs = new_ttl;
    strategy.prefetch_threshold = new_threshold;

    Some(TuningChange {
        data_type: data_type.clone(),
        reason,
        old_base_ttl_secs: old_ttl,
        new_base_ttl_secs: new_ttl,
        old_prefetch_threshold: old_threshold,
        new_prefetch_threshold: new_threshold,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config() -> StrategyManagerConfig {
        StrategyManagerConfig {
            tuning_min_samples: 10,
            tuning_step: 0.1,
            target_hit_rate: 0.8,
            high_eviction_pressure: 0.5,
            min_base_ttl_secs: 10,
            max_base_ttl_secs: 1_000,
            ..StrategyManagerConfig::default()
        }
    }

    fn strategy(ttl: u64, threshold: f64) -> Strategy {
        Strategy {
            base_ttl_secs: ttl,
            prefetch_threshold: threshold,
            ..Strategy::default()
        }
    }

    #[test]
    fn test_low_hit_rate_lengthens_ttl() {
        let mut s = strategy(300, 0.5);
        let input = TuningInput { lookups: 100, hits: 40, fills: 60, evictions: 0 };
        let change = tune(&DataType::default(), &mut s, input, &config()).unwrap();
        assert_eq!(change.reason, TuningReason::LowHitRate);
        assert_eq!(s.base_ttl_secs, 330);
        assert!((s.prefetch_threshold - 0.45).abs() < 1e-9);
    }

    #[test]
    fn test_eviction_pressure_shortens_ttl() {
        let mut s = strategy(300, 0.5);
        let input = TuningInput { lookups: 100, hits: 40, fills: 60, evictions: 50 };
        let change = tune(&DataType::new("session"), &mut s, input, &config()).unwrap();
        assert_eq!(change.reason, TuningReason::EvictionPressure);
        assert_eq!(change.data_type.as_str(), "session");
        assert_eq!(s.base_ttl_secs, 270);
        assert!((s.prefetch_threshold - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_no_change_without_samples_or_when_healthy() {
        let mut s = strategy(300, 0.5);
        let sparse = TuningInput { lookups: 5, hits: 0, fills: 5, evictions: 5 };
        assert!(tune(&DataType::default(), &mut s, sparse, &config()).is_none());

        let healthy = TuningInput { lookups: 100, hits: 95, fills: 5, evictions: 0 };
        assert!(tune(&DataType::default(), &mut s, healthy, &config()).is_none());
        assert_eq!(s, strategy(300, 0.5));
    }

    #[test]
    fn test_no_change_at_bounds() {
        let mut s = strategy(1_000, MIN_PREFETCH_THRESHOLD);
        let input = TuningInput { lookups: 100, hits: 10, fills: 90, evictions: 0 };
        assert!(tune(&DataType::default(), &mut s, input, &config()).is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn prop_tuning_stays_in_bounds(
            ttl in 10u64..=1_000,
            threshold in 0.05f64..=0.95,
            lookups in 10u64..1_000,
            hit_pct in 0u64..=100,
            evictions in 0u64..1_000,
            rounds in 1usize..20,
        ) {
            let cfg = config();
            let mut s = strategy(ttl, threshold);
            let hits = lookups * hit_pct / 100;
            let input = TuningInput { lookups, hits, fills: lookups - hits, evictions };
            for _ in 0..rounds {
                tune(&DataType::default(), &mut s, input, &cfg);
                prop_assert!(s.base_ttl_secs >= cfg.min_base_ttl_secs);
                prop_assert!(s.base_ttl_secs <= cfg.max_base_ttl_secs);
                prop_assert!(s.prefetch_threshold >= MIN_PREFETCH_THRESHOLD - 1e-9);
                prop_assert!(s.prefetch_threshold <= MAX_PREFETCH_THRESHOLD + 1e-9);
            }
        }
    }
}
