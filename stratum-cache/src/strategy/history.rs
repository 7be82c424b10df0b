//! Per-key access history and its reduction to an [`AccessPattern`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use stratum_core::{AccessClass, AccessPattern, DataType, StrategyManagerConfig};

/// Minimum number of intervals before a key can be called bursty.
const MIN_BURSTY_INTERVALS: usize = 4;

/// Rolling access record for one key.
#[derive(Debug, Clone)]
pub struct AccessHistory {
    pub data_type: DataType,
    accesses: VecDeque<Instant>,
    capacity: usize,
    /// When the cached value was last (re)filled from the source of truth.
    pub filled_at: Option<Instant>,
    /// Predicted access a prefetch was already issued for.
    pub prefetched_for: Option<Instant>,
}

impl AccessHistory {
    pub fn new(data_type: DataType, capacity: usize) -> Self {
        Self {
            data_type,
            accesses: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(2),
            filled_at: None,
            prefetched_for: None,
        }
    }

    pub fn record(&mut self, at: Instant) {
        if self.accesses.len() == self.capacity {
            self.accesses.pop_front();
        }
        self.accesses.push_back(at);
    }

    pub fn last_access(&self) -> Option<Instant> {
        self.accesses.back().copied()
    }

    pub fn len(&self) -> usize {
        self.accesses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accesses.is_empty()
    }

    /// Reduce the history to a pattern. `None` when nothing was recorded.
    pub fn analyze(&self, now: Instant, config: &StrategyManagerConfig) -> Option<AccessPattern> {
        let last_access = self.last_access()?;

        let intervals: Vec<f64> = self
            .accesses
            .iter()
            .zip(self.accesses.iter().skip(1))
            .map(|(a, b)| b.saturating_duration_since(*a).as_secs_f64())
            .collect();

        let ema = ema(&intervals, config.ema_alpha);
        let cv = coefficient_of_variation(&intervals);

        let window = config.analysis_window();
        let recent = self
            .accesses
            .iter()
            .filter(|at| now.saturating_duration_since(**at) <= window)
            .count();
        let score = (recent as f64 / self.capacity as f64).clamp(0.0, 1.0);
        let minutes = (window.as_secs_f64() / 60.0).max(f64::EPSILON);

        let idle = now.saturating_duration_since(last_access);
        let class = classify(self.accesses.len(), idle, ema, cv, intervals.len(), config);

        Some(AccessPattern {
            class,
            access_count: self.accesses.len(),
            recent_accesses: recent,
            score,
            frequency_per_min: recent as f64 / minutes,
            ema_interval: ema.map(Duration::from_secs_f64),
            interval_cv: cv,
            last_access,
        })
    }
}

/// Exponential moving average seeded with the first interval.
pub fn ema(intervals: &[f64], alpha: f64) -> Option<f64> {
    let (first, rest) = intervals.split_first()?;
    Some(
        rest.iter()
            .fold(*first, |e, d| alpha * d + (1.0 - alpha) * e),
    )
}

/// Population standard deviation over mean. Zero when the mean is zero.
pub fn coefficient_of_variation(intervals: &[f64]) -> f64 {
    if intervals.is_empty() {
        return 0.0;
    }
    let n = intervals.len() as f64;
    let mean = intervals.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance = intervals.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt() / mean
}

/// First matching rule wins: idle or sparse keys are cold, highly irregular
/// keys are bursty, then the EMA interval decides between hot, warm and cold.
pub fn classify(
    accesses: usize,
    idle: Duration,
    ema: Option<f64>,
    cv: f64,
    intervals: usize,
    config: &StrategyManagerConfig,
) -> AccessClass {
    if accesses < 2 || idle > config.cold_after() {
        return AccessClass::Cold;
    }
    if cv >= config.bursty_cv && intervals >= MIN_BURSTY_INTERVALS {
        return AccessClass::Bursty;
    }
    match ema {
        Some(e) if e <= config.hot_interval().as_secs_f64() => AccessClass::Hot,
        Some(e) if e <= config.warm_interval().as_secs_f64() => AccessClass::Warm,
        _ => AccessClass::Cold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history_at(offsets_secs: &[u64], start: Instant) -> AccessHistory {
        let mut h = AccessHistory::new(DataType::default(), 32);
        for s in offsets_secs {
            h.record(start + Duration::from_secs(*s));
        }
        h
    }

    #[test]
    fn test_ema_seeded_with_first_interval() {
        assert_eq!(ema(&[], 0.3), None);
        assert_eq!(ema(&[10.0], 0.3), Some(10.0));
        // 0.3 * 20 + 0.7 * 10
        let e = ema(&[10.0, 20.0], 0.3).unwrap();
        assert!((e - 13.0).abs() < 1e-9);
    }

    #[test]
    fn test_cv_of_regular_intervals_is_zero() {
        assert_eq!(coefficient_of_variation(&[5.0, 5.0, 5.0]), 0.0);
        assert!(coefficient_of_variation(&[1.0, 1.0, 1.0, 60.0]) > 1.0);
    }

    #[test]
    fn test_classification() {
        let config = StrategyManagerConfig::default();
        let start = Instant::now();

        let hot = history_at(&[0, 2, 4, 6, 8], start);
        let p = hot.analyze(start + Duration::from_secs(9), &config).unwrap();
        assert_eq!(p.class, AccessClass::Hot);
        assert_eq!(p.ema_interval, Some(Duration::from_secs(2)));

        let warm = history_at(&[0, 60, 120], start);
        let p = warm.analyze(start + Duration::from_secs(130), &config).unwrap();
        assert_eq!(p.class, AccessClass::Warm);

        let sparse = history_at(&[0], start);
        let p = sparse.analyze(start, &config).unwrap();
        assert_eq!(p.class, AccessClass::Cold);

        let idle = history_at(&[0, 1, 2], start);
        let p = idle.analyze(start + Duration::from_secs(2_000), &config).unwrap();
        assert_eq!(p.class, AccessClass::Cold);

        let bursty = history_at(&[0, 1, 2, 3, 200], start);
        let p = bursty.analyze(start + Duration::from_secs(201), &config).unwrap();
        assert_eq!(p.class, AccessClass::Bursty);
    }

    #[test]
    fn test_history_is_bounded_and_score_in_range() {
        let config = StrategyManagerConfig::default();
        let start = Instant::now();
        let mut h = AccessHistory::new(DataType::default(), 4);
        for s in 0..10 {
            h.record(start + Duration::from_secs(s));
        }
        assert_eq!(h.len(), 4);
        let p = h.analyze(start + Duration::from_secs(10), &config).unwrap();
        assert_eq!(p.access_count, 4);
        assert!((p.score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_history_has_no_pattern() {
        let h = AccessHistory::new(DataType::default(), 8);
        assert!(h.is_empty());
        assert!(h.analyze(Instant::now(), &StrategyManagerConfig::default()).is_none());
    }
}
