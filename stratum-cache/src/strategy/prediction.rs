//! Prefetch and invalidation prediction.

use std::time::{Duration, Instant};

use stratum_core::AccessPattern;

/// EMA of the interval between updates (`Set`/`Delete`) of one data type.
#[derive(Debug, Clone, Default)]
pub struct UpdateRate {
    last: Option<Instant>,
    ema_secs: Option<f64>,
    updates: u64,
}

impl UpdateRate {
    pub fn observe(&mut self, at: Instant, alpha: f64) {
        if let Some(last) = self.last {
            let d = at.saturating_duration_since(last).as_secs_f64();
            self.ema_secs = Some(match self.ema_secs {
                Some(e) => alpha * d + (1.0 - alpha) * e,
                None => d,
            });
        }
        self.last = Some(at);
        self.updates += 1;
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn mean_interval(&self) -> Option<Duration> {
        self.ema_secs.map(Duration::from_secs_f64)
    }

    /// Probability that a value filled `age` ago has been superseded:
    /// `1 - exp(-age / u)`. Zero until two updates have been seen.
    pub fn stale_probability(&self, age: Duration) -> f64 {
        match self.ema_secs {
            None => 0.0,
            Some(u) if u <= f64::EPSILON => 1.0,
            Some(u) => 1.0 - (-age.as_secs_f64() / u).exp(),
        }
    }
}

/// Whether a key should be warmed ahead of its predicted next access.
pub fn should_prefetch(
    pattern: &AccessPattern,
    now: Instant,
    lookahead: Duration,
    threshold: f64,
    already_warmed_for: Option<Instant>,
) -> bool {
    if !pattern.class.prefetchable() || pattern.score < threshold {
        return false;
    }
    let Some(predicted) = pattern.predicted_next_access() else {
        return false;
    };
    if already_warmed_for == Some(predicted) {
        return false;
    }
    predicted >= now && predicted.duration_since(now) <= lookahead
}
