//! Access pattern classification

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Classification of how a key or data type is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessClass {
    Hot,
    Warm,
    Cold,
    Bursty,
}

impl AccessClass {
    /// TTL multiplier applied to the base TTL for this class.
    pub fn ttl_factor(&self) -> f64 {
        match self {
            Self::Hot => 2.0,
            Self::Bursty => 1.5,
            Self::Warm => 1.0,
            Self::Cold => 0.5,
        }
    }

    /// Whether keys of this class are eligible for prefetching.
    pub fn prefetchable(&self) -> bool {
        matches!(self, Self::Hot | Self::Bursty)
    }
}

impl fmt::Display for AccessClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
            Self::Bursty => "bursty",
        };
        f.write_str(s)
    }
}

/// Reduced view of an access history, produced by the analysis pass.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessPattern {
    pub class: AccessClass,
    /// Total accesses retained in the history.
    pub access_count: usize,
    /// Accesses inside the analysis window.
    pub recent_accesses: usize,
    /// `recent_accesses / history capacity`, in [0, 1].
    pub score: f64,
    /// Accesses per minute inside the analysis window.
    pub frequency_per_min: f64,
    /// Exponential moving average of inter-access intervals.
    pub ema_interval: Option<Duration>,
    /// Coefficient of variation of inter-access intervals.
    pub interval_cv: f64,
    pub last_access: Instant,
}

impl AccessPattern {
    /// Expected time of the next access, when there is an interval estimate.
    pub fn predicted_next_access(&self) -> Option<Instant> {
        self.ema_interval.map(|ema| self.last_access + ema)
    }

    /// Time since the last access.
    pub fn recency(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_factors_are_ordered() {
        assert!(AccessClass::Hot.ttl_factor() > AccessClass::Bursty.ttl_factor());
        assert!(AccessClass::Bursty.ttl_factor() > AccessClass::Warm.ttl_factor());
        assert!(AccessClass::Warm.ttl_factor() > AccessClass::Cold.ttl_factor());
    }

    #[test]
    fn test_prefetchable_classes() {
        assert!(AccessClass::Hot.prefetchable());
        assert!(AccessClass::Bursty.prefetchable());
        assert!(!AccessClass::Warm.prefetchable());
        assert!(!AccessClass::Cold.prefetchable());
    }

    #[test]
    fn test_predicted_next_access() {
        let now = Instant::now();
        let pattern = AccessPattern {
            class: AccessClass::Hot,
            access_count: 5,
            recent_accesses: 5,
            score: 0.5,
            frequency_per_min: 12.0,
            ema_interval: Some(Duration::from_secs(5)),
            interval_cv: 0.1,
            last_access: now,
        };
        assert_eq!(pattern.predicted_next_access(), Some(now + Duration::from_secs(5)));
        assert_eq!(pattern.recency(now + Duration::from_secs(2)), Duration::from_secs(2));
    }
}
