//! Performance alerts and their lifecycle
//!
//! State machine: `Open -> Acknowledged -> Resolved`, or `Open -> Resolved`
//! directly when the metric recovers. `Resolved` is terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::ValidationError;

/// Severity of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

/// Lifecycle state of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertState {
    Open,
    Acknowledged,
    Resolved,
}

impl AlertState {
    /// Open and acknowledged alerts both count as active.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Resolved)
    }
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "OPEN",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::Resolved => "RESOLVED",
        };
        f.write_str(s)
    }
}

/// Metric an alert watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    HitRate,
    Latency,
    ErrorRate,
    TierDegraded,
}

impl fmt::Display for AlertMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::HitRate => "hit_rate",
            Self::Latency => "latency",
            Self::ErrorRate => "error_rate",
            Self::TierDegraded => "tier_degraded",
        };
        f.write_str(s)
    }
}

/// A threshold breach raised by the performance monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub metric: AlertMetric,
    /// Tier the alert concerns, `None` for subsystem-wide metrics.
    pub tier: Option<String>,
    pub level: AlertLevel,
    pub threshold: f64,
    pub observed_value: f64,
    pub timestamp: DateTime<Utc>,
    pub state: AlertState,
    pub updated_at: DateTime<Utc>,
    pub message: String,
}

impl Alert {
    pub fn open(
        metric: AlertMetric,
        tier: Option<String>,
        level: AlertLevel,
        threshold: f64,
        observed_value: f64,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            metric,
            tier,
            level,
            threshold,
            observed_value,
            timestamp: now,
            state: AlertState::Open,
            updated_at: now,
            message: message.into(),
        }
    }

    /// Whether this alert belongs to the given (metric, tier) pair.
    pub fn concerns(&self, metric: AlertMetric, tier: Option<&str>) -> bool {
        self.metric == metric && self.tier.as_deref() == tier
    }

    /// `Open -> Acknowledged`.
    pub fn acknowledge(&mut self) -> Result<(), ValidationError> {
        match self.state {
            AlertState::Open => {
                self.transition(AlertState::Acknowledged);
                Ok(())
            }
            from => Err(self.invalid(from, AlertState::Acknowledged)),
        }
    }

    /// `Open | Acknowledged -> Resolved`.
    pub fn resolve(&mut self) -> Result<(), ValidationError> {
        match self.state {
            AlertState::Open | AlertState::Acknowledged => {
                self.transition(AlertState::Resolved);
                Ok(())
            }
            from => Err(self.invalid(from, AlertState::Resolved)),
        }
    }

    fn transition(&mut self, to: AlertState) {
        self.state = to;
        self.updated_at = Utc::now();
    }

    fn invalid(&self, from: AlertState, to: AlertState) -> ValidationError {
        ValidationError::InvalidTransition {
            id: self.id,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Alert {
        Alert::open(
            AlertMetric::HitRate,
            None,
            AlertLevel::Warning,
            0.5,
            0.3,
            "hit rate below floor",
        )
    }

    #[test]
    fn test_open_acknowledge_resolve() {
        let mut alert = sample();
        assert_eq!(alert.state, AlertState::Open);
        alert.acknowledge().unwrap();
        assert_eq!(alert.state, AlertState::Acknowledged);
        assert!(alert.state.is_active());
        alert.resolve().unwrap();
        assert_eq!(alert.state, AlertState::Resolved);
        assert!(!alert.state.is_active());
    }

    #[test]
    fn test_open_resolves_directly() {
        let mut alert = sample();
        alert.resolve().unwrap();
        assert_eq!(alert.state, AlertState::Resolved);
    }

    #[test]
    fn test_resolved_is_terminal() {
        let mut alert = sample();
        alert.resolve().unwrap();
        assert!(alert.resolve().is_err());
        assert!(alert.acknowledge().is_err());
    }

    #[test]
    fn test_acknowledge_twice_fails() {
        let mut alert = sample();
        alert.acknowledge().unwrap();
        let err = alert.acknowledge().unwrap_err();
        assert!(matches!(err, ValidationError::InvalidTransition { .. }));
    }

    #[test]
    fn test_concerns_matches_metric_and_tier() {
        let alert = Alert::open(
            AlertMetric::TierDegraded,
            Some("distributed".to_string()),
            AlertLevel::Critical,
            1.0,
            1.0,
            "degraded",
        );
        assert!(alert.concerns(AlertMetric::TierDegraded, Some("distributed")));
        assert!(!alert.concerns(AlertMetric::TierDegraded, Some("edge")));
        assert!(!alert.concerns(AlertMetric::ErrorRate, Some("distributed")));
    }
}
