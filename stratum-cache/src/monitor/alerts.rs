//! Alert bookkeeping: dedup per (metric, tier), auto-resolution and the
//! manual lifecycle.

use std::collections::VecDeque;
use uuid::Uuid;

use stratum_core::{Alert, AlertLevel, AlertMetric, ValidationError};

/// Resolved alerts kept for inspection.
const RESOLVED_HISTORY: usize = 256;

/// A threshold breach found by one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Breach {
    pub metric: AlertMetric,
    pub tier: Option<String>,
    pub level: AlertLevel,
    pub threshold: f64,
    pub observed: f64,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct AlertBook {
    active: Vec<Alert>,
    resolved: VecDeque<Alert>,
}

impl AlertBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an alert unless one is already active for the same pair.
    /// An existing alert gets its observed value refreshed.
    pub fn raise(&mut self, breach: Breach) -> Option<Alert> {
        let tier = breach.tier.as_deref();
        if let Some(existing) = self.active.iter_mut().find(|a| a.concerns(breach.metric, tier)) {
            existing.observed_value = breach.observed;
            return None;
        }
        let alert = Alert::open(
            breach.metric,
            breach.tier,
            breach.level,
            breach.threshold,
            breach.observed,
            breach.message,
        );
        tracing::warn!(
            alert_id = %alert.id,
            metric = %alert.metric,
            tier = alert.tier.as_deref().unwrap_or("-"),
            observed = alert.observed_value,
            threshold = alert.threshold,
            "Alert opened"
        );
        self.active.push(alert.clone());
        Some(alert)
    }

    /// Resolve the active alert for a pair whose metric recovered.
    pub fn recover(&mut self, metric: AlertMetric, tier: Option<&str>) -> Option<Alert> {
        let idx = self.active.iter().position(|a| a.concerns(metric, tier))?;
        let mut alert = self.active.remove(idx);
        // active alerts are Open or Acknowledged, both resolvable
        if alert.resolve().is_err() {
            return None;
        }
        tracing::info!(alert_id = %alert.id, metric = %alert.metric, "Alert auto-resolved");
        self.archive(alert.clone());
        Some(alert)
    }

    pub fn acknowledge(&mut self, id: Uuid) -> Result<Alert, ValidationError> {
        if let Some(alert) = self.active.iter_mut().find(|a| a.id == id) {
            alert.acknowledge()?;
            tracing::info!(alert_id = %id, "Alert acknowledged");
            return Ok(alert.clone());
        }
        Err(self.missing_or_terminal(id, true))
    }

    pub fn resolve(&mut self, id: Uuid) -> Result<Alert, ValidationError> {
        if let Some(idx) = self.active.iter().position(|a| a.id == id) {
            let mut alert = self.active.remove(idx);
            alert.resolve()?;
            tracing::info!(alert_id = %id, "Alert resolved");
            self.archive(alert.clone());
            return Ok(alert);
        }
        Err(self.missing_or_terminal(id, false))
    }

    /// Pairs with an active alert.
    pub fn active_pairs(&self) -> Vec<(AlertMetric, Option<String>)> {
        self.active.iter().map(|a| (a.metric, a.tier.clone())).collect()
    }

    pub fn active(&self) -> Vec<Alert> {
        self.active.clone()
    }

    /// Active alerts followed by resolved history, newest resolved last.
    pub fn all(&self) -> Vec<Alert> {
        self.active.iter().chain(self.resolved.iter()).cloned().collect()
    }

    fn archive(&mut self, alert: Alert) {
        if self.resolved.len() == RESOLVED_HISTORY {
            self.resolved.pop_front();
        }
        self.resolved.push_back(alert);
    }

    fn missing_or_terminal(&self, id: Uuid, acknowledging: bool) -> ValidationError {
        let Some(alert) = self.resolved.iter().find(|a| a.id == id) else {
            return ValidationError::AlertNotFound { id };
        };
        let mut probe = alert.clone();
        let result = if acknowledging {
            probe.acknowledge()
        } else {
            probe.resolve()
        };
        result.err().unwrap_or(ValidationError::AlertNotFound { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::AlertState;

    fn breach(metric: AlertMetric, tier: Option<&str>, observed: f64) -> Breach {
        Breach {
            metric,
            tier: tier.map(str::to_string),
            level: AlertLevel::Warning,
            threshold: 0.5,
            observed,
            message: "test".into(),
        }
    }

    #[test]
    fn test_dedup_per_metric_and_tier() {
        let mut book = AlertBook::new();
        assert!(book.raise(breach(AlertMetric::HitRate, None, 0.2)).is_some());
        assert!(book.raise(breach(AlertMetric::HitRate, None, 0.1)).is_none());
        assert!(book.raise(breach(AlertMetric::ErrorRate, Some("edge"), 0.9)).is_some());
        assert!(book.raise(breach(AlertMetric::ErrorRate, Some("distributed"), 0.9)).is_some());
        assert_eq!(book.active().len(), 3);
        // refreshed in place
        assert_eq!(book.active()[0].observed_value, 0.1);
    }

    #[test]
    fn test_auto_resolve_and_reopen() {
        let mut book = AlertBook::new();
        let first = book.raise(breach(AlertMetric::Latency, None, 300.0)).unwrap();
        let resolved = book.recover(AlertMetric::Latency, None).unwrap();
        assert_eq!(resolved.id, first.id);
        assert_eq!(resolved.state, AlertState::Resolved);
        assert!(book.active().is_empty());
        assert!(book.recover(AlertMetric::Latency, None).is_none());

        let second = book.raise(breach(AlertMetric::Latency, None, 300.0)).unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(book.all().len(), 2);
    }

    #[test]
    fn test_acknowledged_still_dedups_and_auto_resolves() {
        let mut book = AlertBook::new();
        let alert = book.raise(breach(AlertMetric::HitRate, None, 0.2)).unwrap();
        let acked = book.acknowledge(alert.id).unwrap();
        assert_eq!(acked.state, AlertState::Acknowledged);
        assert!(book.raise(breach(AlertMetric::HitRate, None, 0.2)).is_none());

        let resolved = book.recover(AlertMetric::HitRate, None).unwrap();
        assert_eq!(resolved.state, AlertState::Resolved);
    }

    #[test]
    fn test_manual_transitions() {
        let mut book = AlertBook::new();
        let alert = book.raise(breach(AlertMetric::HitRate, None, 0.2)).unwrap();

        let resolved = book.resolve(alert.id).unwrap();
        assert_eq!(resolved.state, AlertState::Resolved);

        assert!(matches!(
            book.resolve(alert.id),
            Err(ValidationError::InvalidTransition { .. })
        ));
        assert!(matches!(
            book.acknowledge(alert.id),
            Err(ValidationError::InvalidTransition { .. })
        ));
        assert!(matches!(
            book.acknowledge(Uuid::now_v7()),
            Err(ValidationError::AlertNotFound { .. })
        ));
    }

    #[test]
    fn test_double_acknowledge_is_rejected() {
        let mut book = AlertBook::new();
        let alert = book.raise(breach(AlertMetric::ErrorRate, Some("edge"), 0.9)).unwrap();
        book.acknowledge(alert.id).unwrap();
        assert!(matches!(
            book.acknowledge(alert.id),
            Err(ValidationError::InvalidTransition { .. })
        ));
        assert_eq!(book.active().len(), 1);
    }
}
