//! Performance monitor
//!
//! Ingests [`MetricEvent`]s from the coordinator and tiers into rolling
//! buckets, evaluates alert thresholds and produces health reports.
//! Recording takes one short lock; evaluation aggregates a copy of the
//! window first and never holds the window lock while judging thresholds.

mod alerts;
mod report;
mod window;

use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use uuid::Uuid;

use stratum_core::{
    Alert, AlertLevel, AlertMetric, AlertThresholds, HealthStatus, MonitorConfig,
    PerformanceSnapshot, StratumResult, TierSnapshot,
};

pub use alerts::{AlertBook, Breach};
pub use report::{availability, health_score, trend, PerformanceReport, Trend};
pub use window::{MetricsWindow, TierWindowStats, WindowMetrics};

/// Outcome of one tier call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierOutcome {
    Hit,
    Miss,
    Error,
    Write,
}

/// A single observation from the request path or a background task.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    /// One coordinator `get`, end to end.
    Request {
        hit: bool,
        stale: bool,
        failed: bool,
        latency: Duration,
    },
    TierCall {
        tier: String,
        outcome: TierOutcome,
        latency: Duration,
    },
    Eviction {
        tier: String,
        count: u64,
    },
    TierHealth {
        tier: String,
        status: HealthStatus,
    },
    /// A backfill was dropped because the worker queue was full.
    BackgroundDropped,
    QueueDepth(usize),
}

/// Alerts opened and resolved by one evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertCheck {
    pub opened: Vec<Alert>,
    pub resolved: Vec<Alert>,
}

enum Verdict {
    Breach(Breach),
    Recovered,
    Unknown,
}

pub struct PerformanceMonitor {
    config: MonitorConfig,
    window: Mutex<MetricsWindow>,
    tier_health: RwLock<BTreeMap<String, HealthStatus>>,
    alerts: Mutex<AlertBook>,
    snapshots: Mutex<VecDeque<PerformanceSnapshot>>,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let window = MetricsWindow::new(
            crate::now(),
            config.bucket_width(),
            config.retained_buckets,
            config.latency_samples_per_bucket,
        );
        Self {
            config,
            window: Mutex::new(window),
            tier_health: RwLock::new(BTreeMap::new()),
            alerts: Mutex::new(AlertBook::new()),
            snapshots: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn thresholds(&self) -> &AlertThresholds {
        &self.config.thresholds
    }

    /// Start tracking a tier as healthy.
    pub fn register_tier(&self, tier: &str) {
        if let Ok(mut health) = self.tier_health.write() {
            health.entry(tier.to_string()).or_insert(HealthStatus::Healthy);
        }
    }

    pub fn record(&self, event: MetricEvent) {
        if let MetricEvent::TierHealth { tier, status } = &event {
            if let Ok(mut health) = self.tier_health.write() {
                health.insert(tier.clone(), *status);
            }
            return;
        }
        let now = crate::now();
        if let Ok(mut window) = self.window.lock() {
            window.record(&event, now);
        }
    }

    pub fn real_time_metrics(&self) -> WindowMetrics {
        self.historical_metrics(self.config.realtime_window())
    }

    pub fn historical_metrics(&self, window: Duration) -> WindowMetrics {
        let now = crate::now();
        self.window
            .lock()
            .map(|w| w.aggregate(window, now))
            .unwrap_or_default()
    }

    pub fn tier_health(&self) -> BTreeMap<String, HealthStatus> {
        self.tier_health.read().map(|h| h.clone()).unwrap_or_default()
    }

    // ========================================================================
    // Alerts
    // ========================================================================

    /// Evaluate every threshold against the real-time window.
    pub fn check_alerts(&self) -> AlertCheck {
        let metrics = self.real_time_metrics();
        let health = self.tier_health();
        let verdicts = self.evaluate(&metrics, &health);

        let mut check = AlertCheck::default();
        let Ok(mut book) = self.alerts.lock() else {
            return check;
        };
        for (metric, tier, verdict) in verdicts {
            match verdict {
                Verdict::Breach(breach) => {
                    if let Some(alert) = book.raise(breach) {
                        check.opened.push(alert);
                    }
                }
                Verdict::Recovered => {
                    if let Some(alert) = book.recover(metric, tier.as_deref()) {
                        check.resolved.push(alert);
                    }
                }
                Verdict::Unknown => {}
            }
        }
        check
    }

    fn evaluate(
        &self,
        metrics: &WindowMetrics,
        health: &BTreeMap<String, HealthStatus>,
    ) -> Vec<(AlertMetric, Option<String>, Verdict)> {
        let t = self.thresholds();
        let mut verdicts = Vec::new();

        let hit_rate = metrics.hit_rate();
        let verdict = if metrics.requests < t.min_requests {
            Verdict::Unknown
        } else if hit_rate < t.hit_rate_floor {
            Verdict::Breach(Breach {
                metric: AlertMetric::HitRate,
                tier: None,
                level: if hit_rate < t.hit_rate_floor / 2.0 {
                    AlertLevel::Critical
                } else {
                    AlertLevel::Warning
                },
                threshold: t.hit_rate_floor,
                observed: hit_rate,
                message: format!("Hit rate {:.1}% below floor", hit_rate * 100.0),
            })
        } else {
            Verdict::Recovered
        };
        verdicts.push((AlertMetric::HitRate, None, verdict));

        let p95 = metrics.latency.p95_ms;
        let verdict = if metrics.latency.samples == 0 {
            Verdict::Unknown
        } else if p95 > t.latency_ceiling_ms {
            Verdict::Breach(Breach {
                metric: AlertMetric::Latency,
                tier: None,
                level: if p95 > t.latency_ceiling_ms * 2.0 {
                    AlertLevel::Critical
                } else {
                    AlertLevel::Warning
                },
                threshold: t.latency_ceiling_ms,
                observed: p95,
                message: format!("p95 latency {p95:.1}ms above ceiling"),
            })
        } else {
            Verdict::Recovered
        };
        verdicts.push((AlertMetric::Latency, None, verdict));

        for (tier, stats) in &metrics.tiers {
            let rate = stats.error_rate();
            let verdict = if stats.calls() < t.min_requests {
                Verdict::Unknown
            } else if rate > t.error_rate_ceiling {
                Verdict::Breach(Breach {
                    metric: AlertMetric::ErrorRate,
                    tier: Some(tier.clone()),
                    level: AlertLevel::Warning,
                    threshold: t.error_rate_ceiling,
                    observed: rate,
                    message: format!("Tier {tier} error rate {:.1}%", rate * 100.0),
                })
            } else {
                Verdict::Recovered
            };
            verdicts.push((AlertMetric::ErrorRate, Some(tier.clone()), verdict));
        }

        for (tier, status) in health {
            let verdict = if !status.is_degraded() {
                Verdict::Recovered
            } else if t.alert_on_degraded {
                Verdict::Breach(Breach {
                    metric: AlertMetric::TierDegraded,
                    tier: Some(tier.clone()),
                    level: match status {
                        HealthStatus::Unhealthy => AlertLevel::Critical,
                        _ => AlertLevel::Warning,
                    },
                    threshold: 0.0,
                    observed: 1.0,
                    message: format!("Tier {tier} is {status}"),
                })
            } else {
                Verdict::Unknown
            };
            verdicts.push((AlertMetric::TierDegraded, Some(tier.clone()), verdict));
        }

        verdicts
    }

    pub fn acknowledge_alert(&self, id: Uuid) -> StratumResult<Alert> {
        let mut book = self.lock_alerts()?;
        Ok(book.acknowledge(id)?)
    }

    pub fn resolve_alert(&self, id: Uuid) -> StratumResult<Alert> {
        let mut book = self.lock_alerts()?;
        Ok(book.resolve(id)?)
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|b| b.active()).unwrap_or_default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|b| b.all()).unwrap_or_default()
    }

    fn lock_alerts(&self) -> StratumResult<std::sync::MutexGuard<'_, AlertBook>> {
        self.alerts.lock().map_err(|_| {
            stratum_core::TierError::LockPoisoned {
                tier: "monitor".to_string(),
            }
            .into()
        })
    }

    // ========================================================================
    // Snapshots and reports
    // ========================================================================

    /// Record an immutable snapshot of the current window plus tier stats.
    pub fn capture_snapshot(&self, tiers: Vec<TierSnapshot>) -> PerformanceSnapshot {
        let metrics = self.real_time_metrics();
        let snapshot = PerformanceSnapshot {
            timestamp: Utc::now(),
            tiers,
            overall_hit_rate: metrics.hit_rate(),
            requests: metrics.requests,
            latency: metrics.latency,
        };
        if let Ok(mut ring) = self.snapshots.lock() {
            if ring.len() >= self.config.snapshot_history.max(1) {
                ring.pop_front();
            }
            ring.push_back(snapshot.clone());
        }
        snapshot
    }

    pub fn snapshots(&self) -> Vec<PerformanceSnapshot> {
        self.snapshots
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Composite health score over the real-time window.
    pub fn health_score(&self) -> f64 {
        let metrics = self.real_time_metrics();
        health_score(&metrics, availability(&self.tier_health()), self.thresholds())
    }

    pub fn generate_performance_report(&self, window: Duration) -> PerformanceReport {
        let now = crate::now();
        let (metrics, (first, second)) = match self.window.lock() {
            Ok(w) => (w.aggregate(window, now), w.halves(window, now)),
            Err(_) => Default::default(),
        };
        let tier_health = self.tier_health();
        let avail = availability(&tier_health);
        let thresholds = self.thresholds();

        let half_score = |m: &WindowMetrics| {
            (m.requests > 0).then(|| health_score(m, avail, thresholds))
        };

        PerformanceReport {
            generated_at: Utc::now(),
            window_secs: window.as_secs(),
            health_score: health_score(&metrics, avail, thresholds),
            trend: trend(half_score(&first), half_score(&second)),
            recommendations: report::recommendations(&metrics, &tier_health, thresholds),
            active_alerts: self.active_alerts(),
            tier_health,
            metrics,
        }
    }
}

impl std::fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("config", &self.config)
            .field("tier_health", &self.tier_health())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::{AlertState, StratumError, ValidationError};

    fn monitor() -> PerformanceMonitor {
        PerformanceMonitor::new(MonitorConfig {
            thresholds: AlertThresholds {
                min_requests: 10,
                ..AlertThresholds::default()
            },
            ..MonitorConfig::default()
        })
    }

    fn requests(m: &PerformanceMonitor, n: usize, hit: bool, ms: u64) {
        for _ in 0..n {
            m.record(MetricEvent::Request {
                hit,
                stale: false,
                failed: false,
                latency: Duration::from_millis(ms),
            });
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_rate_alert_dedup_and_self_heal() {
        let m = monitor();
        requests(&m, 20, false, 1);

        let first = m.check_alerts();
        assert_eq!(first.opened.len(), 1);
        assert_eq!(first.opened[0].metric, AlertMetric::HitRate);
        assert_eq!(first.opened[0].level, AlertLevel::Critical);

        // repeated breaches never duplicate
        requests(&m, 20, false, 1);
        assert!(m.check_alerts().opened.is_empty());
        assert_eq!(m.active_alerts().len(), 1);

        // roll the window past the misses, then recover
        tokio::time::advance(Duration::from_secs(120)).await;
        requests(&m, 50, true, 1);
        let healed = m.check_alerts();
        assert_eq!(healed.resolved.len(), 1);
        assert_eq!(healed.resolved[0].state, AlertState::Resolved);
        assert!(m.active_alerts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_alert_below_min_requests() {
        let m = monitor();
        requests(&m, 5, false, 1);
        assert!(m.check_alerts().opened.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_alert() {
        let m = monitor();
        requests(&m, 20, true, 150);
        let check = m.check_alerts();
        assert_eq!(check.opened.len(), 1);
        assert_eq!(check.opened[0].metric, AlertMetric::Latency);
        assert_eq!(check.opened[0].level, AlertLevel::Warning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_tier_alert_once() {
        let m = monitor();
        m.register_tier("memory");
        m.register_tier("distributed");

        for status in [HealthStatus::Degraded, HealthStatus::Unhealthy, HealthStatus::Degraded] {
            m.record(MetricEvent::TierHealth {
                tier: "distributed".into(),
                status,
            });
            m.check_alerts();
        }
        let degraded: Vec<Alert> = m
            .alerts()
            .into_iter()
            .filter(|a| a.metric == AlertMetric::TierDegraded)
            .collect();
        assert_eq!(degraded.len(), 1);
        assert_eq!(degraded[0].tier.as_deref(), Some("distributed"));

        m.record(MetricEvent::TierHealth {
            tier: "distributed".into(),
            status: HealthStatus::Healthy,
        });
        assert_eq!(m.check_alerts().resolved.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tier_error_rate_alert() {
        let m = monitor();
        for i in 0..20 {
            m.record(MetricEvent::TierCall {
                tier: "edge".into(),
                outcome: if i % 2 == 0 { TierOutcome::Error } else { TierOutcome::Miss },
                latency: Duration::from_millis(2),
            });
        }
        let check = m.check_alerts();
        assert_eq!(check.opened.len(), 1);
        assert_eq!(check.opened[0].metric, AlertMetric::ErrorRate);
        assert_eq!(check.opened[0].tier.as_deref(), Some("edge"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_lifecycle_through_monitor() {
        let m = monitor();
        requests(&m, 20, false, 1);
        let alert = m.check_alerts().opened.remove(0);

        let acked = m.acknowledge_alert(alert.id).unwrap();
        assert_eq!(acked.state, AlertState::Acknowledged);
        let resolved = m.resolve_alert(alert.id).unwrap();
        assert_eq!(resolved.state, AlertState::Resolved);

        let err = m.resolve_alert(Uuid::now_v7()).unwrap_err();
        assert!(matches!(
            err,
            StratumError::Validation(ValidationError::AlertNotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_and_trend() {
        let m = monitor();
        m.register_tier("memory");
        requests(&m, 30, false, 1);
        tokio::time::advance(Duration::from_secs(40)).await;
        requests(&m, 20, true, 1);

        let report = m.generate_performance_report(Duration::from_secs(60));
        assert_eq!(report.metrics.requests, 50);
        assert_eq!(report.trend, Trend::Improving);
        assert!((0.0..=100.0).contains(&report.health_score));
        assert_eq!(report.tier_health.len(), 1);
        assert!(!report.recommendations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_ring_is_bounded() {
        let m = PerformanceMonitor::new(MonitorConfig {
            snapshot_history: 2,
            ..MonitorConfig::default()
        });
        requests(&m, 4, true, 1);
        for _ in 0..3 {
            m.capture_snapshot(Vec::new());
        }
        let snaps = m.snapshots();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[1].requests, 4);
        assert_eq!(snaps[1].overall_hit_rate, 1.0);
    }
}
