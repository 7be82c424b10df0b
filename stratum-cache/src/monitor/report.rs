//! Health score, trend and performance report.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use stratum_core::constants::{
    HEALTH_WEIGHT_AVAILABILITY, HEALTH_WEIGHT_ERRORS, HEALTH_WEIGHT_HIT_RATE, HEALTH_WEIGHT_LATENCY,
};
use stratum_core::{Alert, AlertThresholds, HealthStatus};

use super::WindowMetrics;

/// Score delta between window halves that counts as a trend.
const TREND_DELTA: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub window_secs: u64,
    pub metrics: WindowMetrics,
    pub health_score: f64,
    pub trend: Trend,
    pub tier_health: BTreeMap<String, HealthStatus>,
    pub active_alerts: Vec<Alert>,
    pub recommendations: Vec<String>,
}

/// Fraction of known tiers that are not degraded. 1.0 with no tiers.
pub fn availability(tiers: &BTreeMap<String, HealthStatus>) -> f64 {
    if tiers.is_empty() {
        return 1.0;
    }
    let healthy = tiers.values().filter(|s| !s.is_degraded()).count();
    healthy as f64 / tiers.len() as f64
}

/// `100 * (0.40 H + 0.25 L + 0.20 E + 0.15 A)`, clamped to [0, 100].
pub fn health_score(metrics: &WindowMetrics, availability: f64, thresholds: &AlertThresholds) -> f64 {
    let h = metrics.hit_rate().clamp(0.0, 1.0);

    let l = if metrics.latency.samples == 0 || metrics.latency.p95_ms <= 0.0 {
        1.0
    } else {
        (thresholds.latency_ceiling_ms / metrics.latency.p95_ms).min(1.0)
    };

    let e = if thresholds.error_rate_ceiling <= 0.0 {
        if metrics.error_rate() > 0.0 { 0.0 } else { 1.0 }
    } else {
        (1.0 - metrics.error_rate() / (2.0 * thresholds.error_rate_ceiling)).clamp(0.0, 1.0)
    };

    let a = availability.clamp(0.0, 1.0);

    let score = 100.0
        * (HEALTH_WEIGHT_HIT_RATE * h
            + HEALTH_WEIGHT_LATENCY * l
            + HEALTH_WEIGHT_ERRORS * e
            + HEALTH_WEIGHT_AVAILABILITY * a);
    if score.is_finite() {
        score.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Compare scores of the older and newer half of a window.
pub fn trend(first: Option<f64>, second: Option<f64>) -> Trend {
    match (first, second) {
        (Some(a), Some(b)) if b - a > TREND_DELTA => Trend::Improving,
        (Some(a), Some(b)) if a - b > TREND_DELTA => Trend::Degrading,
        _ => Trend::Stable,
    }
}

pub fn recommendations(
    metrics: &WindowMetrics,
    tier_health: &BTreeMap<String, HealthStatus>,
    thresholds: &AlertThresholds,
) -> Vec<String> {
    let mut out = Vec::new();
    if metrics.requests >= thresholds.min_requests && metrics.hit_rate() < thresholds.hit_rate_floor {
        out.push(format!(
            "Hit rate {:.1}% is below {:.1}%: raise base TTLs or add warmup schedules for hot keys",
            metrics.hit_rate() * 100.0,
            thresholds.hit_rate_floor * 100.0
        ));
    }
    if metrics.latency.samples > 0 && metrics.latency.p95_ms > thresholds.latency_ceiling_ms {
        out.push(format!(
            "p95 latency {:.1}ms exceeds {:.1}ms: check slow tiers and loader cost",
            metrics.latency.p95_ms, thresholds.latency_ceiling_ms
        ));
    }
    for (tier, stats) in &metrics.tiers {
        if stats.calls() > 0 && stats.error_rate() > thresholds.error_rate_ceiling {
            out.push(format!(
                "Tier {tier} error rate {:.1}%: inspect its backend",
                stats.error_rate() * 100.0
            ));
        }
    }
    for (tier, status) in tier_health {
        if status.is_degraded() {
            out.push(format!("Tier {tier} is {status}: excluded from warmup until it recovers"));
        }
    }
    if metrics.background_dropped > 0 {
        out.push(format!(
            "{} background tasks were dropped: increase worker queue capacity",
            metrics.background_dropped
        ));
    }
    if metrics.stale_served > 0 {
        out.push(format!(
            "{} stale values served after loader failures",
            metrics.stale_served
        ));
    }
    out
}
