//! Adaptive TTL.
//!
//! `ttl = clamp(base * f(class), min_ttl, base * max_multiplier)` where
//! `f(Hot)=2.0, f(Bursty)=1.5, f(Warm)=1.0, f(Cold)=0.5` and keys without a
//! pattern yet use 1.0. Tiers then scale the result by their own factor and
//! never go below `min_ttl`.

use std::time::Duration;

use stratum_core::AccessClass;

pub fn adaptive_ttl(
    base: Duration,
    class: Option<AccessClass>,
    min_ttl: Duration,
    max_multiplier: f64,
) -> Duration {
    let factor = class.map(|c| c.ttl_factor()).unwrap_or(1.0);
    let base_secs = base.as_secs_f64();
    let cap = (base_secs * max_multiplier).max(min_ttl.as_secs_f64());
    let secs = (base_secs * factor).clamp(min_ttl.as_secs_f64(), cap);
    Duration::from_secs_f64(secs)
}

/// TTL for one tier: `ttl * scale`, floored at `min_ttl`.
pub fn tier_ttl(ttl: Duration, scale: f64, min_ttl: Duration) -> Duration {
    let scaled = ttl.as_secs_f64() * scale.max(0.0);
    Duration::from_secs_f64(scaled).max(min_ttl)
}
