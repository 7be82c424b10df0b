//! Rolling time-bucketed metric storage.

use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use stratum_core::LatencyPercentiles;

use super::{MetricEvent, TierOutcome};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierWindowStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub writes: u64,
    pub evictions: u64,
    pub latency_us: u64,
}

impl TierWindowStats {
    pub fn calls(&self) -> u64 {
        self.hits + self.misses + self.errors + self.writes
    }

    pub fn error_rate(&self) -> f64 {
        match self.calls() {
            0 => 0.0,
            n => self.errors as f64 / n as f64,
        }
    }

    pub fn mean_latency_ms(&self) -> f64 {
        match self.calls() {
            0 => 0.0,
            n => self.latency_us as f64 / n as f64 / 1_000.0,
        }
    }

    fn merge(&mut self, other: &TierWindowStats) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.errors += other.errors;
        self.writes += other.writes;
        self.evictions += other.evictions;
        self.latency_us += other.latency_us;
    }
}

/// Aggregated view over a span of buckets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowMetrics {
    pub window_secs: u64,
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub stale_served: u64,
    pub failures: u64,
    pub latency: LatencyPercentiles,
    pub tiers: BTreeMap<String, TierWindowStats>,
    pub background_dropped: u64,
    pub max_queue_depth: usize,
}

impl WindowMetrics {
    /// Fraction of requests answered from a cache tier. 1.0 with no traffic.
    pub fn hit_rate(&self) -> f64 {
        match self.requests {
            0 => 1.0,
            n => self.hits as f64 / n as f64,
        }
    }

    /// Error rate across every tier call in the window.
    pub fn error_rate(&self) -> f64 {
        let (errors, calls) = self
            .tiers
            .values()
            .fold((0, 0), |(e, c), t| (e + t.errors, c + t.calls()));
        match calls {
            0 => 0.0,
            n => errors as f64 / n as f64,
        }
    }
}

#[derive(Debug, Default)]
struct Bucket {
    epoch: u64,
    requests: u64,
    hits: u64,
    misses: u64,
    stale: u64,
    failures: u64,
    dropped: u64,
    max_queue_depth: usize,
    latencies_us: Vec<u64>,
    latency_seen: u64,
    tiers: HashMap<String, TierWindowStats>,
}

impl Bucket {
    fn sample_latency(&mut self, micros: u64, cap: usize) {
        self.latency_seen += 1;
        if self.latencies_us.len() < cap {
            self.latencies_us.push(micros);
        } else {
            // reservoir sampling keeps a uniform sample of the bucket
            let j = rand::rng().random_range(0..self.latency_seen);
            if let Some(slot) = self.latencies_us.get_mut(j as usize) {
                *slot = micros;
            }
        }
    }
}

#[derive(Debug)]
pub struct MetricsWindow {
    origin: Instant,
    width: Duration,
    retained: usize,
    samples_cap: usize,
    buckets: VecDeque<Bucket>,
}

impl MetricsWindow {
    pub fn new(origin: Instant, width: Duration, retained: usize, samples_cap: usize) -> Self {
        Self {
            origin,
            width: width.max(Duration::from_millis(1)),
            retained: retained.max(1),
            samples_cap: samples_cap.max(1),
            buckets: VecDeque::new(),
        }
    }

    fn epoch(&self, at: Instant) -> u64 {
        (at.saturating_duration_since(self.origin).as_nanos() / self.width.as_nanos()) as u64
    }

    fn current(&mut self, now: Instant) -> &mut Bucket {
        let epoch = self.epoch(now);
        if self.buckets.back().map(|b| b.epoch) != Some(epoch) {
            self.buckets.push_back(Bucket {
                epoch,
                ..Bucket::default()
            });
            let oldest = epoch.saturating_sub(self.retained as u64 - 1);
            while self.buckets.front().is_some_and(|b| b.epoch < oldest) {
                self.buckets.pop_front();
            }
        }
        // just pushed when empty
        let idx = self.buckets.len() - 1;
        &mut self.buckets[idx]
    }

    pub fn record(&mut self, event: &MetricEvent, now: Instant) {
        let cap = self.samples_cap;
        let bucket = self.current(now);
        match event {
            MetricEvent::Request { hit, stale, failed, latency } => {
                bucket.requests += 1;
                if *failed {
                    bucket.failures += 1;
                } else if *hit {
                    bucket.hits += 1;
                } else {
                    bucket.misses += 1;
                }
                if *stale {
                    bucket.stale += 1;
                }
                bucket.sample_latency(latency.as_micros() as u64, cap);
            }
            MetricEvent::TierCall { tier, outcome, latency } => {
                let stats = bucket.tiers.entry(tier.clone()).or_default();
                stats.latency_us += latency.as_micros() as u64;
                match outcome {
                    TierOutcome::Hit => stats.hits += 1,
                    TierOutcome::Miss => stats.misses += 1,
                    TierOutcome::Error => stats.errors += 1,
                    TierOutcome::Write => stats.writes += 1,
                }
            }
            MetricEvent::Eviction { tier, count } => {
                bucket.tiers.entry(tier.clone()).or_default().evictions += count;
            }
            MetricEvent::BackgroundDropped => bucket.dropped += 1,
            MetricEvent::QueueDepth(depth) => {
                bucket.max_queue_depth = bucket.max_queue_depth.max(*depth);
            }
            MetricEvent::TierHealth { .. } => {}
        }
    }

    /// Aggregate the buckets covering the last `window` ending at `now`.
    pub fn aggregate(&self, window: Duration, now: Instant) -> WindowMetrics {
        let to = self.epoch(now);
        let span = (window.as_nanos() / self.width.as_nanos()).max(1) as u64;
        let from = to.saturating_sub(span - 1);
        self.aggregate_epochs(from, to, window)
    }

    /// Aggregate the two halves of `window` ending at `now`, oldest first.
    pub fn halves(&self, window: Duration, now: Instant) -> (WindowMetrics, WindowMetrics) {
        let to = self.epoch(now);
        let span = (window.as_nanos() / self.width.as_nanos()).max(2) as u64;
        let from = to.saturating_sub(span - 1);
        let mid = from + span / 2;
        let half = window / 2;
        (
            self.aggregate_epochs(from, mid.saturating_sub(1), half),
            self.aggregate_epochs(mid, to, half),
        )
    }

    fn aggregate_epochs(&self, from: u64, to: u64, window: Duration) -> WindowMetrics {
        let mut out = WindowMetrics {
            window_secs: window.as_secs(),
            ..WindowMetrics::default()
        };
        let mut samples = Vec::new();
        for b in self.buckets.iter().filter(|b| b.epoch >= from && b.epoch <= to) {
            out.requests += b.requests;
            out.hits += b.hits;
            out.misses += b.misses;
            out.stale_served += b.stale;
            out.failures += b.failures;
            out.background_dropped += b.dropped;
            out.max_queue_depth = out.max_queue_depth.max(b.max_queue_depth);
            samples.extend_from_slice(&b.latencies_us);
            for (tier, stats) in &b.tiers {
                out.tiers.entry(tier.clone()).or_default().merge(stats);
            }
        }
        out.latency = LatencyPercentiles::from_micros(&mut samples);
        out
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
